//! `GitProvider`: a Git remote connection plus the access policy
//! governing which namespaces' `WatchRule`s may bind to targets built on
//! top of it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gitmirror.io",
    version = "v1alpha1",
    kind = "GitProvider",
    namespaced,
    status = "GitProviderStatus",
    shortname = "gp"
)]
pub struct GitProviderSpec {
    pub url: String,
    /// Name of a `Secret` in this `GitProvider`'s namespace holding one of
    /// `{username,password}`, `{bearerToken}`, or `{identity,known_hosts}`.
    pub auth_secret_ref: String,
    /// Glob patterns (`release/*`, `main`, ...) a `GitTarget`'s `branch`
    /// must match one of.
    pub allowed_branches: Vec<String>,
    #[serde(default)]
    pub push_strategy: PushStrategySpec,
    #[serde(default)]
    pub access_policy: AccessPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PushStrategySpec {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_max_commits() -> usize {
    20
}

impl Default for PushStrategySpec {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_commits: default_max_commits(),
        }
    }
}

/// Which namespaces' `WatchRule`s may bind a destination built on this
/// provider. `selector` is only meaningful (and only valid) under
/// `FromSelector` — the reconciler rejects a selector set under any
/// other mode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode")]
pub enum AccessPolicy {
    SameNamespace,
    AllNamespaces,
    FromSelector { selector: LabelSelector },
}

impl Default for AccessPolicy {
    fn default() -> Self {
        AccessPolicy::SameNamespace
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GitProviderStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
