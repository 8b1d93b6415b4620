//! `GitTarget`: a branch + base path on top of a `GitProvider`, with an
//! optional encryption block for Secret objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gitmirror.io",
    version = "v1alpha1",
    kind = "GitTarget",
    namespaced,
    status = "GitTargetStatus",
    shortname = "gt"
)]
pub struct GitTargetSpec {
    pub provider_ref: ProviderRef,
    pub branch: String,
    #[serde(default)]
    pub base_path: String,
    pub encryption: Option<EncryptionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderRef {
    /// Defaults to this `GitTarget`'s own namespace when omitted.
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EncryptionSpec {
    /// `Secret` holding `identity.agekey` (and optionally a pre-extracted
    /// recipient); generated lazily on first encrypted write if absent.
    pub secret_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GitTargetStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
}
