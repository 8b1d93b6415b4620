//! `WatchRule`: namespaced CRD selecting resources whose mutations are
//! mirrored to a `GitTarget` in the same (or an explicitly allowed)
//! namespace.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gitmirror.io",
    version = "v1alpha1",
    kind = "WatchRule",
    namespaced,
    status = "WatchRuleStatus",
    shortname = "wr"
)]
pub struct WatchRuleSpec {
    /// Destination this rule routes matched events to. Defaults to the
    /// rule's own namespace when omitted.
    pub destination_ref: DestinationRef,
    pub rules: Vec<RuleBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DestinationRef {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RuleBlock {
    /// `(apiGroup, apiVersion, resource)` matchers; each field supports
    /// `prefix*` / `*suffix` globs and a bare `*` meaning "any".
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    /// `CREATE` / `UPDATE` / `DELETE`; absent means all operations match.
    pub operations: Option<Vec<String>>,
    pub label_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WatchRuleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
