//! `ClusterWatchRule`: cluster-scoped twin of `WatchRule`. Because it has
//! no home namespace of its own, its destination reference MUST name one
//! explicitly.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use super::watch_rule::RuleBlock;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gitmirror.io",
    version = "v1alpha1",
    kind = "ClusterWatchRule",
    status = "ClusterWatchRuleStatus",
    shortname = "cwr"
)]
pub struct ClusterWatchRuleSpec {
    pub destination_ref: ClusterDestinationRef,
    pub rules: Vec<RuleBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterDestinationRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ClusterWatchRuleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
