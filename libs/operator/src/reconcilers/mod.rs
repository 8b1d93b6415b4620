//! The four CRD reconcilers: `WatchRule`/`ClusterWatchRule`
//! compile into the Rule Store; `GitProvider`/`GitTarget` validate their
//! own configuration and publish a `Ready` condition. None of them drain
//! the Event Queue — that's the dispatcher's job.

pub mod git_provider;
pub mod git_target;
pub mod rule;

use std::sync::Arc;

use crate::rules::RuleStore;

/// Shared reconciler context. Deliberately narrow: each CRD kind's
/// reconciler needs only the client and (for the rule kinds) the Rule
/// Store it publishes into.
#[derive(Clone)]
pub struct Context {
    pub client: kube::Client,
    pub rule_store: Arc<RuleStore>,
}
