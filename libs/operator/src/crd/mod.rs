//! CRD types: two rule kinds (`WatchRule`, `ClusterWatchRule`) and two
//! destination kinds (`GitProvider`, `GitTarget`), each carrying a
//! standard `status.conditions` list (see `conditions`).

pub mod cluster_watch_rule;
pub mod conditions;
pub mod git_provider;
pub mod git_target;
pub mod watch_rule;

pub use cluster_watch_rule::{ClusterDestinationRef, ClusterWatchRule, ClusterWatchRuleSpec, ClusterWatchRuleStatus};
pub use git_provider::{AccessPolicy, GitProvider, GitProviderSpec, GitProviderStatus, PushStrategySpec};
pub use git_target::{EncryptionSpec, GitTarget, GitTargetSpec, GitTargetStatus, ProviderRef};
pub use watch_rule::{DestinationRef, RuleBlock, WatchRule, WatchRuleSpec, WatchRuleStatus};
