//! The `status.conditions` shape shared by every CRD this operator owns:
//! the `Ready` condition convention used across Kubernetes operators.

use chrono::Utc;
use kube::core::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Condition {
    pub fn ready(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: READY.to_owned(),
            status,
            reason: reason.to_owned(),
            message: message.into(),
            last_transition_time: Utc::now().to_rfc3339(),
        }
    }
}

/// Replaces the `Ready` condition in-place (keeping any others), only
/// bumping `lastTransitionTime` when the status actually changes, so
/// reconciles that observe no change don't spam the API with status
/// subresource writes.
pub fn set_ready(conditions: &mut Vec<Condition>, status: ConditionStatus, reason: &str, message: impl Into<String>) {
    let message = message.into();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == READY) {
        if existing.status != status || existing.reason != reason {
            existing.status = status;
            existing.reason = reason.to_owned();
            existing.message = message;
            existing.last_transition_time = Utc::now().to_rfc3339();
        } else {
            existing.message = message;
        }
    } else {
        conditions.push(Condition::ready(status, reason, message));
    }
}

pub fn is_ready(conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == READY && c.status == ConditionStatus::True)
}

/// `observedGeneration` tracking, the convention the pack's operators use
/// to decide whether a cached resolution is stale.
pub fn generation_of<K: Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or_default()
}
