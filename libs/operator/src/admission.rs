//! Admission Ingestion: the transport-agnostic core of the
//! validating-webhook-shaped admission path. `review()` takes a decoded
//! request and returns an always-allow outcome; the HTTP decoding of a
//! `kube::core::admission::AdmissionReview<DynamicObject>` lives in the
//! operator binary so this module is unit-testable without standing up a
//! server, using a mocked client the same way the webhook handler's
//! other collaborators are tested.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::correlation::{generate_key, CorrelationStore};
use crate::event::{DestinationRef, Event, Operation, UserInfo};
use crate::id::ResourceIdentifier;
use crate::leader::LeaderArbiter;
use crate::queue::EventQueue;
use crate::rules::{MatchInput, RuleStore};
use crate::sanitize::{self, SanitizedObject};

#[derive(Debug, Error)]
pub enum Error {
    #[error("sanitization failed: {0}")]
    Sanitize(#[from] sanitize::Error),
}

/// A decoded admission request, independent of the wire `AdmissionReview`
/// envelope.
pub struct AdmissionRequest {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: String,
    pub operation: Operation,
    pub user_info: UserInfo,
    pub object: Value,
    pub namespace_labels: std::collections::BTreeMap<String, String>,
}

/// Outcome of one review: always "allow" (purely observational — the
/// webhook never blocks a request), carrying the match count for the
/// single log line / histogram this path reports.
pub struct AdmissionOutcome {
    pub matched_rule_count: usize,
}

pub struct AdmissionContext {
    pub rule_store: Arc<RuleStore>,
    pub correlation_store: Arc<CorrelationStore>,
    pub event_queue: EventQueue,
    pub leader: Arc<LeaderArbiter>,
}

pub async fn review(ctx: &AdmissionContext, req: AdmissionRequest) -> Result<AdmissionOutcome, Error> {
    let id = ResourceIdentifier::from_parts(
        &req.group,
        &req.version,
        &req.resource,
        req.namespace.as_deref(),
        &req.name,
    );

    let object_labels = req
        .object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();

    let match_input = MatchInput {
        group: &req.group,
        version: &req.version,
        resource: &req.resource,
        operation: req.operation,
        object_labels: &object_labels,
        namespace_labels: Some(&req.namespace_labels),
    };
    let rules = ctx.rule_store.matching_rules(&match_input);

    if rules.is_empty() {
        info!(operation = %req.operation, id = %id, matched = 0, "admission review: no matching rules");
        return Ok(AdmissionOutcome { matched_rule_count: 0 });
    }

    let sanitized: SanitizedObject = sanitize::sanitize(&req.object)?;
    let yaml = sanitize::marshal_ordered_yaml(&sanitized)?;

    for rule in &rules {
        let key = generate_key(&id, crate::correlation::canonical_for_key(req.operation), &yaml);
        ctx.correlation_store.put(key, req.user_info.username.clone());

        if ctx.leader.is_leader() {
            let event = Event {
                sanitized: sanitized.clone(),
                id: id.clone(),
                operation: req.operation,
                user_info: req.user_info.clone(),
                destination_ref: DestinationRef {
                    namespace: rule.destination_namespace.clone(),
                    name: rule.destination_name.clone(),
                },
                rule_namespace: rule.source_namespace.clone(),
            };
            ctx.event_queue.push(event);
        }
    }

    info!(operation = %req.operation, id = %id, matched = rules.len(), "admission review: matched rules");
    Ok(AdmissionOutcome {
        matched_rule_count: rules.len(),
    })
}
