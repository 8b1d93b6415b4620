//! Watch-side ingestion: the mirror of admission ingestion, driven
//! by informers instead of the admission webhook. Matches the same Rule
//! Store, sanitizes with the same Sanitizer, and recovers the
//! originating username from the Correlation Store instead of carrying
//! it directly (a watch event has no `userInfo`).
//!
//! The informer/watcher plumbing itself is an external collaborator —
//! `kube::runtime::watcher` does the actual long-poll/relist work; this
//! module's own logic is the transport-agnostic `ingest()` core,
//! exercised directly in tests the same way `admission::review()` is.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::watcher;
use thiserror::Error;
use tracing::{info, warn};

use crate::correlation::{canonical_for_key, generate_key, CorrelationStore};
use crate::event::{DestinationRef, Event, Operation, UserInfo};
use crate::id::ResourceIdentifier;
use crate::leader::LeaderArbiter;
use crate::metrics::Metrics;
use crate::queue::EventQueue;
use crate::rules::{MatchInput, RuleStore};
use crate::sanitize;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sanitization failed: {0}")]
    Sanitize(#[from] sanitize::Error),
}

pub struct WatchEvent {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub operation: Operation,
    pub object: serde_json::Value,
    pub namespace_labels: std::collections::BTreeMap<String, String>,
}

pub struct WatchContext {
    pub rule_store: Arc<RuleStore>,
    pub correlation_store: Arc<CorrelationStore>,
    pub event_queue: EventQueue,
    pub metrics: Option<Metrics>,
}

/// Transport-agnostic ingestion core, the watch-side twin of
/// `admission::review`.
pub async fn ingest(ctx: &WatchContext, event: WatchEvent) -> Result<usize, Error> {
    let namespace = event
        .object
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str());
    let name = event
        .object
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let id = ResourceIdentifier::from_parts(&event.group, &event.version, &event.resource, namespace, name);

    let object_labels = event
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
        group: &event.group,
        version: &event.version,
        resource: &event.resource,
        operation: event.operation,
        object_labels: &object_labels,
        namespace_labels: Some(&event.namespace_labels),
    };
    let rules = ctx.rule_store.matching_rules(&match_input);
    if rules.is_empty() {
        return Ok(0);
    }

    let sanitized = sanitize::sanitize(&event.object)?;
    let yaml = sanitize::marshal_ordered_yaml(&sanitized)?;

    for rule in &rules {
        // Use the same canonicalized operation admission used to generate
        // this key (CREATE and UPDATE both land on `Update`); the event's
        // *real* operation is still what's carried on the `Event` below.
        let key = generate_key(&id, canonical_for_key(event.operation), &yaml);
        let username = match ctx.correlation_store.get_and_delete(&key) {
            Some(entry) => entry.username,
            None => {
                warn!(id = %id, operation = %event.operation, "correlation miss: committing with empty username");
                if let Some(metrics) = &ctx.metrics {
                    metrics.correlation_misses_total.inc();
                }
                String::new()
            }
        };

        let ev = Event {
            sanitized: sanitized.clone(),
            id: id.clone(),
            operation: event.operation,
            user_info: UserInfo { username, uid: String::new() },
            destination_ref: DestinationRef {
                namespace: rule.destination_namespace.clone(),
                name: rule.destination_name.clone(),
            },
            rule_namespace: rule.source_namespace.clone(),
        };
        ctx.event_queue.push(ev);
    }

    info!(id = %id, operation = %event.operation, matched = rules.len(), "watch ingestion: matched rules");
    Ok(rules.len())
}

/// Drives one `(group, version, resource)`'s watcher stream for as long
/// as the process remains leader, converting `watcher::Event`s into
/// `WatchEvent`s and delegating to `ingest`. Spawned once per distinct
/// GVR a compiled rule names; only the leader replica runs this.
pub async fn run_for_gvr(
    client: kube::Client,
    api_resource: ApiResource,
    namespace_labels: Arc<dyn Fn(&str) -> std::collections::BTreeMap<String, String> + Send + Sync>,
    ctx: Arc<WatchContext>,
    leader: Arc<LeaderArbiter>,
) {
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource);
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();

    while let Some(event) = stream.next().await {
        if !leader.is_leader() {
            continue;
        }
        let Ok(event) = event else { continue };
        for (obj, operation) in flatten(event) {
            let namespace = obj.metadata.namespace.clone().unwrap_or_default();
            let ns_labels = namespace_labels(&namespace);
            let Ok(object) = serde_json::to_value(&obj) else { continue };
            let watch_event = WatchEvent {
                group: api_resource.group.clone(),
                version: api_resource.version.clone(),
                resource: api_resource.plural.clone(),
                operation,
                object,
                namespace_labels: ns_labels,
            };
            if let Err(e) = ingest(&ctx, watch_event).await {
                warn!(error = %e, "watch ingestion failed for one event");
            }
        }
    }
}

/// `watcher::Event` bundles `Init`/restart bookkeeping ingestion doesn't
/// need; this reduces it to the `(object, operation)` pairs the core
/// cares about. A watch `Apply` can't distinguish create from update
/// without tracking prior state per object — treated as `Update`, which
/// only affects the commit message's verb, not routing or content.
fn flatten(event: watcher::Event<DynamicObject>) -> Vec<(DynamicObject, Operation)> {
    match event {
        watcher::Event::Apply(obj) => vec![(obj, Operation::Update)],
        watcher::Event::Delete(obj) => vec![(obj, Operation::Delete)],
        watcher::Event::Init | watcher::Event::InitApply(_) | watcher::Event::InitDone => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationStore;
    use crate::queue::EventQueue;
    use crate::rules::{CompiledRule, GlobPattern, GvrMatcher};
    use serde_json::json;

    fn ctx_with_rule() -> WatchContext {
        let rule_store = Arc::new(RuleStore::new());
        rule_store.replace(
            "default",
            "r1",
            vec![CompiledRule {
                source_namespace: "default".into(),
                source_name: "r1".into(),
                matchers: vec![GvrMatcher {
                    group: GlobPattern::compile(""),
                    version: GlobPattern::compile("v1"),
                    resource: GlobPattern::compile("configmaps"),
                }],
                operations: None,
                label_selector: None,
                namespace_selector: None,
                destination_namespace: "default".into(),
                destination_name: "dest".into(),
            }],
        );
        let (queue, _rx) = EventQueue::new();
        WatchContext {
            rule_store,
            correlation_store: Arc::new(CorrelationStore::default()),
            event_queue: queue,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn recovers_username_from_correlation_store() {
        let ctx = ctx_with_rule();
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "cm1");
        let sanitized = sanitize::sanitize(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm1", "namespace": "default"},
            "data": {"k": "v"},
        }))
        .unwrap();
        let yaml = sanitize::marshal_ordered_yaml(&sanitized).unwrap();
        let key = generate_key(&id, Operation::Update, &yaml);
        ctx.correlation_store.put(key, "alice");

        let event = WatchEvent {
            group: "".into(),
            version: "v1".into(),
            resource: "configmaps".into(),
            operation: Operation::Update,
            object: json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm1", "namespace": "default"},
                "data": {"k": "v"},
            }),
            namespace_labels: Default::default(),
        };
        let matched = ingest(&ctx, event).await.unwrap();
        assert_eq!(matched, 1);
    }

    #[tokio::test]
    async fn correlation_miss_does_not_fail_ingestion() {
        let ctx = ctx_with_rule();
        let event = WatchEvent {
            group: "".into(),
            version: "v1".into(),
            resource: "configmaps".into(),
            operation: Operation::Update,
            object: json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm-no-correlation", "namespace": "default"},
                "data": {"k": "v"},
            }),
            namespace_labels: Default::default(),
        };
        let matched = ingest(&ctx, event).await.unwrap();
        assert_eq!(matched, 1);
    }
}
