//! Reconcilers for `WatchRule` and `ClusterWatchRule`: compile the rule
//! into `CompiledRule`s and publish them into the Rule Store, removing
//! them again on delete via `kube::runtime::finalizer`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::{watcher, Controller};
use kube::{Resource, ResourceExt};
use tracing::{error, info, warn};

use crate::crd::conditions::{set_ready, ConditionStatus};
use crate::crd::{ClusterWatchRule, RuleBlock, WatchRule};
use crate::rules::{CompiledRule, GlobPattern, GvrMatcher};

use super::Context;

pub const FINALIZER: &str = "gitmirror.io/rule-store";

fn compile_blocks(blocks: &[RuleBlock], destination_namespace: &str, destination_name: &str, source_namespace: &str, source_name: &str) -> Vec<CompiledRule> {
    blocks
        .iter()
        .map(|block| {
            let matchers = block
                .api_groups
                .iter()
                .flat_map(|g| block.api_versions.iter().map(move |v| (g, v)))
                .flat_map(|(g, v)| block.resources.iter().map(move |r| (g, v, r)))
                .map(|(g, v, r)| GvrMatcher {
                    group: GlobPattern::compile(g),
                    version: GlobPattern::compile(v),
                    resource: GlobPattern::compile(r),
                })
                .collect();
            CompiledRule {
                source_namespace: source_namespace.to_owned(),
                source_name: source_name.to_owned(),
                matchers,
                operations: block
                    .operations
                    .as_ref()
                    .map(|ops| ops.iter().filter_map(|s| s.parse().ok()).collect()),
                label_selector: block.label_selector.clone(),
                namespace_selector: block.namespace_selector.clone(),
                destination_namespace: destination_namespace.to_owned(),
                destination_name: destination_name.to_owned(),
            }
        })
        .collect()
}

async fn reconcile_watch_rule(rule: Arc<WatchRule>, ctx: Arc<Context>) -> crate::error::Result<Action> {
    let api: Api<WatchRule> = Api::namespaced(ctx.client.clone(), &rule.namespace().unwrap_or_default());
    let namespace = rule.namespace().unwrap_or_default();
    let name = rule.name_any();

    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => {
                let dest_ns = rule.spec.destination_ref.namespace.clone().unwrap_or_else(|| namespace.clone());
                let compiled = compile_blocks(&rule.spec.rules, &dest_ns, &rule.spec.destination_ref.name, &namespace, &name);
                ctx.rule_store.replace(&namespace, &name, compiled);
                let mut status = rule.status.clone().unwrap_or_default();
                set_ready(&mut status.conditions, ConditionStatus::True, "Compiled", "rule compiled and published");
                let _ = api
                    .patch_status(&name, &Default::default(), &kube::api::Patch::Merge(serde_json::json!({"status": status})))
                    .await;
                info!(namespace = %namespace, name = %name, "WatchRule compiled");
                Ok(Action::requeue(Duration::from_secs(300)))
            }
            FinalizerEvent::Cleanup(_rule) => {
                ctx.rule_store.replace(&namespace, &name, vec![]);
                info!(namespace = %namespace, name = %name, "WatchRule removed from rule store");
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| crate::error::Error::UserInput(e.to_string()))
}

async fn reconcile_cluster_watch_rule(rule: Arc<ClusterWatchRule>, ctx: Arc<Context>) -> crate::error::Result<Action> {
    let api: Api<ClusterWatchRule> = Api::all(ctx.client.clone());
    let name = rule.name_any();

    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => {
                let dest = &rule.spec.destination_ref;
                let compiled = compile_blocks(&rule.spec.rules, &dest.namespace, &dest.name, "", &name);
                ctx.rule_store.replace("", &name, compiled);
                let mut status = rule.status.clone().unwrap_or_default();
                set_ready(&mut status.conditions, ConditionStatus::True, "Compiled", "rule compiled and published");
                let _ = api
                    .patch_status(&name, &Default::default(), &kube::api::Patch::Merge(serde_json::json!({"status": status})))
                    .await;
                info!(name = %name, "ClusterWatchRule compiled");
                Ok(Action::requeue(Duration::from_secs(300)))
            }
            FinalizerEvent::Cleanup(_rule) => {
                ctx.rule_store.replace("", &name, vec![]);
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| crate::error::Error::UserInput(e.to_string()))
}

fn error_policy<K>(_obj: Arc<K>, error: &crate::error::Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "rule reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

pub async fn run_watch_rule(ctx: Arc<Context>) {
    let api: Api<WatchRule> = Api::all(ctx.client.clone());
    if let Err(e) = api.list(&Default::default()).await {
        error!(error = %e, "WatchRule CRD not queryable; is it installed?");
        return;
    }
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_watch_rule, error_policy, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

pub async fn run_cluster_watch_rule(ctx: Arc<Context>) {
    let api: Api<ClusterWatchRule> = Api::all(ctx.client.clone());
    if let Err(e) = api.list(&Default::default()).await {
        error!(error = %e, "ClusterWatchRule CRD not queryable; is it installed?");
        return;
    }
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_cluster_watch_rule, error_policy, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::watch_rule::RuleBlock;

    #[test]
    fn compile_expands_gvr_cross_product() {
        let block = RuleBlock {
            api_groups: vec!["apps".into(), "".into()],
            api_versions: vec!["v1".into()],
            resources: vec!["deployments".into(), "pods".into()],
            operations: None,
            label_selector: None,
            namespace_selector: None,
        };
        let compiled = compile_blocks(&[block], "default", "dest", "default", "r1");
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].matchers.len(), 4);
    }
}
