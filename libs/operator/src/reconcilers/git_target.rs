//! `GitTarget` reconciler: validates `branch` against the referenced
//! `GitProvider`'s `allowedBranches` globs, publishing
//! `Ready=False/BranchNotAllowed` on mismatch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use tracing::{error, warn};

use crate::crd::conditions::{generation_of, set_ready, ConditionStatus};
use crate::crd::{GitProvider, GitTarget};
use crate::rules::GlobPattern;

use super::Context;

async fn reconcile(target: Arc<GitTarget>, ctx: Arc<Context>) -> crate::error::Result<Action> {
    let namespace = target.namespace().unwrap_or_default();
    let name = target.name_any();
    let api: Api<GitTarget> = Api::namespaced(ctx.client.clone(), &namespace);

    let provider_namespace = target.spec.provider_ref.namespace.clone().unwrap_or_else(|| namespace.clone());
    let providers: Api<GitProvider> = Api::namespaced(ctx.client.clone(), &provider_namespace);

    let mut status = target.status.clone().unwrap_or_default();
    status.observed_generation = generation_of(target.as_ref());

    match providers.get(&target.spec.provider_ref.name).await {
        Ok(provider) => {
            let allowed = provider
                .spec
                .allowed_branches
                .iter()
                .any(|pattern| GlobPattern::compile(pattern).matches(&target.spec.branch));
            if allowed {
                set_ready(&mut status.conditions, ConditionStatus::True, "Validated", "branch is allowed by its GitProvider");
            } else {
                set_ready(
                    &mut status.conditions,
                    ConditionStatus::False,
                    "BranchNotAllowed",
                    format!("branch {:?} is not in GitProvider {}'s allowedBranches", target.spec.branch, target.spec.provider_ref.name),
                );
            }
        }
        Err(_) => {
            set_ready(
                &mut status.conditions,
                ConditionStatus::False,
                "Rejected",
                format!("GitProvider {}/{} not found", provider_namespace, target.spec.provider_ref.name),
            );
        }
    }

    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(serde_json::json!({"status": status})))
        .await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

fn error_policy(_obj: Arc<GitTarget>, error: &crate::error::Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "GitTarget reconcile failed");
    Action::requeue(Duration::from_secs(60))
}

pub async fn run(ctx: Arc<Context>) {
    let api: Api<GitTarget> = Api::all(ctx.client.clone());
    if let Err(e) = api.list(&Default::default()).await {
        error!(error = %e, "GitTarget CRD not queryable; is it installed?");
        return;
    }
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_glob_matches_release_pattern() {
        assert!(GlobPattern::compile("release/*").matches("release/1.0"));
        assert!(!GlobPattern::compile("release/*").matches("main"));
    }
}
