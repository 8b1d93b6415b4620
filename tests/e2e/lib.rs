#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use gitmirror_operator::crd::conditions::ConditionStatus;
    use gitmirror_operator::crd::{
        DestinationRef, GitProvider, GitProviderSpec, GitTarget, GitTargetSpec, ProviderRef, PushStrategySpec, WatchRule, WatchRuleSpec,
    };
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use kube::api::{Api, ObjectMeta, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, Condition};
    use tokio::time::timeout;

    fn has_condition<K>(type_: &'static str, status: ConditionStatus) -> impl Condition<K>
    where
        K: ConditionsOf,
    {
        move |obj: Option<&K>| {
            obj.and_then(|o| o.conditions())
                .map(|conditions| conditions.iter().any(|c| c.type_ == type_ && c.status == status))
                .unwrap_or(false)
        }
    }

    trait ConditionsOf {
        fn conditions(&self) -> Option<&[gitmirror_operator::crd::conditions::Condition]>;
    }

    impl ConditionsOf for GitProvider {
        fn conditions(&self) -> Option<&[gitmirror_operator::crd::conditions::Condition]> {
            self.status.as_ref().map(|s| s.conditions.as_slice())
        }
    }

    impl ConditionsOf for GitTarget {
        fn conditions(&self) -> Option<&[gitmirror_operator::crd::conditions::Condition]> {
            self.status.as_ref().map(|s| s.conditions.as_slice())
        }
    }

    impl ConditionsOf for WatchRule {
        fn conditions(&self) -> Option<&[gitmirror_operator::crd::conditions::Condition]> {
            self.status.as_ref().map(|s| s.conditions.as_slice())
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource + Clone + std::fmt::Debug + for<'de> k8s_openapi::serde::Deserialize<'de> + 'static + Send,
        C: Condition<R>,
    {
        timeout(Duration::from_secs(30), await_condition(api, name, condition)).await.unwrap().unwrap();
    }

    fn bearer_secret(name: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert("bearerToken".to_owned(), ByteString(b"not-a-real-token".to_vec()));
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn git_provider_becomes_ready_with_valid_auth_secret() {
        let client = Client::try_default().await.unwrap();
        let secrets: Api<Secret> = Api::namespaced(client.clone(), "default");
        let providers: Api<GitProvider> = Api::namespaced(client.clone(), "default");

        let name = "e2e-git-provider-ready";
        secrets.create(&PostParams::default(), &bearer_secret(name)).await.unwrap();

        let provider = GitProvider::new(
            name,
            GitProviderSpec {
                url: "https://example.invalid/repo.git".into(),
                auth_secret_ref: name.into(),
                allowed_branches: vec!["main".into(), "release/*".into()],
                push_strategy: PushStrategySpec::default(),
                access_policy: Default::default(),
            },
        );
        providers.create(&PostParams::default(), &provider).await.unwrap();

        wait_for(providers, name, has_condition("Ready", ConditionStatus::True)).await;
    }

    #[tokio::test]
    async fn git_provider_rejects_missing_auth_secret() {
        let client = Client::try_default().await.unwrap();
        let providers: Api<GitProvider> = Api::namespaced(client.clone(), "default");

        let name = "e2e-git-provider-missing-secret";
        let provider = GitProvider::new(
            name,
            GitProviderSpec {
                url: "https://example.invalid/repo.git".into(),
                auth_secret_ref: "does-not-exist".into(),
                allowed_branches: vec!["main".into()],
                push_strategy: PushStrategySpec::default(),
                access_policy: Default::default(),
            },
        );
        providers.create(&PostParams::default(), &provider).await.unwrap();

        wait_for(providers, name, has_condition("Ready", ConditionStatus::False)).await;
    }

    #[tokio::test]
    async fn git_target_rejects_disallowed_branch() {
        let client = Client::try_default().await.unwrap();
        let secrets: Api<Secret> = Api::namespaced(client.clone(), "default");
        let providers: Api<GitProvider> = Api::namespaced(client.clone(), "default");
        let targets: Api<GitTarget> = Api::namespaced(client.clone(), "default");

        let provider_name = "e2e-git-provider-for-branch-check";
        secrets.create(&PostParams::default(), &bearer_secret(provider_name)).await.unwrap();
        let provider = GitProvider::new(
            provider_name,
            GitProviderSpec {
                url: "https://example.invalid/repo.git".into(),
                auth_secret_ref: provider_name.into(),
                allowed_branches: vec!["main".into()],
                push_strategy: PushStrategySpec::default(),
                access_policy: Default::default(),
            },
        );
        providers.create(&PostParams::default(), &provider).await.unwrap();
        wait_for(providers.clone(), provider_name, has_condition("Ready", ConditionStatus::True)).await;

        let target_name = "e2e-git-target-disallowed-branch";
        let target = GitTarget::new(
            target_name,
            GitTargetSpec {
                provider_ref: ProviderRef {
                    namespace: None,
                    name: provider_name.into(),
                },
                branch: "feature/not-allowed".into(),
                base_path: "cluster-state".into(),
                encryption: None,
            },
        );
        targets.create(&PostParams::default(), &target).await.unwrap();

        wait_for(targets, target_name, has_condition("Ready", ConditionStatus::False)).await;
    }

    #[tokio::test]
    async fn watch_rule_compiles_and_becomes_ready() {
        let client = Client::try_default().await.unwrap();
        let rules: Api<WatchRule> = Api::namespaced(client.clone(), "default");

        let name = "e2e-watch-rule-compiles";
        let rule = WatchRule::new(
            name,
            WatchRuleSpec {
                destination_ref: DestinationRef {
                    namespace: None,
                    name: "some-git-target".into(),
                },
                rules: vec![gitmirror_operator::crd::RuleBlock {
                    api_groups: vec!["".into()],
                    api_versions: vec!["v1".into()],
                    resources: vec!["configmaps".into()],
                    operations: None,
                    label_selector: None,
                    namespace_selector: None,
                }],
            },
        );
        rules.create(&PostParams::default(), &rule).await.unwrap();

        wait_for(rules, name, has_condition("Ready", ConditionStatus::True)).await;
    }
}
