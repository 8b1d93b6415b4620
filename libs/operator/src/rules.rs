//! Rule Store (component C): the compiled set of active watch rules and
//! `matching_rules(obj, resource)`, the read path admission and watch
//! ingestion both call.
//!
//! Read-mostly: a `parking_lot`-free `std::sync::RwLock` map keyed by the
//! rule's own `(namespace, name)`; reconcilers replace entries wholesale
//! on every observed generation, readers hold the lock only for the
//! duration of matching.

use std::collections::BTreeMap;
use std::sync::RwLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::event::Operation;

/// A single `(apiGroup, apiVersion, resource)` matcher, each field
/// supporting `prefix*` / `*suffix` globs or a bare `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GvrMatcher {
    pub group: GlobPattern,
    pub version: GlobPattern,
    pub resource: GlobPattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobPattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl GlobPattern {
    pub fn compile(raw: &str) -> Self {
        if raw == "*" {
            GlobPattern::Any
        } else if let Some(prefix) = raw.strip_suffix('*') {
            GlobPattern::Prefix(prefix.to_ascii_lowercase())
        } else if let Some(suffix) = raw.strip_prefix('*') {
            GlobPattern::Suffix(suffix.to_ascii_lowercase())
        } else {
            GlobPattern::Exact(raw.to_ascii_lowercase())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        let value = value.to_ascii_lowercase();
        match self {
            GlobPattern::Any => true,
            GlobPattern::Exact(s) => &value == s,
            GlobPattern::Prefix(p) => value.starts_with(p.as_str()),
            GlobPattern::Suffix(s) => value.ends_with(s.as_str()),
        }
    }
}

/// A compiled rule: one or more GVR matchers, optional predicates, and a
/// concrete destination reference (already namespace-resolved — the
/// cluster-scoped variant's namespace is required up front, the
/// namespaced variant's defaults to the rule's own namespace at compile
/// time).
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub source_namespace: String,
    pub source_name: String,
    pub matchers: Vec<GvrMatcher>,
    pub operations: Option<Vec<Operation>>,
    pub label_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    pub destination_namespace: String,
    pub destination_name: String,
}

impl CompiledRule {
    fn matches_gvr(&self, group: &str, version: &str, resource: &str) -> bool {
        self.matchers
            .iter()
            .any(|m| m.group.matches(group) && m.version.matches(version) && m.resource.matches(resource))
    }

    fn matches_operation(&self, operation: Operation) -> bool {
        match &self.operations {
            None => true,
            Some(ops) => ops.contains(&operation),
        }
    }
}

/// A resource's identity for matching purposes, plus enough context
/// (object labels, namespace labels) to evaluate selectors.
pub struct MatchInput<'a> {
    pub group: &'a str,
    pub version: &'a str,
    pub resource: &'a str,
    pub operation: Operation,
    pub object_labels: &'a BTreeMap<String, String>,
    pub namespace_labels: Option<&'a BTreeMap<String, String>>,
}

#[derive(Default)]
pub struct RuleStore {
    rules: RwLock<BTreeMap<(String, String), Vec<CompiledRule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces every compiled rule originating from
    /// `(namespace, name)`. Called by the rule reconcilers on each
    /// observed spec change; an empty `Vec` removes the entry (the
    /// source object was deleted or failed validation).
    pub fn replace(&self, namespace: &str, name: &str, compiled: Vec<CompiledRule>) {
        let mut guard = self.rules.write().expect("rule store lock poisoned");
        if compiled.is_empty() {
            guard.remove(&(namespace.to_owned(), name.to_owned()));
        } else {
            guard.insert((namespace.to_owned(), name.to_owned()), compiled);
        }
    }

    pub fn len(&self) -> usize {
        self.rules.read().expect("rule store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiled-rule count per source namespace, for the
    /// `rules_total{namespace}` gauge.
    pub fn count_by_namespace(&self) -> BTreeMap<String, usize> {
        let guard = self.rules.read().expect("rule store lock poisoned");
        let mut counts = BTreeMap::new();
        for (namespace, _) in guard.keys() {
            *counts.entry(namespace.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Every compiled rule across every source whose predicates all
    /// match `input`.
    pub fn matching_rules(&self, input: &MatchInput) -> Vec<CompiledRule> {
        let guard = self.rules.read().expect("rule store lock poisoned");
        guard
            .values()
            .flatten()
            .filter(|rule| rule_matches(rule, input))
            .cloned()
            .collect()
    }
}

fn rule_matches(rule: &CompiledRule, input: &MatchInput) -> bool {
    if !rule.matches_gvr(input.group, input.version, input.resource) {
        return false;
    }
    if !rule.matches_operation(input.operation) {
        return false;
    }
    if let Some(selector) = &rule.label_selector {
        if !selector_matches(selector, input.object_labels) {
            return false;
        }
    }
    if let Some(selector) = &rule.namespace_selector {
        let ns_labels = input.namespace_labels.cloned_or_empty();
        if !selector_matches(selector, &ns_labels) {
            return false;
        }
    }
    true
}

trait OptLabels {
    fn cloned_or_empty(&self) -> BTreeMap<String, String>;
}

impl OptLabels for Option<&BTreeMap<String, String>> {
    fn cloned_or_empty(&self) -> BTreeMap<String, String> {
        self.map(|m| m.clone()).unwrap_or_default()
    }
}

/// Minimal `LabelSelector` evaluation: every `matchLabels` entry must be
/// present with an equal value, and every `matchExpressions` operator
/// (`In`, `NotIn`, `Exists`, `DoesNotExist`) must hold.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let present = labels.get(&expr.key);
            let ok = match expr.operator.as_str() {
                "In" => present.is_some_and(|v| expr.values.as_ref().is_some_and(|vals| vals.contains(v))),
                "NotIn" => !present.is_some_and(|v| expr.values.as_ref().is_some_and(|vals| vals.contains(v))),
                "Exists" => present.is_some(),
                "DoesNotExist" => present.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(matchers: Vec<GvrMatcher>) -> CompiledRule {
        CompiledRule {
            source_namespace: "default".into(),
            source_name: "r1".into(),
            matchers,
            operations: None,
            label_selector: None,
            namespace_selector: None,
            destination_namespace: "default".into(),
            destination_name: "dest".into(),
        }
    }

    fn gvr(group: &str, version: &str, resource: &str) -> GvrMatcher {
        GvrMatcher {
            group: GlobPattern::compile(group),
            version: GlobPattern::compile(version),
            resource: GlobPattern::compile(resource),
        }
    }

    fn input<'a>(group: &'a str, version: &'a str, resource: &'a str, labels: &'a BTreeMap<String, String>) -> MatchInput<'a> {
        MatchInput {
            group,
            version,
            resource,
            operation: Operation::Create,
            object_labels: labels,
            namespace_labels: None,
        }
    }

    #[test]
    fn wildcard_resource_matches_any() {
        let store = RuleStore::new();
        store.replace("default", "r1", vec![rule(vec![gvr("", "v1", "*")])]);
        let labels = BTreeMap::new();
        let matched = store.matching_rules(&input("", "v1", "configmaps", &labels));
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn prefix_and_suffix_globs() {
        let store = RuleStore::new();
        store.replace(
            "default",
            "r1",
            vec![rule(vec![gvr("apps*", "v1", "*ments")])],
        );
        let labels = BTreeMap::new();
        assert_eq!(store.matching_rules(&input("apps", "v1", "deployments", &labels)).len(), 1);
        assert_eq!(store.matching_rules(&input("batch", "v1", "deployments", &labels)).len(), 0);
        assert_eq!(store.matching_rules(&input("apps", "v1", "pods", &labels)).len(), 0);
    }

    #[test]
    fn replace_is_atomic_per_source() {
        let store = RuleStore::new();
        store.replace("default", "r1", vec![rule(vec![gvr("", "v1", "configmaps")])]);
        assert_eq!(store.len(), 1);
        store.replace("default", "r1", vec![]);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn label_selector_must_match() {
        let store = RuleStore::new();
        let mut r = rule(vec![gvr("", "v1", "configmaps")]);
        let mut match_labels = BTreeMap::new();
        match_labels.insert("team".to_owned(), "platform".to_owned());
        r.label_selector = Some(LabelSelector {
            match_labels: Some(match_labels),
            match_expressions: None,
        });
        store.replace("default", "r1", vec![r]);

        let mut labels = BTreeMap::new();
        labels.insert("team".to_owned(), "other".to_owned());
        assert_eq!(store.matching_rules(&input("", "v1", "configmaps", &labels)).len(), 0);

        labels.insert("team".to_owned(), "platform".to_owned());
        assert_eq!(store.matching_rules(&input("", "v1", "configmaps", &labels)).len(), 1);
    }
}
