//! Resource Identifier (component A): uniquely names a cluster resource
//! and maps it to its canonical Git path. Pure value type, no I/O, no
//! fallible operations — `Key` and `GitPath` are deterministic functions
//! of the tuple and callers must never fold other fields into either.

use serde::{Deserialize, Serialize};

/// `(group, version, resource, namespace, name)` identifying one cluster
/// object. `group` is empty for the core API group; `namespace` is empty
/// iff the resource is cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentifier {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds an identifier from the fields an admission request (or a
    /// dynamic watch event) carries: the matched GVR plus the object's own
    /// namespace/name.
    pub fn from_parts(
        group: &str,
        version: &str,
        resource: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Self {
        Self::new(
            group,
            version,
            resource,
            namespace.unwrap_or_default(),
            name,
        )
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// `{group}/{version}/{resource}[/{namespace}]/{name}` — the leading
    /// `{group}/` segment is omitted for the core API group.
    pub fn key(&self) -> String {
        let mut segments: Vec<&str> = Vec::with_capacity(5);
        if !self.group.is_empty() {
            segments.push(&self.group);
        }
        segments.push(&self.version);
        segments.push(&self.resource);
        if !self.namespace.is_empty() {
            segments.push(&self.namespace);
        }
        segments.push(&self.name);
        segments.join("/")
    }

    /// Same shape as `key()` with a trailing `.yaml` extension on the file
    /// name component — the path a commit worker writes under its
    /// destination's base path.
    pub fn git_path(&self) -> String {
        format!("{}.yaml", self.key())
    }
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_group_omits_leading_segment() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "cm1");
        assert_eq!(id.key(), "v1/configmaps/default/cm1");
        assert_eq!(id.git_path(), "v1/configmaps/default/cm1.yaml");
    }

    #[test]
    fn named_group_keeps_leading_segment() {
        let id = ResourceIdentifier::new("apps", "v1", "deployments", "default", "web");
        assert_eq!(id.key(), "apps/v1/deployments/default/web");
    }

    #[test]
    fn cluster_scoped_omits_namespace() {
        let id = ResourceIdentifier::new("", "v1", "namespaces", "", "default");
        assert!(id.is_cluster_scoped());
        assert_eq!(id.key(), "v1/namespaces/default");
        assert_eq!(id.git_path(), "v1/namespaces/default.yaml");
    }

    #[test]
    fn distinct_identifiers_never_collide_on_path() {
        let a = ResourceIdentifier::new("", "v1", "configmaps", "default", "cm1");
        let b = ResourceIdentifier::new("", "v1", "configmaps", "kube-system", "cm1");
        let c = ResourceIdentifier::new("apps", "v1", "configmaps", "default", "cm1");
        assert_ne!(a.git_path(), b.git_path());
        assert_ne!(a.git_path(), c.git_path());
        assert_ne!(b.git_path(), c.git_path());
    }
}
