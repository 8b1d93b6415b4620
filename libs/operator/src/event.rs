//! Shared value types flowing through the pipeline from ingestion to the
//! commit worker: `Event`, `Operation`, `UserInfo`, and the resolved
//! `Destination` a rule routes to.

use serde::{Deserialize, Serialize};

use crate::id::ResourceIdentifier;
use crate::sanitize::SanitizedObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
}

/// A reference to a `GitTarget`, carried on an `Event` until the
/// destination resolver turns it into a concrete `Destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for DestinationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Emitted by admission or watch ingestion; consumed by exactly one
/// commit worker.
#[derive(Debug, Clone)]
pub struct Event {
    pub sanitized: SanitizedObject,
    pub id: ResourceIdentifier,
    pub operation: Operation,
    pub user_info: UserInfo,
    pub destination_ref: DestinationRef,
    /// Namespace of the `WatchRule`/`ClusterWatchRule` that matched,
    /// needed by the destination resolver to evaluate a `GitProvider`'s
    /// access policy (`SameNamespace` compares against this, not against
    /// the destination's own namespace).
    pub rule_namespace: String,
}

#[derive(Debug, Clone)]
pub struct PushStrategy {
    pub interval: std::time::Duration,
    pub max_commits: usize,
}

impl Default for PushStrategy {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            max_commits: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Auth {
    Https {
        username: String,
        password: String,
    },
    HttpsToken {
        bearer_token: String,
    },
    Ssh {
        identity: Vec<u8>,
        known_hosts: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub secret_namespace: String,
    pub secret_name: String,
}

/// A resolved `{repoURL, branch, basePath, auth, pushStrategy,
/// encryption?}`. Immutable once resolved for an event.
#[derive(Debug, Clone)]
pub struct Destination {
    pub repo_url: String,
    pub branch: String,
    pub base_path: String,
    pub auth: Auth,
    pub push_strategy: PushStrategy,
    pub encryption: Option<EncryptionConfig>,
}

impl Destination {
    /// Worker identity key: one worker per unique `{repoURL, branch}`.
    pub fn worker_key(&self) -> String {
        format!("{}@{}", self.repo_url, self.branch)
    }
}
