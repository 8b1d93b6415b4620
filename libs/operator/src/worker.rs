//! Commit Worker: one per unique `{repoURL, branch}` destination,
//! long-running and single-threaded — git operations share a working
//! clone, so serializing them on one task is simpler than any lock-free
//! alternative.
//!
//! State lives for the task's lifetime only: a local clone, the
//! dedup map from file path to last-written fingerprint, and the set of
//! staged-but-uncommitted changes. Restart recreates everything via a
//! fresh clone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::{Cred, IndexAddOption, RemoteCallbacks, Repository, Signature};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::encryption::EncryptionAdapter;
use crate::event::{Auth, Destination, Event, Operation};
use crate::sanitize;

const MAX_PUSH_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Fingerprint a DELETE stages under, regardless of the deleted object's
/// last-known content. A real content fingerprint would almost always
/// equal the prior create/update's fingerprint for that path (the object
/// didn't change before it was removed), which would make the dedup check
/// swallow the delete entirely. Using a fixed sentinel instead means a
/// delete only ever dedupes against a *prior delete* of the same path
/// (the spec's stated no-op-after-the-first policy), never against a
/// live write.
const DELETE_FINGERPRINT_SENTINEL: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("i/o error staging worker files: {0}")]
    Io(#[from] std::io::Error),
    #[error("sanitization failed while staging: {0}")]
    Sanitize(#[from] sanitize::Error),
    #[error("encryption failed while staging: {0}")]
    Encryption(#[from] crate::encryption::Error),
    #[error("push failed after {0} attempts")]
    PushExhausted(u32),
}

/// Reports a destination's health outward without this module knowing
/// about `kube` status subresources — implemented by a reconciler-side
/// adapter that sets the `GitTarget`'s `Degraded`/`Ready` condition.
pub trait HealthSink: Send + Sync {
    fn set_degraded(&self, destination_key: &str, message: &str);
    fn set_healthy(&self, destination_key: &str);
    fn set_queue_depth(&self, _destination_key: &str, _depth: usize) {}
    fn record_conflict(&self, _destination_key: &str) {}
}

pub struct NoopHealthSink;
impl HealthSink for NoopHealthSink {
    fn set_degraded(&self, _destination_key: &str, _message: &str) {}
    fn set_healthy(&self, _destination_key: &str) {}
}

struct StagedChange {
    path: String,
    /// `None` stages a file removal.
    content: Option<Vec<u8>>,
    username: String,
    operation: Operation,
    resource_label: String,
}

/// One commit-to-be, built while staging and replayed verbatim on top of
/// a new remote tip if the initial push is rejected.
struct PendingCommit {
    message: String,
    author: String,
    files: Vec<(String, Option<Vec<u8>>)>,
}

pub struct CommitWorker {
    destination: Destination,
    destination_key: String,
    clone_dir: PathBuf,
    repo: Option<Repository>,
    /// Every non-deduped staged change in arrival order. Deliberately a
    /// `Vec`, not a map keyed by path: a later write to the same path
    /// within one flush window must NOT clobber an earlier one, or
    /// rapid same-path, different-author oscillation (spec.md §8
    /// Scenario 3) loses commits and author attribution.
    staged: Vec<StagedChange>,
    /// Distinct paths currently staged, tracked separately from
    /// `staged.len()` since the flush trigger counts distinct paths, not
    /// staged events (a path touched twice in one window is one path).
    staged_paths: std::collections::HashSet<String>,
    last_fingerprint: BTreeMap<String, u64>,
    oldest_unflushed: Option<Instant>,
    pending: Vec<PendingCommit>,
    encryption: Option<EncryptionAdapter>,
    health: std::sync::Arc<dyn HealthSink>,
    healthy: bool,
}

impl CommitWorker {
    pub fn new(destination: Destination, base_dir: &Path, encryption: Option<EncryptionAdapter>, health: std::sync::Arc<dyn HealthSink>) -> Self {
        let destination_key = destination.worker_key();
        let clone_dir = base_dir.join(sanitize_dir_name(&destination_key));
        Self {
            destination,
            destination_key,
            clone_dir,
            repo: None,
            staged: Vec::new(),
            staged_paths: std::collections::HashSet::new(),
            last_fingerprint: BTreeMap::new(),
            oldest_unflushed: None,
            pending: Vec::new(),
            encryption,
            health,
            healthy: true,
        }
    }

    /// Drains `mailbox` until it closes, flushing on the push-strategy
    /// interval or when `max_commits` distinct paths have staged.
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Event>) {
        let mut ticker = tokio::time::interval(self.destination.push_strategy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                maybe_event = mailbox.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Err(e) = self.stage(event).await {
                                warn!(destination = %self.destination_key, error = %e, "failed to stage event");
                            }
                            if self.staged_paths.len() >= self.destination.push_strategy.max_commits {
                                self.try_flush().await;
                            }
                        }
                        None => {
                            self.try_flush().await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.should_flush_on_interval() {
                        self.try_flush().await;
                    }
                }
            }
        }
    }

    fn should_flush_on_interval(&self) -> bool {
        self.oldest_unflushed
            .is_some_and(|t| t.elapsed() >= self.destination.push_strategy.interval)
    }

    async fn bootstrap(&mut self) -> Result<(), Error> {
        if self.repo.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(self.clone_dir.parent().unwrap_or(&self.clone_dir))?;
        let repo = if self.clone_dir.join(".git").exists() {
            Repository::open(&self.clone_dir)?
        } else {
            clone_repo(&self.destination, &self.clone_dir)?
        };
        {
            let mut config = repo.config()?;
            config.set_str("user.name", "gitmirror-operator")?;
            config.set_str("user.email", "gitmirror-operator@cluster.local")?;
        }
        self.repo = Some(repo);
        info!(destination = %self.destination_key, path = %self.clone_dir.display(), "commit worker bootstrapped");
        Ok(())
    }

    async fn stage(&mut self, event: Event) -> Result<(), Error> {
        self.bootstrap().await?;

        let is_delete = matches!(event.operation, Operation::Delete);
        let is_secret = event.sanitized.kind == "Secret" && event.sanitized.api_version == "v1";
        let encrypt = is_secret && self.destination.encryption.is_some() && self.encryption.is_some();

        let path = if encrypt {
            sops_path(&self.destination.base_path, &event.id.git_path())
        } else {
            format!("{}/{}", self.destination.base_path.trim_end_matches('/'), event.id.git_path())
        };

        // A DELETE's fingerprint never depends on content: the deleted
        // object's last-known content is (almost always) identical to
        // what was last written for this path, so hashing it would make
        // the dedup check below treat every delete as a no-op repeat of
        // the preceding create/update and silently drop it.
        let (content, fingerprint) = if is_delete {
            (None, DELETE_FINGERPRINT_SENTINEL)
        } else {
            let plaintext = sanitize::marshal_ordered_yaml(&event.sanitized)?;
            if encrypt {
                let enc_cfg = self.destination.encryption.as_ref().expect("checked by `encrypt` above");
                let adapter = self.encryption.as_ref().expect("checked by `encrypt` above");
                let payload = adapter.encrypt(&enc_cfg.secret_namespace, &enc_cfg.secret_name, &plaintext).await?;
                (Some(payload.envelope_yaml), payload.plaintext_fingerprint)
            } else {
                let fp = xxhash_rust::xxh64::xxh64(&plaintext, 0);
                (Some(plaintext), fp)
            }
        };

        if self.last_fingerprint.get(&path) == Some(&fingerprint) {
            // Unchanged since the last write to this path: silent dedup.
            // For DELETE this only matches a *prior* delete of the same
            // path (both carry the sentinel), matching the no-op-after-
            // the-first policy for repeated deletes.
            return Ok(());
        }

        self.staged.push(StagedChange {
            path: path.clone(),
            content,
            username: if event.user_info.username.is_empty() {
                "unknown".to_owned()
            } else {
                event.user_info.username.clone()
            },
            operation: event.operation,
            resource_label: event.id.to_string(),
        });
        self.staged_paths.insert(path.clone());
        self.last_fingerprint.insert(path, fingerprint);
        self.oldest_unflushed.get_or_insert_with(Instant::now);
        self.health.set_queue_depth(&self.destination_key, self.staged_paths.len());
        Ok(())
    }

    async fn try_flush(&mut self) {
        if let Err(e) = self.flush().await {
            warn!(destination = %self.destination_key, error = %e, "flush failed");
        }
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.staged.is_empty() && self.pending.is_empty() {
            return Ok(());
        }
        self.bootstrap().await?;

        if !self.staged.is_empty() {
            let staged = std::mem::take(&mut self.staged);
            self.staged_paths.clear();
            self.oldest_unflushed = None;

            // One commit per contiguous run of same-author changes, in
            // arrival order — not grouped/sorted by author — so rapid
            // oscillation between users (spec.md §8 Scenario 3) produces
            // commits in the same order the users actually wrote, rather
            // than collapsing into one commit per author or reordering
            // alphabetically.
            let mut runs: Vec<(String, Vec<StagedChange>)> = Vec::new();
            for change in staged {
                match runs.last_mut() {
                    Some((author, changes)) if *author == change.username => changes.push(change),
                    _ => runs.push((change.username.clone(), vec![change])),
                }
            }

            for (author, changes) in runs {
                let message = commit_message(&changes);
                let files: Vec<(String, Option<Vec<u8>>)> = changes.into_iter().map(|c| (c.path, c.content)).collect();
                self.commit_locally(&author, &message, &files)?;
                self.pending.push(PendingCommit { message, author, files });
            }
        }

        self.push_with_retry().await
    }

    fn commit_locally(&self, author: &str, message: &str, files: &[(String, Option<Vec<u8>>)]) -> Result<(), Error> {
        let repo = self.repo.as_ref().expect("bootstrapped");
        apply_files_to_workdir(&self.clone_dir, files)?;

        let mut index = repo.index()?;
        for (path, content) in files {
            if content.is_some() {
                index.add_path(Path::new(path))?;
            } else {
                let _ = index.remove_path(Path::new(path));
            }
        }
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;

        let sig = Signature::now(author, &format!("{author}@cluster.local"))?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let branch = self.destination.branch.clone();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        let _ = branch;
        Ok(())
    }

    async fn push_with_retry(&mut self) -> Result<(), Error> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.push_once() {
                Ok(()) => {
                    self.pending.clear();
                    self.healthy = true;
                    self.health.set_healthy(&self.destination_key);
                    self.health.set_queue_depth(&self.destination_key, self.staged_paths.len());
                    return Ok(());
                }
                Err(e) if is_non_fast_forward(&e) && attempt < MAX_PUSH_ATTEMPTS => {
                    warn!(destination = %self.destination_key, attempt, "push rejected, fetching and rebasing");
                    self.health.record_conflict(&self.destination_key);
                    self.fetch_and_rebase_onto_remote()?;
                    tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => {
                    self.healthy = false;
                    self.health.set_degraded(&self.destination_key, &e.to_string());
                    // Pending commits stay in `self.pending` and on the
                    // local branch; the next flush's push attempt
                    // retries them.
                    return Err(Error::PushExhausted(attempt));
                }
            }
        }
    }

    fn push_once(&self) -> Result<(), git2::Error> {
        let repo = self.repo.as_ref().expect("bootstrapped");
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}", branch = self.destination.branch);
        let mut callbacks = RemoteCallbacks::new();
        install_auth_callbacks(&mut callbacks, &self.destination.auth);
        let mut opts = git2::PushOptions::new();
        opts.remote_callbacks(callbacks);
        remote.push(&[refspec], Some(&mut opts))
    }

    /// Fetches the remote tip and replays every pending commit on top of
    /// it, re-applying each commit's *own* file contents verbatim — a
    /// "last-writer-wins on our side" policy: whatever
    /// the external commit changed at a path we also touched is
    /// overwritten by our replay, but paths we never touched keep the
    /// external commit's changes because we rebuild the tree from the
    /// remote tip, not from scratch.
    fn fetch_and_rebase_onto_remote(&mut self) -> Result<(), Error> {
        let repo = self.repo.as_ref().expect("bootstrapped");
        let branch = self.destination.branch.clone();

        {
            let mut remote = repo.find_remote("origin")?;
            let mut callbacks = RemoteCallbacks::new();
            install_auth_callbacks(&mut callbacks, &self.destination.auth);
            let mut opts = git2::FetchOptions::new();
            opts.remote_callbacks(callbacks);
            remote.fetch(&[branch.as_str()], Some(&mut opts), None)?;
        }

        let remote_ref = repo.find_reference(&format!("refs/remotes/origin/{branch}"))?;
        let remote_commit = remote_ref.peel_to_commit()?;
        repo.set_head_detached(remote_commit.id())?;
        repo.reset(remote_commit.as_object(), git2::ResetType::Hard, None)?;

        let pending = std::mem::take(&mut self.pending);
        for commit in &pending {
            self.commit_locally(&commit.author, &commit.message, &commit.files)?;
        }
        self.pending = pending;

        let local_head = repo.head()?.peel_to_commit()?;
        repo.reference(&format!("refs/heads/{branch}"), local_head.id(), true, "rebase onto fetched tip")?;
        repo.set_head(&format!("refs/heads/{branch}"))?;
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

fn commit_message(changes: &[StagedChange]) -> String {
    match changes {
        [change] => format!("[{}] {} by user/{}", change.operation, change.resource_label, change.username),
        _ => {
            let username = &changes[0].username;
            format!("{} changes by user/{}", changes.len(), username)
        }
    }
}

fn apply_files_to_workdir(clone_dir: &Path, files: &[(String, Option<Vec<u8>>)]) -> Result<(), Error> {
    for (path, content) in files {
        let full = clone_dir.join(path);
        match content {
            Some(bytes) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, bytes)?;
            }
            None => {
                let _ = std::fs::remove_file(&full);
            }
        }
    }
    Ok(())
}

fn sops_path(base_path: &str, git_path: &str) -> String {
    let with_sops = git_path.strip_suffix(".yaml").map(|p| format!("{p}.sops.yaml")).unwrap_or_else(|| format!("{git_path}.sops.yaml"));
    format!("{}/{}", base_path.trim_end_matches('/'), with_sops)
}

fn sanitize_dir_name(key: &str) -> String {
    key.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

fn clone_repo(destination: &Destination, dest: &Path) -> Result<Repository, git2::Error> {
    let mut callbacks = RemoteCallbacks::new();
    install_auth_callbacks(&mut callbacks, &destination.auth);
    let mut fetch_opts = git2::FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_opts);
    builder.branch(&destination.branch);
    builder.clone(&destination.repo_url, dest)
}

fn install_auth_callbacks(callbacks: &mut RemoteCallbacks, auth: &Auth) {
    let auth = auth.clone();
    callbacks.credentials(move |_url, username_from_url, _allowed| match &auth {
        Auth::Https { username, password } => Cred::userpass_plaintext(username, password),
        Auth::HttpsToken { bearer_token } => Cred::userpass_plaintext("x-access-token", bearer_token),
        Auth::Ssh { identity, known_hosts: _ } => {
            let user = username_from_url.unwrap_or("git");
            Cred::ssh_key_from_memory(user, None, &String::from_utf8_lossy(identity), None)
        }
    });
}

fn is_non_fast_forward(e: &git2::Error) -> bool {
    matches!(e.code(), git2::ErrorCode::NotFastForward) || e.message().contains("non-fast-forward") || e.message().contains("fetch first")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sops_path_replaces_yaml_suffix() {
        assert_eq!(sops_path("base", "v1/secrets/default/s1.yaml"), "base/v1/secrets/default/s1.sops.yaml");
    }

    #[test]
    fn dir_name_is_filesystem_safe() {
        let key = "https://example.com/repo.git@main";
        assert!(!sanitize_dir_name(key).contains('/'));
        assert!(!sanitize_dir_name(key).contains(':'));
    }

    #[test]
    fn single_change_commit_message() {
        let change = StagedChange {
            path: "path".into(),
            content: Some(vec![]),
            username: "alice".into(),
            operation: Operation::Create,
            resource_label: "v1/configmaps/default/cm1".into(),
        };
        let msg = commit_message(&[change]);
        assert_eq!(msg, "[CREATE] v1/configmaps/default/cm1 by user/alice");
    }

    #[test]
    fn multi_change_commit_message() {
        let a = StagedChange {
            path: "pa".into(),
            content: Some(vec![]),
            username: "alice".into(),
            operation: Operation::Create,
            resource_label: "a".into(),
        };
        let b = StagedChange {
            path: "pb".into(),
            content: Some(vec![]),
            username: "alice".into(),
            operation: Operation::Update,
            resource_label: "b".into(),
        };
        let msg = commit_message(&[a, b]);
        assert_eq!(msg, "2 changes by user/alice");
    }

    /// End-to-end through `stage`/`flush` against a real local repo,
    /// without any webhook or watcher plumbing: a bare repo seeded with
    /// one commit on the destination branch (so `bootstrap`'s clone has
    /// something to check out), then a `CommitWorker` driven directly.
    fn init_bare_repo_with_branch(branch: &str) -> tempfile::TempDir {
        let bare_dir = tempfile::tempdir().expect("tempdir");
        git2::Repository::init_bare(bare_dir.path()).expect("init bare repo");

        let seed_dir = tempfile::tempdir().expect("tempdir");
        let mut init_opts = git2::RepositoryInitOptions::new();
        init_opts.initial_head("seed");
        let seed_repo = git2::Repository::init_opts(seed_dir.path(), &init_opts).expect("init seed repo");
        std::fs::write(seed_dir.path().join("README.md"), b"seed\n").expect("write seed file");
        let mut index = seed_repo.index().expect("seed index");
        index.add_path(Path::new("README.md")).expect("add seed file");
        index.write().expect("write seed index");
        let tree_oid = index.write_tree().expect("write seed tree");
        let tree = seed_repo.find_tree(tree_oid).expect("find seed tree");
        let sig = Signature::now("seed", "seed@cluster.local").expect("seed signature");
        seed_repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[]).expect("seed commit");

        let mut remote = seed_repo.remote("origin", bare_dir.path().to_str().unwrap()).expect("add remote");
        let refspec = format!("refs/heads/seed:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], None).expect("push seed commit");

        bare_dir
    }

    fn test_destination(repo_url: &str, branch: &str) -> Destination {
        Destination {
            repo_url: repo_url.to_owned(),
            branch: branch.to_owned(),
            base_path: "cluster-state".to_owned(),
            auth: Auth::Https {
                username: String::new(),
                password: String::new(),
            },
            encryption: None,
            push_strategy: crate::event::PushStrategy {
                interval: Duration::from_secs(3600),
                max_commits: 100,
            },
        }
    }

    fn test_event(name: &str, operation: Operation, username: &str, data: &str) -> Event {
        use crate::id::ResourceIdentifier;
        use crate::sanitize::{PartialObjectMeta, SanitizedObject};

        let mut payload = BTreeMap::new();
        payload.insert("data".to_owned(), serde_json::json!({"k": data}));

        Event {
            sanitized: SanitizedObject {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                metadata: PartialObjectMeta {
                    name: name.to_owned(),
                    namespace: Some("default".to_owned()),
                    labels: None,
                    annotations: None,
                },
                payload,
            },
            id: ResourceIdentifier::new("", "v1", "configmaps", "default", name),
            operation,
            user_info: crate::event::UserInfo {
                username: username.to_owned(),
                uid: String::new(),
            },
            destination_ref: crate::event::DestinationRef {
                namespace: "default".into(),
                name: "dest".into(),
            },
            rule_namespace: "default".into(),
        }
    }

    fn commit_authors(clone_dir: &Path, branch: &str) -> Vec<String> {
        let repo = Repository::open(clone_dir).expect("open clone");
        let branch_ref = repo.find_branch(branch, git2::BranchType::Local).expect("find branch");
        let tip = branch_ref.get().peel_to_commit().expect("peel branch tip");
        let mut revwalk = repo.revwalk().expect("revwalk");
        revwalk.push(tip.id()).expect("push tip");
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE).expect("set sorting");
        revwalk
            .filter_map(|oid| oid.ok())
            .filter_map(|oid| repo.find_commit(oid).ok())
            .filter(|c| c.message().is_some_and(|m| m != "seed"))
            .map(|c| c.author().name().unwrap_or_default().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn delete_is_staged_despite_matching_prior_write_content() {
        let bare_dir = init_bare_repo_with_branch("main");
        let workspace = tempfile::tempdir().expect("tempdir");
        let destination = test_destination(bare_dir.path().to_str().unwrap(), "main");
        let mut worker = CommitWorker::new(destination, workspace.path(), None, std::sync::Arc::new(NoopHealthSink));

        worker.stage(test_event("cm1", Operation::Update, "alice", "v1")).await.unwrap();
        // Same content as the write above: a naive content fingerprint
        // would make this delete look like a no-op repeat and vanish.
        worker.stage(test_event("cm1", Operation::Delete, "alice", "v1")).await.unwrap();

        assert_eq!(worker.staged.len(), 2, "delete must not be deduped against the prior write");
        assert!(matches!(worker.staged[1].operation, Operation::Delete));

        worker.flush().await.unwrap();
        let path = worker.clone_dir.join("cluster-state/v1/configmaps/default/cm1.yaml");
        assert!(!path.exists(), "deleted file must be removed from the working tree");
    }

    #[tokio::test]
    async fn oscillating_authors_on_one_path_produce_three_ordered_commits() {
        let bare_dir = init_bare_repo_with_branch("main");
        let workspace = tempfile::tempdir().expect("tempdir");
        let destination = test_destination(bare_dir.path().to_str().unwrap(), "main");
        let mut worker = CommitWorker::new(destination, workspace.path(), None, std::sync::Arc::new(NoopHealthSink));

        worker.stage(test_event("cm1", Operation::Update, "alice", "v1")).await.unwrap();
        worker.stage(test_event("cm1", Operation::Update, "bob", "v2")).await.unwrap();
        worker.stage(test_event("cm1", Operation::Update, "alice", "v3")).await.unwrap();

        assert_eq!(worker.staged.len(), 3, "all three distinct-content writes must stage, not collapse onto one path slot");

        worker.flush().await.unwrap();
        let authors = commit_authors(&worker.clone_dir, "main");
        assert_eq!(authors, vec!["alice", "bob", "alice"]);
    }
}
