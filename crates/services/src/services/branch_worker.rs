use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use git::{BranchRepo, CommitIdentity, FileMutation, GitError, RepoMetadata};
use rules::{Event, Operation, WorkerKey};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utils::retry::RetryConfig;

use crate::services::metrics::Metrics;
use crate::services::sanitize::Sanitizer;

/// Batch boundary: at most this many files per commit.
const BATCH_MAX_FILES: usize = 64;
/// Batch boundary: wait at most this long for more events.
const BATCH_MAX_WAIT: Duration = Duration::from_millis(250);
/// Metadata queries hit the remote at most once per this window.
const METADATA_CACHE: Duration = Duration::from_secs(30);

pub fn service_identity() -> CommitIdentity {
    CommitIdentity::new("gitmirror", "noreply@gitmirror.dev")
}

fn identity_for(user: Option<&str>) -> CommitIdentity {
    match user {
        Some(user) => CommitIdentity::new(user, format!("{user}@gitmirror.dev")),
        None => service_identity(),
    }
}

fn join_base(base_path: &str, rel: &str) -> String {
    let base = base_path.trim_matches('/');
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{base}/{rel}")
    }
}

struct WorkerShared {
    base_paths: StdRwLock<BTreeSet<String>>,
    /// Per basePath: the git paths the owning snapshot run wrote. Consumed
    /// by the next SEED_SYNC sweep; a sweep without a set is skipped.
    snapshot_written: StdMutex<HashMap<String, HashSet<String>>>,
    last_error: StdMutex<Option<String>>,
    last_push: StdMutex<Option<(String, DateTime<Utc>)>>,
    metadata: tokio::sync::Mutex<Option<(Instant, RepoMetadata)>>,
}

/// Single writer for one `(repoNamespace, repoName, branch)`. Owns the local
/// clone exclusively and drains an unbounded event queue on one task;
/// producers never block. Lives until process exit.
pub struct BranchWorker {
    key: WorkerKey,
    sender: UnboundedSender<Event>,
    repo: Arc<BranchRepo>,
    /// Serializes every git operation on the clone; never held across
    /// non-git awaits.
    git_gate: Arc<tokio::sync::Mutex<()>>,
    shared: Arc<WorkerShared>,
    sanitizer: Sanitizer,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
}

impl BranchWorker {
    pub(crate) fn spawn(
        key: WorkerKey,
        repo: BranchRepo,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (sender, receiver) = unbounded_channel();
        let worker = Arc::new(Self {
            key,
            sender,
            repo: Arc::new(repo),
            git_gate: Arc::new(tokio::sync::Mutex::new(())),
            shared: Arc::new(WorkerShared {
                base_paths: StdRwLock::new(BTreeSet::new()),
                snapshot_written: StdMutex::new(HashMap::new()),
                last_error: StdMutex::new(None),
                last_push: StdMutex::new(None),
                metadata: tokio::sync::Mutex::new(None),
            }),
            sanitizer: Sanitizer::new(),
            metrics,
            retry: RetryConfig::remote_ops(),
        });
        tokio::spawn(worker.clone().run(receiver, cancel));
        worker
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub(crate) fn sender(&self) -> UnboundedSender<Event> {
        self.sender.clone()
    }

    /// Direct enqueue for snapshot-originated synthetic events.
    pub fn enqueue(&self, event: Event) -> bool {
        if self.sender.send(event).is_ok() {
            self.metrics.commit_queue_size.inc();
            true
        } else {
            false
        }
    }

    pub fn register_base_path(&self, base_path: &str) {
        self.shared
            .base_paths
            .write()
            .unwrap()
            .insert(base_path.trim_matches('/').to_string());
    }

    pub fn deregister_base_path(&self, base_path: &str) {
        let base = base_path.trim_matches('/');
        self.shared.base_paths.write().unwrap().remove(base);
        self.shared.snapshot_written.lock().unwrap().remove(base);
    }

    pub fn registered_base_paths(&self) -> BTreeSet<String> {
        self.shared.base_paths.read().unwrap().clone()
    }

    /// Record the exact file set a snapshot run materialized so the
    /// following SEED_SYNC can sweep orphans.
    pub fn set_snapshot_written(&self, base_path: &str, written: HashSet<String>) {
        self.shared
            .snapshot_written
            .lock()
            .unwrap()
            .insert(base_path.trim_matches('/').to_string(), written);
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    pub fn last_push(&self) -> Option<(String, DateTime<Utc>)> {
        self.shared.last_push.lock().unwrap().clone()
    }

    /// Committed files under `base_path` on the local branch.
    pub async fn list_files(&self, base_path: &str) -> Result<Vec<String>, GitError> {
        let _gate = self.git_gate.lock().await;
        let repo = self.repo.clone();
        let base = base_path.to_string();
        tokio::task::spawn_blocking(move || repo.list_files_under(&base))
            .await
            .map_err(join_err)?
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<String>, GitError> {
        let _gate = self.git_gate.lock().await;
        let repo = self.repo.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || repo.read_file(&path))
            .await
            .map_err(join_err)?
    }

    /// Make sure the branch exists remotely and the basePath is
    /// initialized, creating a placeholder commit on an empty branch.
    pub async fn bootstrap(&self, base_path: &str) -> Result<(), GitError> {
        self.register_base_path(base_path);
        let _gate = self.git_gate.lock().await;
        let repo = self.repo.clone();
        let retry = self.retry;
        let metrics = self.metrics.clone();
        let base = base_path.trim_matches('/').to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            if repo.fetch()? {
                repo.checkout()?;
            }
            let placeholder = join_base(&base, git::KEEP_FILE);
            if repo.head_sha()?.is_some() && repo.read_file(&placeholder)?.is_some() {
                return Ok(None);
            }
            let mutations = vec![FileMutation {
                path: placeholder,
                content: Some(String::new()),
            }];
            commit_push_replay(
                &repo,
                &mutations,
                &format!("chore: initialize {base}"),
                &service_identity(),
                &retry,
                &metrics,
            )
        })
        .await
        .map_err(join_err)??;
        if let Some(sha) = outcome {
            info!(worker = %self.key, %sha, "bootstrapped branch");
            self.record_push(sha);
        }
        Ok(())
    }

    /// HEAD sha, remote existence, and incoming-change count, cached for
    /// 30 seconds to avoid rate-limiting the remote.
    pub async fn sync_and_get_metadata(&self) -> Result<RepoMetadata, GitError> {
        let mut cached = self.shared.metadata.lock().await;
        if let Some((at, metadata)) = cached.as_ref()
            && at.elapsed() < METADATA_CACHE
        {
            return Ok(metadata.clone());
        }
        let metadata = {
            let _gate = self.git_gate.lock().await;
            let repo = self.repo.clone();
            tokio::task::spawn_blocking(move || repo.sync_and_get_metadata())
                .await
                .map_err(join_err)??
        };
        *cached = Some((Instant::now(), metadata.clone()));
        Ok(metadata)
    }

    async fn run(
        self: Arc<Self>,
        mut receiver: UnboundedReceiver<Event>,
        cancel: CancellationToken,
    ) {
        debug!(worker = %self.key, "branch worker started");
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let mut batch = vec![first];
            if batch[0].operation != Operation::SeedSync {
                let deadline = tokio::time::sleep(BATCH_MAX_WAIT);
                tokio::pin!(deadline);
                while batch.len() < BATCH_MAX_FILES {
                    tokio::select! {
                        _ = &mut deadline => break,
                        _ = cancel.cancelled() => break,
                        event = receiver.recv() => match event {
                            Some(event) => {
                                let is_seed = event.operation == Operation::SeedSync;
                                batch.push(event);
                                if is_seed {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            self.metrics.commit_queue_size.sub(batch.len() as i64);
            self.process_batch(batch).await;
        }
        debug!(worker = %self.key, "branch worker stopped");
    }

    async fn process_batch(&self, batch: Vec<Event>) {
        let mut pending = Vec::new();
        for event in batch {
            if event.operation == Operation::SeedSync {
                if !pending.is_empty() {
                    self.flush(std::mem::take(&mut pending)).await;
                }
                self.orphan_sweep(&event).await;
            } else {
                pending.push(event);
            }
        }
        if !pending.is_empty() {
            self.flush(pending).await;
        }
    }

    /// Turn a batch of events into one commit and push it.
    async fn flush(&self, events: Vec<Event>) {
        let mut mutations = Vec::with_capacity(events.len());
        let mut created = 0usize;
        let mut updated = 0usize;
        let mut deleted = 0usize;
        let mut user: Option<String> = None;
        for event in &events {
            let path = join_base(&event.base_path, &event.id.to_git_path());
            match event.operation {
                Operation::Create | Operation::Update => {
                    let Some(object) = &event.object else {
                        warn!(worker = %self.key, id = %event.id, "event without object, skipping");
                        continue;
                    };
                    let content = match self.sanitizer.canonical_yaml(object) {
                        Ok(content) => content,
                        Err(e) => {
                            error!(worker = %self.key, id = %event.id, "failed to render yaml: {e}");
                            continue;
                        }
                    };
                    if event.operation == Operation::Create {
                        created += 1;
                    } else {
                        updated += 1;
                    }
                    mutations.push(FileMutation {
                        path,
                        content: Some(content),
                    });
                }
                Operation::Delete => {
                    deleted += 1;
                    mutations.push(FileMutation {
                        path,
                        content: None,
                    });
                }
                Operation::SeedSync => unreachable!("seed events are handled in process_batch"),
            }
            if user.is_none() {
                user = event.user.clone();
            }
        }
        if mutations.is_empty() {
            return;
        }
        let message = commit_message(created, updated, deleted);
        let identity = identity_for(user.as_deref());
        match self.commit_and_push(mutations, message, identity).await {
            Ok(Some(sha)) => {
                self.record_push(sha);
                self.metrics.events_processed.inc_by(events.len() as u64);
            }
            Ok(None) => {
                // tree already converged, nothing committed
                self.metrics.events_processed.inc_by(events.len() as u64);
            }
            Err(e) => {
                error!(worker = %self.key, "commit failed after retries: {e}");
                *self.shared.last_error.lock().unwrap() = Some(e.to_string());
                // leave the local state for the next drain and requeue
                for event in events {
                    if self.sender.send(event).is_ok() {
                        self.metrics.commit_queue_size.inc();
                    }
                }
            }
        }
    }

    /// Delete files under the swept basePaths that the owning snapshot did
    /// not write. An empty basePath sweeps every registered path; a path
    /// with no recorded written-set is skipped.
    async fn orphan_sweep(&self, event: &Event) {
        let targets: Vec<String> = if event.base_path.is_empty() {
            self.registered_base_paths().into_iter().collect()
        } else {
            vec![event.base_path.trim_matches('/').to_string()]
        };
        for base in targets {
            let Some(written) = self.shared.snapshot_written.lock().unwrap().remove(&base) else {
                debug!(worker = %self.key, %base, "no written set recorded, skipping sweep");
                continue;
            };
            let orphans = {
                let _gate = self.git_gate.lock().await;
                let repo = self.repo.clone();
                let base_for_task = base.clone();
                match tokio::task::spawn_blocking(move || repo.orphans_under(&base_for_task, &written))
                    .await
                    .map_err(join_err)
                    .and_then(|r| r)
                {
                    Ok(orphans) => orphans,
                    Err(e) => {
                        error!(worker = %self.key, %base, "orphan listing failed: {e}");
                        continue;
                    }
                }
            };
            if orphans.is_empty() {
                continue;
            }
            info!(worker = %self.key, %base, count = orphans.len(), "removing orphans");
            let mutations = orphans
                .into_iter()
                .map(|path| FileMutation {
                    path,
                    content: None,
                })
                .collect();
            match self
                .commit_and_push(
                    mutations,
                    "reconcile: remove orphans".to_string(),
                    service_identity(),
                )
                .await
            {
                Ok(Some(sha)) => self.record_push(sha),
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.key, %base, "orphan sweep commit failed: {e}");
                    *self.shared.last_error.lock().unwrap() = Some(e.to_string());
                }
            }
        }
    }

    async fn commit_and_push(
        &self,
        mutations: Vec<FileMutation>,
        message: String,
        identity: CommitIdentity,
    ) -> Result<Option<String>, GitError> {
        let _gate = self.git_gate.lock().await;
        let repo = self.repo.clone();
        let retry = self.retry;
        let metrics = self.metrics.clone();
        tokio::task::spawn_blocking(move || {
            if repo.fetch()? {
                repo.checkout()?;
            }
            commit_push_replay(&repo, &mutations, &message, &identity, &retry, &metrics)
        })
        .await
        .map_err(join_err)?
    }

    fn record_push(&self, sha: String) {
        *self.shared.last_error.lock().unwrap() = None;
        *self.shared.last_push.lock().unwrap() = Some((sha, Utc::now()));
    }
}

/// Apply, commit, push; on a non-fast-forward rejection fetch + reset to
/// the remote head and replay the same mutations (last-writer-wins for the
/// paths this worker owns, everything else is untouched).
fn commit_push_replay(
    repo: &BranchRepo,
    mutations: &[FileMutation],
    message: &str,
    identity: &CommitIdentity,
    retry: &RetryConfig,
    metrics: &Metrics,
) -> Result<Option<String>, GitError> {
    repo.apply_mutations(mutations)?;
    let mut sha = repo.commit(message, identity)?;
    if sha.is_none() && repo.head_sha()?.is_none() {
        // unborn branch with nothing staged, nothing to push
        return Ok(None);
    }
    let delays: Vec<Duration> = retry.delays().collect();
    let mut attempt = 0usize;
    loop {
        match repo.push() {
            Ok(()) => return Ok(sha),
            Err(e) if e.is_non_fast_forward() && attempt < delays.len() => {
                metrics.push_retries.inc();
                warn!(
                    attempt = attempt + 1,
                    "push rejected as non-fast-forward, replaying"
                );
                std::thread::sleep(delays[attempt]);
                attempt += 1;
                repo.fetch()?;
                repo.hard_reset_to_remote()?;
                repo.apply_mutations(mutations)?;
                if let Some(new_sha) = repo.commit(message, identity)? {
                    sha = Some(new_sha);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn commit_message(created: usize, updated: usize, deleted: usize) -> String {
    let mut parts = Vec::new();
    if created > 0 {
        parts.push(format!("{created} created"));
    }
    if updated > 0 {
        parts.push(format!("{updated} updated"));
    }
    if deleted > 0 {
        parts.push(format!("{deleted} deleted"));
    }
    if parts.is_empty() {
        "mirror: sync".to_string()
    } else {
        format!("mirror: {}", parts.join(", "))
    }
}

fn join_err(e: tokio::task::JoinError) -> GitError {
    GitError::InvalidRepository(format!("git task join error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_messages_summarize_counts() {
        assert_eq!(commit_message(2, 0, 0), "mirror: 2 created");
        assert_eq!(commit_message(1, 3, 2), "mirror: 1 created, 3 updated, 2 deleted");
        assert_eq!(commit_message(0, 0, 0), "mirror: sync");
    }

    #[test]
    fn identity_prefers_correlated_user() {
        let id = identity_for(Some("alice"));
        assert_eq!(id.name, "alice");
        assert_eq!(id.email, "alice@gitmirror.dev");
        let service = identity_for(None);
        assert_eq!(service.name, "gitmirror");
    }

    #[test]
    fn join_base_handles_empty_and_slashes() {
        assert_eq!(join_base("", "v1/x.yaml"), "v1/x.yaml");
        assert_eq!(join_base("clusters/prod/", "v1/x.yaml"), "clusters/prod/v1/x.yaml");
        assert_eq!(join_base("/clusters/prod", "v1/x.yaml"), "clusters/prod/v1/x.yaml");
    }
}
