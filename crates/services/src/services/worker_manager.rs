use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use git::{BranchRepo, GitAuth, GitError};
use rules::WorkerKey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::services::branch_worker::BranchWorker;
use crate::services::metrics::Metrics;
use crate::services::router::EventRouter;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("git task join error: {0}")]
    TaskJoin(String),
}

/// Creates and indexes branch workers. The manager is the only writer of
/// the router's registry; at most one worker ever exists per key, and a
/// worker lives until process exit.
pub struct WorkerManager {
    workers: DashMap<WorkerKey, Arc<BranchWorker>>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    clone_root: PathBuf,
    /// Serializes slow-path creation so concurrent ensure calls cannot race
    /// a second worker onto the same clone directory.
    creation: tokio::sync::Mutex<()>,
}

impl WorkerManager {
    pub fn new(
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
        clone_root: PathBuf,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            router,
            metrics,
            cancel,
            clone_root,
            creation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, key: &WorkerKey) -> Option<Arc<BranchWorker>> {
        self.workers.get(key).map(|entry| entry.clone())
    }

    /// Get-or-create the worker for `key`. The local clone directory is
    /// derived from the key; no two workers share a directory.
    pub async fn ensure_worker(
        &self,
        key: &WorkerKey,
        url: &str,
        auth: GitAuth,
    ) -> Result<Arc<BranchWorker>, WorkerError> {
        if let Some(worker) = self.get(key) {
            return Ok(worker);
        }
        let _creating = self.creation.lock().await;
        if let Some(worker) = self.get(key) {
            return Ok(worker);
        }

        let local_path = self.clone_dir(key);
        let url_owned = url.to_string();
        let branch = key.branch.clone();
        let repo = tokio::task::spawn_blocking(move || {
            BranchRepo::open_or_init(&url_owned, &branch, &local_path, auth)
        })
        .await
        .map_err(|e| WorkerError::TaskJoin(e.to_string()))??;

        let worker = BranchWorker::spawn(
            key.clone(),
            repo,
            self.metrics.clone(),
            self.cancel.child_token(),
        );
        self.router.register(key.clone(), worker.sender());
        self.workers.insert(key.clone(), worker.clone());
        info!(worker = %key, "branch worker created");
        Ok(worker)
    }

    fn clone_dir(&self, key: &WorkerKey) -> PathBuf {
        // branches may contain '/', flatten for the directory name
        let branch_dir = key.branch.replace('/', "__");
        self.clone_root
            .join(&key.repo_namespace)
            .join(&key.repo_name)
            .join(branch_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(branch: &str) -> WorkerKey {
        WorkerKey {
            repo_namespace: "prod".into(),
            repo_name: "repo".into(),
            branch: branch.into(),
        }
    }

    #[tokio::test]
    async fn ensure_worker_is_get_or_create() {
        let td = tempfile::TempDir::new().unwrap();
        let remote = td.path().join("remote.git");
        git2::Repository::init_bare(&remote).unwrap();
        let metrics = Metrics::unregistered();
        let router = EventRouter::new(metrics.clone());
        let manager = WorkerManager::new(
            router.clone(),
            metrics,
            td.path().join("clones"),
            CancellationToken::new(),
        );

        let url = remote.to_str().unwrap();
        let first = manager
            .ensure_worker(&key("main"), url, GitAuth::Anonymous)
            .await
            .unwrap();
        let second = manager
            .ensure_worker(&key("main"), url, GitAuth::Anonymous)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(router.has_worker(&key("main")));
    }

    #[tokio::test]
    async fn workers_for_different_branches_get_distinct_directories() {
        let td = tempfile::TempDir::new().unwrap();
        let remote = td.path().join("remote.git");
        git2::Repository::init_bare(&remote).unwrap();
        let metrics = Metrics::unregistered();
        let router = EventRouter::new(metrics.clone());
        let manager = WorkerManager::new(
            router,
            metrics,
            td.path().join("clones"),
            CancellationToken::new(),
        );
        assert_ne!(manager.clone_dir(&key("main")), manager.clone_dir(&key("develop")));
        assert_eq!(
            manager.clone_dir(&key("env/prod")),
            td.path().join("clones/prod/repo/env__prod")
        );
    }
}
