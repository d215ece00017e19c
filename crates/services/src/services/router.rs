use std::sync::Arc;

use dashmap::DashMap;
use rules::{Event, WorkerKey};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::services::metrics::Metrics;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no branch worker registered for {0}")]
    NoWorker(WorkerKey),
    #[error("branch worker for {0} is gone")]
    WorkerGone(WorkerKey),
}

/// Routes events to the branch worker owning `(repoNamespace, repoName,
/// branch)`. The registry is an index: the router only reads it; the worker
/// manager writes it. A missing worker fails closed: the event is dropped,
/// counted, and the caller proceeds.
pub struct EventRouter {
    registry: DashMap<WorkerKey, UnboundedSender<Event>>,
    metrics: Arc<Metrics>,
}

impl EventRouter {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            registry: DashMap::new(),
            metrics,
        })
    }

    pub fn route(&self, key: &WorkerKey, event: Event) -> Result<(), RouteError> {
        let Some(sender) = self.registry.get(key) else {
            debug!(worker = %key, id = %event.id, "no worker registered, dropping event");
            self.metrics.events_dropped.inc();
            return Err(RouteError::NoWorker(key.clone()));
        };
        if sender.send(event).is_err() {
            debug!(worker = %key, "worker queue closed, dropping event");
            self.metrics.events_dropped.inc();
            return Err(RouteError::WorkerGone(key.clone()));
        }
        self.metrics.commit_queue_size.inc();
        Ok(())
    }

    pub fn has_worker(&self, key: &WorkerKey) -> bool {
        self.registry.contains_key(key)
    }

    pub(crate) fn register(&self, key: WorkerKey, sender: UnboundedSender<Event>) {
        self.registry.insert(key, sender);
    }

    #[allow(dead_code)]
    pub(crate) fn deregister(&self, key: &WorkerKey) {
        self.registry.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules::{Gvr, Operation, ResourceIdentifier};

    fn event() -> Event {
        Event {
            object: None,
            id: ResourceIdentifier::new(&Gvr::namespaced("apps", "v1", "deployments"), "prod", "api"),
            operation: Operation::Delete,
            user: None,
            base_path: "clusters/prod".into(),
        }
    }

    fn key() -> WorkerKey {
        WorkerKey {
            repo_namespace: "prod".into(),
            repo_name: "repo".into(),
            branch: "main".into(),
        }
    }

    #[test]
    fn missing_worker_fails_closed_and_counts() {
        let metrics = Metrics::unregistered();
        let router = EventRouter::new(metrics.clone());
        let err = router.route(&key(), event()).unwrap_err();
        assert!(matches!(err, RouteError::NoWorker(_)));
        assert_eq!(metrics.events_dropped.get(), 1);
    }

    #[test]
    fn registered_worker_receives_events_in_order() {
        let metrics = Metrics::unregistered();
        let router = EventRouter::new(metrics.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        router.register(key(), tx);

        router.route(&key(), event()).unwrap();
        router.route(&key(), event()).unwrap();
        assert_eq!(metrics.commit_queue_size.get(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_reported() {
        let metrics = Metrics::unregistered();
        let router = EventRouter::new(metrics.clone());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        router.register(key(), tx);
        drop(rx);
        let err = router.route(&key(), event()).unwrap_err();
        assert!(matches!(err, RouteError::WorkerGone(_)));
    }
}
