use std::path::PathBuf;
use std::sync::Arc;

use kube::Client;
use prometheus::Registry;
use rules::RuleStore;
use services::services::{
    correlation::{CorrelationStore, DEFAULT_TTL},
    metrics::Metrics,
    namespace_labels::ClientNamespaceLabels,
    pipeline::ChangePipeline,
    router::EventRouter,
    snapshot::SnapshotManager,
    supervisor::InformerSupervisor,
    targets::TargetRegistry,
    worker_manager::WorkerManager,
};
use tokio_util::sync::CancellationToken;
use utils::clock::SystemClock;

/// Everything the controllers share. Process-wide singletons (rule store,
/// correlation store) are built once here and injected explicitly.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub rule_store: Arc<RuleStore>,
    pub correlation: Arc<CorrelationStore>,
    pub router: Arc<EventRouter>,
    pub pipeline: Arc<ChangePipeline>,
    pub supervisor: Arc<InformerSupervisor>,
    pub workers: Arc<WorkerManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub targets: Arc<TargetRegistry>,
    pub metrics: Arc<Metrics>,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn initialize(
        client: Client,
        registry: &Registry,
        clone_root: PathBuf,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, prometheus::Error> {
        let metrics = Metrics::new(registry)?;
        let rule_store = Arc::new(RuleStore::new());
        let correlation = CorrelationStore::new(DEFAULT_TTL, Arc::new(SystemClock));
        let labels = Arc::new(ClientNamespaceLabels::new(client.clone()));
        let router = EventRouter::new(metrics.clone());
        let pipeline = ChangePipeline::new(
            rule_store.clone(),
            correlation.clone(),
            labels.clone(),
            router.clone(),
            metrics.clone(),
        );
        let targets = TargetRegistry::new();
        let workers = WorkerManager::new(
            router.clone(),
            metrics.clone(),
            clone_root,
            cancel.clone(),
        );
        let snapshots = SnapshotManager::new(
            client.clone(),
            rule_store.clone(),
            labels,
            targets.clone(),
        );
        let supervisor = InformerSupervisor::new(
            client.clone(),
            rule_store.clone(),
            pipeline.clone(),
            snapshots.clone(),
            targets.clone(),
            workers.clone(),
            cancel.clone(),
        );
        Ok(Arc::new(Self {
            client,
            rule_store,
            correlation,
            router,
            pipeline,
            supervisor,
            workers,
            snapshots,
            targets,
            metrics,
            cancel,
        }))
    }

    /// Background services owned by the context: the correlation sweeper
    /// and the supervisor's periodic reconcile.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.correlation.spawn_sweeper(self.cancel.clone()),
            tokio::spawn(self.supervisor.clone().run()),
        ]
    }
}
