use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crd::SnapshotStats;
use dashmap::DashMap;
use kube::Client;
use kube::api::{Api, DynamicObject, ListParams};
use rules::{
    CompiledClusterRule, CompiledRule, Destination, Event, Operation, ResourceIdentifier,
    RuleStore,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::branch_worker::BranchWorker;
use crate::services::discovery::{DiscoveryPlanner, NamespaceScope};
use crate::services::namespace_labels::NamespaceLabelSource;
use crate::services::sanitize::Sanitizer;
use crate::services::targets::{TargetId, TargetRegistry};

const LIST_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error("object not renderable: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("snapshot cancelled")]
    Cancelled,
}

/// Progress of one snapshot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    IdleNotStarted,
    Listing,
    Diffing,
    Applying,
    Completed(SnapshotStats),
    Failed(String),
}

struct SnapshotHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SnapshotState>,
}

/// Drives the per-target list → diff → apply state machine that brings a
/// branch basePath to parity with live cluster state before streaming
/// takes over. At most one run is active per target; starting a new run
/// abandons the old one (its queued events stay valid, at-least-once).
pub struct SnapshotManager {
    client: Client,
    rule_store: Arc<RuleStore>,
    labels: Arc<dyn NamespaceLabelSource>,
    planner: DiscoveryPlanner,
    registry: Arc<TargetRegistry>,
    active: DashMap<TargetId, SnapshotHandle>,
}

impl SnapshotManager {
    pub fn new(
        client: Client,
        rule_store: Arc<RuleStore>,
        labels: Arc<dyn NamespaceLabelSource>,
        registry: Arc<TargetRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            planner: DiscoveryPlanner::new(client.clone()),
            client,
            rule_store,
            labels,
            registry,
            active: DashMap::new(),
        })
    }

    /// Start (or restart) the snapshot for one target. The stream state
    /// drops back to pending until the new run completes.
    pub fn start(
        self: &Arc<Self>,
        target: TargetId,
        destination: Destination,
        worker: Arc<BranchWorker>,
    ) {
        self.cancel(&target);
        self.registry.reset_stream(&target);
        let (state_tx, state_rx) = watch::channel(SnapshotState::Listing);
        let cancel = CancellationToken::new();
        let handle = SnapshotHandle {
            cancel: cancel.clone(),
            state: state_rx,
        };
        let manager = self.clone();
        let id = target.clone();
        tokio::spawn(async move {
            let result = manager
                .run(&id, &destination, worker, &state_tx, &cancel)
                .await;
            match result {
                Ok(stats) => {
                    info!(target = %id, ?stats, "snapshot completed");
                    let _ = state_tx.send(SnapshotState::Completed(stats));
                    manager.registry.set_stream_live(&id);
                }
                Err(SnapshotError::Cancelled) => {
                    debug!(target = %id, "snapshot abandoned");
                }
                Err(e) => {
                    warn!(target = %id, "snapshot failed: {e}");
                    let _ = state_tx.send(SnapshotState::Failed(e.to_string()));
                }
            }
        });
        self.active.insert(target, handle);
    }

    pub fn state(&self, target: &TargetId) -> SnapshotState {
        self.active
            .get(target)
            .map(|handle| handle.state.borrow().clone())
            .unwrap_or(SnapshotState::IdleNotStarted)
    }

    /// Abandon the in-flight run, if any. Queued events remain valid.
    pub fn cancel(&self, target: &TargetId) {
        if let Some((_, handle)) = self.active.remove(target) {
            handle.cancel.cancel();
        }
    }

    async fn run(
        &self,
        target: &TargetId,
        destination: &Destination,
        worker: Arc<BranchWorker>,
        state: &watch::Sender<SnapshotState>,
        cancel: &CancellationToken,
    ) -> Result<SnapshotStats, SnapshotError> {
        let governing_watch: Vec<CompiledRule> = self
            .rule_store
            .snapshot_watch_rules()
            .into_iter()
            .filter(|rule| rule.destination == *destination)
            .collect();
        let governing_cluster: Vec<CompiledClusterRule> = self
            .rule_store
            .snapshot_cluster_rules()
            .into_iter()
            .filter(|rule| rule.destination == *destination)
            .collect();

        let _ = state.send(SnapshotState::Listing);
        let live = self
            .list_live(target, &governing_watch, &governing_cluster, cancel)
            .await?;

        let _ = state.send(SnapshotState::Diffing);
        let base = destination.base_path.trim_matches('/').to_string();
        let disk = self.read_disk(&worker, &base).await?;
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        let plan = compute_diff(&live, &disk);
        debug!(
            target = %target,
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "snapshot diff computed"
        );

        let _ = state.send(SnapshotState::Applying);
        let stats = SnapshotStats {
            created: plan.creates.len() as u64,
            updated: plan.updates.len() as u64,
            deleted: plan.deletes.len() as u64,
        };
        self.apply(&worker, &base, &live, plan)?;
        Ok(stats)
    }

    async fn list_live(
        &self,
        target: &TargetId,
        watch: &[CompiledRule],
        cluster: &[CompiledClusterRule],
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, LiveObject>, SnapshotError> {
        let sanitizer = Sanitizer::new();
        let requested = DiscoveryPlanner::compute_requested_gvrs(watch, cluster);
        let discoverable = self.planner.filter_discoverable(&requested).await;
        let mut live = BTreeMap::new();

        for dgvr in discoverable {
            let apis: Vec<Api<DynamicObject>> =
                match DiscoveryPlanner::namespaces_for(&dgvr.gvr, watch, cluster) {
                    NamespaceScope::ClusterWide => {
                        vec![Api::all_with(self.client.clone(), &dgvr.api_resource())]
                    }
                    NamespaceScope::Namespaces(namespaces) => namespaces
                        .iter()
                        .map(|ns| {
                            Api::namespaced_with(self.client.clone(), ns, &dgvr.api_resource())
                        })
                        .collect(),
                    NamespaceScope::None => continue,
                };
            for api in apis {
                let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
                loop {
                    if cancel.is_cancelled() {
                        return Err(SnapshotError::Cancelled);
                    }
                    let page = api.list(&params).await?;
                    for obj in page.items {
                        let Some(name) = obj.metadata.name.clone() else {
                            continue;
                        };
                        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
                        let labels = obj.metadata.labels.clone().unwrap_or_default();
                        let namespace_labels = if namespace.is_empty() || cluster.is_empty() {
                            BTreeMap::new()
                        } else {
                            self.labels.labels(&namespace).await
                        };
                        let matched = watch
                            .iter()
                            .any(|rule| rule.matches_for_seed(&dgvr.gvr, &namespace, &labels))
                            || cluster.iter().any(|rule| {
                                rule.matches_for_seed(&dgvr.gvr, &labels, &namespace_labels)
                            });
                        if !matched {
                            continue;
                        }
                        let id = ResourceIdentifier::new(&dgvr.gvr, &namespace, &name);
                        let raw = match serde_json::to_value(&obj) {
                            Ok(raw) => raw,
                            Err(e) => {
                                warn!(target = %target, id = %id, "unserializable object: {e}");
                                continue;
                            }
                        };
                        let sanitized = sanitizer.sanitize(&raw);
                        let yaml = sanitizer.canonical_yaml(&sanitized)?;
                        live.insert(
                            id.to_git_path(),
                            LiveObject {
                                id,
                                sanitized,
                                yaml,
                            },
                        );
                    }
                    match page.metadata.continue_ {
                        Some(token) if !token.is_empty() => {
                            params.continue_token = Some(token);
                        }
                        _ => break,
                    }
                }
            }
        }
        Ok(live)
    }

    /// Committed files under the basePath, keyed by path relative to it.
    /// Files whose paths do not parse back into an id are not ours and are
    /// left untouched.
    async fn read_disk(
        &self,
        worker: &BranchWorker,
        base: &str,
    ) -> Result<BTreeMap<String, String>, SnapshotError> {
        let mut disk = BTreeMap::new();
        for full in worker.list_files(base).await? {
            let rel = if base.is_empty() {
                full.clone()
            } else {
                match full.strip_prefix(&format!("{base}/")) {
                    Some(rel) => rel.to_string(),
                    None => continue,
                }
            };
            if ResourceIdentifier::from_git_path(&rel).is_none() {
                continue;
            }
            let content = worker.read_file(&full).await?.unwrap_or_default();
            disk.insert(rel, content);
        }
        Ok(disk)
    }

    /// Enqueue the plan as synthetic events followed by the SEED_SYNC
    /// sweep marker. The worker writes directly into the branch; the
    /// pipeline's dedup map is never consulted on this path.
    fn apply(
        &self,
        worker: &BranchWorker,
        base: &str,
        live: &BTreeMap<String, LiveObject>,
        plan: DiffPlan,
    ) -> Result<(), SnapshotError> {
        let written: HashSet<String> = live
            .keys()
            .map(|rel| join_under(base, rel))
            .collect();
        for (rel, op) in plan
            .creates
            .iter()
            .map(|rel| (rel, Operation::Create))
            .chain(plan.updates.iter().map(|rel| (rel, Operation::Update)))
        {
            let object = &live[rel];
            worker.enqueue(Event {
                object: Some(object.sanitized.clone()),
                id: object.id.clone(),
                operation: op,
                user: None,
                base_path: base.to_string(),
            });
        }
        for rel in &plan.deletes {
            let Some(id) = ResourceIdentifier::from_git_path(rel) else {
                continue;
            };
            worker.enqueue(Event {
                object: None,
                id,
                operation: Operation::Delete,
                user: None,
                base_path: base.to_string(),
            });
        }
        worker.set_snapshot_written(base, written);
        worker.enqueue(Event {
            object: None,
            id: ResourceIdentifier::sweep_marker(),
            operation: Operation::SeedSync,
            user: None,
            base_path: base.to_string(),
        });
        Ok(())
    }
}

struct LiveObject {
    id: ResourceIdentifier,
    sanitized: serde_json::Value,
    yaml: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DiffPlan {
    creates: Vec<String>,
    updates: Vec<String>,
    deletes: Vec<String>,
}

/// Pure diff between live state and the parsed on-disk set, all keyed by
/// basePath-relative git path.
fn compute_diff(live: &BTreeMap<String, LiveObject>, disk: &BTreeMap<String, String>) -> DiffPlan {
    let mut plan = DiffPlan::default();
    for (rel, object) in live {
        match disk.get(rel) {
            None => plan.creates.push(rel.clone()),
            Some(content) if *content != object.yaml => plan.updates.push(rel.clone()),
            Some(_) => {}
        }
    }
    let live_keys: BTreeSet<&String> = live.keys().collect();
    for rel in disk.keys() {
        if !live_keys.contains(rel) {
            plan.deletes.push(rel.clone());
        }
    }
    plan
}

fn join_under(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{base}/{rel}")
    }
}
