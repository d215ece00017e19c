use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Client;
use kube::api::{Api, DynamicObject};
use kube::runtime::{WatchStreamExt, watcher};
use rules::{CompiledClusterRule, CompiledRule, Destination, Gvr, Operation, RuleStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::discovery::{DiscoveredGvr, DiscoveryPlanner, NamespaceScope};
use crate::services::pipeline::ChangePipeline;
use crate::services::snapshot::SnapshotManager;
use crate::services::targets::{TargetId, TargetRegistry};
use crate::services::worker_manager::WorkerManager;

/// Periodic reconcile cadence: picks up newly Established CRDs and recovers
/// from transient discovery failures.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the dynamic informer fleet: one watch task per discoverable
/// (GVR, namespace) pair derived from the rule set. The whole reconcile is
/// serialized under one async mutex; informer callbacks never touch it,
/// they only enqueue into the pipeline.
pub struct InformerSupervisor {
    client: Client,
    planner: DiscoveryPlanner,
    rule_store: Arc<RuleStore>,
    pipeline: Arc<ChangePipeline>,
    snapshots: Arc<SnapshotManager>,
    registry: Arc<TargetRegistry>,
    workers: Arc<WorkerManager>,
    /// GVR -> namespace ("" is cluster-wide) -> informer cancellation.
    active: tokio::sync::Mutex<HashMap<Gvr, HashMap<String, CancellationToken>>>,
    cancel: CancellationToken,
}

impl InformerSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        rule_store: Arc<RuleStore>,
        pipeline: Arc<ChangePipeline>,
        snapshots: Arc<SnapshotManager>,
        registry: Arc<TargetRegistry>,
        workers: Arc<WorkerManager>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            planner: DiscoveryPlanner::new(client.clone()),
            client,
            rule_store,
            pipeline,
            snapshots,
            registry,
            workers,
            active: tokio::sync::Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Periodic loop. Rule controllers additionally call
    /// [`Self::reconcile_for_rule_change`] directly on every rule change.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile_for_rule_change().await,
            }
        }
        info!("informer supervisor stopped");
    }

    /// Converge the informer fleet onto the desired (GVR, namespace) set.
    pub async fn reconcile_for_rule_change(&self) {
        let mut active = self.active.lock().await;

        let watch = self.rule_store.snapshot_watch_rules();
        let cluster = self.rule_store.snapshot_cluster_rules();
        let requested = DiscoveryPlanner::compute_requested_gvrs(&watch, &cluster);
        let discoverable = self.planner.filter_discoverable(&requested).await;

        let mut desired: HashMap<Gvr, (String, BTreeSet<String>)> = HashMap::new();
        for dgvr in discoverable {
            let namespaces = match DiscoveryPlanner::namespaces_for(&dgvr.gvr, &watch, &cluster) {
                NamespaceScope::ClusterWide => BTreeSet::from([String::new()]),
                NamespaceScope::Namespaces(namespaces) => namespaces,
                NamespaceScope::None => continue,
            };
            desired.insert(dgvr.gvr.clone(), (dgvr.kind, namespaces));
        }

        let mut changed: HashSet<Gvr> = HashSet::new();

        // removal is whole-GVR; extra namespaces on a kept GVR stay until
        // the GVR itself leaves the desired set
        let removed: Vec<Gvr> = active
            .keys()
            .filter(|gvr| !desired.contains_key(*gvr))
            .cloned()
            .collect();
        for gvr in removed {
            if let Some(informers) = active.remove(&gvr) {
                for (namespace, token) in informers {
                    debug!(%gvr, %namespace, "stopping informer");
                    token.cancel();
                }
            }
            self.pipeline.invalidate_gvr(&gvr);
            changed.insert(gvr);
        }

        for (gvr, (kind, namespaces)) in desired {
            let informers = active.entry(gvr.clone()).or_default();
            for namespace in namespaces {
                if informers.contains_key(&namespace) {
                    continue;
                }
                let token = self.cancel.child_token();
                let dgvr = DiscoveredGvr {
                    gvr: gvr.clone(),
                    kind: kind.clone(),
                };
                tokio::spawn(run_informer(
                    self.client.clone(),
                    dgvr,
                    namespace.clone(),
                    self.pipeline.clone(),
                    token.clone(),
                ));
                informers.insert(namespace, token);
                changed.insert(gvr.clone());
            }
        }
        drop(active);

        if !changed.is_empty() {
            self.refresh_affected_targets(&watch, &cluster, &changed);
        }
    }

    /// Restart snapshots for every target whose governing rules touch a
    /// changed GVR, in the background.
    fn refresh_affected_targets(
        &self,
        watch: &[CompiledRule],
        cluster: &[CompiledClusterRule],
        changed: &HashSet<Gvr>,
    ) {
        let affected = affected_targets(&self.registry.all_destinations(), watch, cluster, changed);
        if affected.is_empty() {
            return;
        }
        let snapshots = self.snapshots.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            for (target, destination) in affected {
                let Some(worker) = workers.get(&destination.worker_key()) else {
                    // target not bootstrapped yet; its controller will seed it
                    debug!(target = %target, "no worker yet, skipping snapshot refresh");
                    continue;
                };
                info!(target = %target, "informer set changed, refreshing snapshot");
                snapshots.start(target, destination, worker);
            }
        });
    }
}

fn affected_targets(
    targets: &[(TargetId, Destination)],
    watch: &[CompiledRule],
    cluster: &[CompiledClusterRule],
    changed: &HashSet<Gvr>,
) -> Vec<(TargetId, Destination)> {
    targets
        .iter()
        .filter(|(_, destination)| {
            watch.iter().any(|rule| {
                rule.destination == *destination && changed.iter().any(|gvr| rule.selects_gvr(gvr))
            }) || cluster.iter().any(|rule| {
                rule.destination == *destination && changed.iter().any(|gvr| rule.selects_gvr(gvr))
            })
        })
        .cloned()
        .collect()
}

fn object_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

/// One watch task for one (GVR, namespace). The watcher relists on start
/// and after connection loss; the per-task seen-set turns the first
/// observation of an id into CREATE and later ones into UPDATE, and the
/// pipeline's content hash drops relist echoes.
async fn run_informer(
    client: Client,
    dgvr: DiscoveredGvr,
    namespace: String,
    pipeline: Arc<ChangePipeline>,
    cancel: CancellationToken,
) {
    let api: Api<DynamicObject> = if namespace.is_empty() {
        Api::all_with(client, &dgvr.api_resource())
    } else {
        Api::namespaced_with(client, &namespace, &dgvr.api_resource())
    };
    let gvr = dgvr.gvr.clone();
    info!(%gvr, namespace = %namespace, "informer started");

    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    futures::pin_mut!(stream);
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                let op = if seen.insert(object_key(&obj)) {
                    Operation::Create
                } else {
                    Operation::Update
                };
                pipeline.process(&obj, &gvr, op).await;
            }
            Some(Ok(watcher::Event::Delete(obj))) => {
                seen.remove(&object_key(&obj));
                pipeline.process(&obj, &gvr, Operation::Delete).await;
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
            Some(Err(e)) => warn!(%gvr, namespace = %namespace, "watch error: {e}"),
            None => break,
        }
    }
    info!(%gvr, namespace = %namespace, "informer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules::{ApiScope, CompiledSelector, RuleKey, ScopedSelector};

    fn destination(namespace: &str) -> Destination {
        Destination {
            repo_name: "repo".into(),
            repo_namespace: namespace.into(),
            branch: "main".into(),
            base_path: format!("clusters/{namespace}"),
        }
    }

    fn selector(group: &str, resource: &str) -> CompiledSelector {
        CompiledSelector {
            api_groups: vec![group.into()],
            api_versions: vec!["v1".into()],
            resources: vec![resource.into()],
            operations: Vec::new(),
            label_selector: None,
            namespace_selector: None,
        }
    }

    #[test]
    fn affected_targets_follow_their_rules() {
        let prod = (
            TargetId {
                namespace: "prod".into(),
                name: "mirror".into(),
            },
            destination("prod"),
        );
        let staging = (
            TargetId {
                namespace: "staging".into(),
                name: "mirror".into(),
            },
            destination("staging"),
        );
        let watch = vec![
            CompiledRule {
                key: RuleKey {
                    namespace: "prod".into(),
                    name: "deployments".into(),
                },
                source_namespace: "prod".into(),
                selectors: vec![selector("apps", "deployments")],
                destination: destination("prod"),
            },
            CompiledRule {
                key: RuleKey {
                    namespace: "staging".into(),
                    name: "configmaps".into(),
                },
                source_namespace: "staging".into(),
                selectors: vec![selector("", "configmaps")],
                destination: destination("staging"),
            },
        ];
        let changed = HashSet::from([Gvr::namespaced("apps", "v1", "deployments")]);
        let affected = affected_targets(
            &[prod.clone(), staging],
            &watch,
            &[],
            &changed,
        );
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].0, prod.0);
    }

    #[test]
    fn cluster_rules_also_mark_targets_affected() {
        let ops = (
            TargetId {
                namespace: "ops".into(),
                name: "all".into(),
            },
            destination("ops"),
        );
        let cluster = vec![CompiledClusterRule {
            key: RuleKey {
                namespace: String::new(),
                name: "namespaces".into(),
            },
            selectors: vec![ScopedSelector {
                selector: selector("", "namespaces"),
                scope: ApiScope::Cluster,
            }],
            destination: destination("ops"),
        }];
        let changed = HashSet::from([Gvr::cluster("", "v1", "namespaces")]);
        let affected = affected_targets(&[ops.clone()], &[], &cluster, &changed);
        assert_eq!(affected.len(), 1);
    }
}
