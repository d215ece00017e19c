use std::sync::Arc;
use std::time::Duration;

use crd::{Target, TargetStatus};
use kube::Api;
use kube::api::{Patch, PatchParams};
use rules::Destination;
use serde_json::json;
use tracing::{debug, warn};
use utils::retry::RetryConfig;

use crate::context::Context;
use crate::error::Result;

pub mod cluster_watch_rule;
pub mod target;
pub mod watch_rule;

/// Requeue cadences: failed gates retry short, secret/auth failures retry
/// medium, Ready targets revalidate long.
pub(crate) const REQUEUE_SHORT: Duration = Duration::from_secs(2 * 60);
pub(crate) const REQUEUE_MEDIUM: Duration = Duration::from_secs(5 * 60);
pub(crate) const REQUEUE_LONG: Duration = Duration::from_secs(10 * 60);

/// Patch a target's status subresource, retrying conflicts with backoff.
/// A deleted target is treated as success.
pub(crate) async fn patch_target_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &TargetStatus,
) -> Result<()> {
    let api: Api<Target> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = Patch::Merge(json!({ "status": status }));
    let mut delays = RetryConfig::status_updates().delays();
    loop {
        match api.patch_status(name, &PatchParams::default(), &patch).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(%namespace, %name, "target gone while patching status");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(kube::Error::Api(e).into()),
            },
            Err(e) => return Err(e.into()),
        }
    }
}

/// Rule changes reconcile the informer fleet immediately, off the
/// controller's reconcile path.
pub(crate) fn trigger_informer_reconcile(ctx: &Arc<Context>) {
    let supervisor = ctx.supervisor.clone();
    tokio::spawn(async move {
        supervisor.reconcile_for_rule_change().await;
    });
}

/// Restart the snapshot of the target bound to `destination`, if it is
/// already bootstrapped. Rule content changes (selectors, labels) need a
/// fresh diff even when the informer set is unchanged.
pub(crate) fn refresh_destination_snapshot(ctx: &Arc<Context>, destination: &Destination) {
    let Some((target, _)) = ctx
        .targets
        .all_destinations()
        .into_iter()
        .find(|(_, d)| d == destination)
    else {
        return;
    };
    let Some(worker) = ctx.workers.get(&destination.worker_key()) else {
        warn!(target = %target, "destination has no worker yet, snapshot deferred");
        return;
    };
    ctx.snapshots.start(target, destination.clone(), worker);
}
