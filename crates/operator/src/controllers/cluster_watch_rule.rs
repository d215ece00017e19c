use std::sync::Arc;

use crd::{ClusterWatchRule, Target};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::ResourceExt;
use rules::{RuleKey, compile_cluster_watch_rule};
use tracing::{error, info, warn};

use crate::context::Context;
use crate::controllers::watch_rule::destination_for;
use crate::controllers::{
    REQUEUE_LONG, REQUEUE_MEDIUM, REQUEUE_SHORT, refresh_destination_snapshot,
    trigger_informer_reconcile,
};
use crate::error::{Error, Result};

pub const FINALIZER: &str = "gitmirror.dev/clusterwatchrule-cleanup";

pub async fn run(ctx: Arc<Context>) {
    let api = Api::<ClusterWatchRule>::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("cluster watch rule controller shutdown complete");
}

async fn reconcile(rule: Arc<ClusterWatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let api = Api::<ClusterWatchRule>::all(ctx.client.clone());
    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => apply(rule, ctx.clone()).await,
            FinalizerEvent::Cleanup(rule) => cleanup(rule, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(e.to_string()))
}

fn error_policy(rule: Arc<ClusterWatchRule>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(rule = %rule.name_any(), %error, "cluster watch rule reconciliation failed");
    Action::requeue(REQUEUE_SHORT)
}

async fn apply(rule: Arc<ClusterWatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let name = rule.name_any();
    let key = RuleKey {
        namespace: String::new(),
        name: name.clone(),
    };
    // cluster rules name their target across namespaces
    let Some(target_namespace) = rule.spec.target_ref.namespace.clone() else {
        error!(rule = %key, "targetRef.namespace is required on cluster rules");
        ctx.rule_store.delete_cluster_rule(&key);
        trigger_informer_reconcile(&ctx);
        return Ok(Action::requeue(REQUEUE_MEDIUM));
    };

    let targets: Api<Target> = Api::namespaced(ctx.client.clone(), &target_namespace);
    let Some(target) = targets.get_opt(&rule.spec.target_ref.name).await? else {
        warn!(
            rule = %key,
            target = format!("{target_namespace}/{}", rule.spec.target_ref.name),
            "target not found, rule is inactive"
        );
        ctx.rule_store.delete_cluster_rule(&key);
        trigger_informer_reconcile(&ctx);
        return Ok(Action::requeue(REQUEUE_SHORT));
    };
    let destination = destination_for(&target_namespace, &target);

    match compile_cluster_watch_rule(&rule, destination.clone()) {
        Ok(compiled) => {
            ctx.rule_store.add_or_update_cluster_rule(compiled);
            info!(rule = %key, destination = %destination.worker_key(), "cluster watch rule compiled");
            trigger_informer_reconcile(&ctx);
            refresh_destination_snapshot(&ctx, &destination);
            Ok(Action::requeue(REQUEUE_LONG))
        }
        Err(e) => {
            error!(rule = %key, "cluster watch rule does not compile: {e}");
            ctx.rule_store.delete_cluster_rule(&key);
            trigger_informer_reconcile(&ctx);
            Ok(Action::requeue(REQUEUE_MEDIUM))
        }
    }
}

async fn cleanup(rule: Arc<ClusterWatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let key = RuleKey {
        namespace: String::new(),
        name: rule.name_any(),
    };
    ctx.rule_store.delete_cluster_rule(&key);
    trigger_informer_reconcile(&ctx);
    info!(rule = %key, "cluster watch rule removed");
    Ok(Action::await_change())
}
