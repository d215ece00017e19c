use std::sync::Arc;

use crd::{Target, WatchRule};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::ResourceExt;
use rules::{Destination, RuleKey, compile_watch_rule};
use tracing::{error, info, warn};

use crate::context::Context;
use crate::controllers::{
    REQUEUE_LONG, REQUEUE_MEDIUM, REQUEUE_SHORT, refresh_destination_snapshot,
    trigger_informer_reconcile,
};
use crate::error::{Error, Result};

pub const FINALIZER: &str = "gitmirror.dev/watchrule-cleanup";

pub async fn run(ctx: Arc<Context>) {
    let api = Api::<WatchRule>::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("watch rule controller shutdown complete");
}

async fn reconcile(rule: Arc<WatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = rule
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<WatchRule> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => apply(rule, ctx.clone()).await,
            FinalizerEvent::Cleanup(rule) => cleanup(rule, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(e.to_string()))
}

fn error_policy(rule: Arc<WatchRule>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        rule = %rule.name_any(),
        namespace = rule.namespace().as_deref().unwrap_or_default(),
        %error,
        "watch rule reconciliation failed"
    );
    Action::requeue(REQUEUE_SHORT)
}

/// Compile the rule against its target and install it in the store.
/// A dangling targetRef or a compile error removes the rule: events must
/// not route to a destination nobody validated.
async fn apply(rule: Arc<WatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = rule
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = rule.name_any();
    let key = RuleKey {
        namespace: namespace.clone(),
        name: name.clone(),
    };

    let targets: Api<Target> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(target) = targets.get_opt(&rule.spec.target_ref.name).await? else {
        warn!(
            rule = %key,
            target = %rule.spec.target_ref.name,
            "target not found, rule is inactive"
        );
        ctx.rule_store.delete_watch_rule(&key);
        trigger_informer_reconcile(&ctx);
        return Ok(Action::requeue(REQUEUE_SHORT));
    };
    let destination = destination_for(&namespace, &target);

    match compile_watch_rule(&rule, destination.clone()) {
        Ok(compiled) => {
            ctx.rule_store.add_or_update_watch_rule(compiled);
            info!(rule = %key, destination = %destination.worker_key(), "watch rule compiled");
            trigger_informer_reconcile(&ctx);
            refresh_destination_snapshot(&ctx, &destination);
            Ok(Action::requeue(REQUEUE_LONG))
        }
        Err(e) => {
            error!(rule = %key, "watch rule does not compile: {e}");
            ctx.rule_store.delete_watch_rule(&key);
            trigger_informer_reconcile(&ctx);
            Ok(Action::requeue(REQUEUE_MEDIUM))
        }
    }
}

async fn cleanup(rule: Arc<WatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let key = RuleKey {
        namespace: rule.namespace().unwrap_or_default(),
        name: rule.name_any(),
    };
    ctx.rule_store.delete_watch_rule(&key);
    trigger_informer_reconcile(&ctx);
    info!(rule = %key, "watch rule removed");
    Ok(Action::await_change())
}

pub(crate) fn destination_for(namespace: &str, target: &Target) -> Destination {
    Destination {
        repo_name: target.spec.provider_ref.name.clone(),
        repo_namespace: namespace.to_string(),
        branch: target.spec.branch.clone(),
        base_path: target.spec.path.trim_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crd::{ProviderReference, TargetSpec};

    #[test]
    fn destination_normalizes_the_base_path() {
        let target = Target::new(
            "mirror",
            TargetSpec {
                provider_ref: ProviderReference {
                    name: "repo".into(),
                },
                branch: "main".into(),
                path: "/clusters/prod/".into(),
                encryption: None,
            },
        );
        let destination = destination_for("prod", &target);
        assert_eq!(destination.base_path, "clusters/prod");
        assert_eq!(destination.worker_key().to_string(), "prod/repo@main");
    }
}
