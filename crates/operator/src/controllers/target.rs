use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crd::conditions::{self, Gate, STATUS_FALSE, STATUS_TRUE};
use crd::{Provider, Target, TargetStatus};
use futures::StreamExt;
use git::GitAuth;
use globset::{Glob, GlobSet, GlobSetBuilder};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::ResourceExt;
use rules::{Destination, WorkerKey};
use secrecy::ExposeSecret as _;
use services::services::branch_worker::BranchWorker;
use services::services::snapshot::SnapshotState;
use services::services::targets::{StreamState, TargetId};
use tracing::{error, info, instrument};

use crate::context::Context;
use crate::controllers::{REQUEUE_LONG, REQUEUE_MEDIUM, REQUEUE_SHORT, patch_target_status};
use crate::error::{Error, Result};
use crate::secrets;

pub const FINALIZER: &str = "gitmirror.dev/target-cleanup";

/// Run the target lifecycle controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let api = Api::<Target>::all(ctx.client.clone());
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|result| async move { result.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("target controller shutdown complete");
}

#[instrument(skip(target, ctx), fields(
    target_name = %target.name_any(),
    target_namespace = target.namespace().as_deref(),
))]
async fn reconcile(target: Arc<Target>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = target
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<Target> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, target, |event| async {
        match event {
            FinalizerEvent::Apply(target) => apply(target, ctx.clone()).await,
            FinalizerEvent::Cleanup(target) => cleanup(target, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(e.to_string()))
}

fn error_policy(target: Arc<Target>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        target = %target.name_any(),
        namespace = target.namespace().as_deref().unwrap_or_default(),
        %error,
        "target reconciliation failed"
    );
    Action::requeue(REQUEUE_SHORT)
}

/// Reason Ready carries when an upstream gate fails.
fn ready_reason_for(gate: Gate) -> &'static str {
    match gate {
        Gate::Validated => "ValidationFailed",
        Gate::EncryptionConfigured => "EncryptionNotConfigured",
        Gate::Bootstrapped => "BootstrapFailed",
        Gate::SnapshotSynced => "SnapshotNotSynced",
        Gate::EventStreamLive => "EventStreamNotLive",
        Gate::Ready => "NotReady",
    }
}

struct GateFailure {
    gate: Gate,
    reason: &'static str,
    message: String,
    /// BranchNotAllowed / TargetConflict clear published repo metadata so
    /// an unauthorized configuration leaks nothing.
    clear_repo_metadata: bool,
    requeue: Duration,
}

/// Drive every gate in order; the first failure blocks everything below it
/// and decides the requeue cadence.
async fn apply(target: Arc<Target>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = target
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = target.name_any();
    let generation = target.metadata.generation;
    let mut status = target.status.clone().unwrap_or_default();
    status.observed_generation = generation;

    match evaluate_gates(&target, &ctx, &namespace, &name, &mut status).await? {
        Ok(worker) => {
            let now = Utc::now();
            if let Some((sha, at)) = worker.last_push() {
                status.last_commit = sha;
                status.last_push_time = Some(Time(at));
            }
            let message = match worker.last_error() {
                Some(err) => format!("degraded: {err}"),
                None => "all gates passed".to_string(),
            };
            conditions::upsert(
                &mut status.conditions,
                Gate::Ready,
                STATUS_TRUE,
                "Ready",
                &message,
                generation,
                now,
            );
            patch_target_status(&ctx, &namespace, &name, &status).await?;
            Ok(Action::requeue(REQUEUE_LONG))
        }
        Err(failure) => {
            let now = Utc::now();
            conditions::upsert(
                &mut status.conditions,
                failure.gate,
                STATUS_FALSE,
                failure.reason,
                &failure.message,
                generation,
                now,
            );
            conditions::block_downstream(&mut status.conditions, failure.gate, generation, now);
            conditions::upsert(
                &mut status.conditions,
                Gate::Ready,
                STATUS_FALSE,
                ready_reason_for(failure.gate),
                &format!("{} gate failed: {}", failure.gate.as_str(), failure.message),
                generation,
                now,
            );
            if failure.clear_repo_metadata {
                status.last_commit.clear();
                status.last_push_time = None;
            }
            patch_target_status(&ctx, &namespace, &name, &status).await?;
            Ok(Action::requeue(failure.requeue))
        }
    }
}

/// Inner gate pipeline: `Ok(Ok(worker))` when every gate up to
/// EventStreamLive is True, `Ok(Err(failure))` on the first failed gate,
/// `Err` only for API errors worth the error policy.
async fn evaluate_gates(
    target: &Target,
    ctx: &Arc<Context>,
    namespace: &str,
    name: &str,
    status: &mut TargetStatus,
) -> Result<std::result::Result<Arc<BranchWorker>, GateFailure>> {
    let generation = target.metadata.generation;
    let now = Utc::now();
    let target_id = TargetId {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };

    // Validated
    let providers: Api<Provider> = Api::namespaced(ctx.client.clone(), namespace);
    let provider = match providers.get_opt(&target.spec.provider_ref.name).await? {
        Some(provider) => provider,
        None => {
            return Ok(Err(GateFailure {
                gate: Gate::Validated,
                reason: "ProviderNotFound",
                message: format!("provider {} not found", target.spec.provider_ref.name),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
    };
    match allowed_branches(&provider.spec.allowed_branches) {
        Ok(allowed) if allowed.is_match(&target.spec.branch) => {}
        Ok(_) => {
            return Ok(Err(GateFailure {
                gate: Gate::Validated,
                reason: "BranchNotAllowed",
                message: format!(
                    "branch {} does not match any allowed-branches pattern of provider {}",
                    target.spec.branch, target.spec.provider_ref.name
                ),
                clear_repo_metadata: true,
                requeue: REQUEUE_SHORT,
            }));
        }
        Err(e) => {
            return Ok(Err(GateFailure {
                gate: Gate::Validated,
                reason: "BranchNotAllowed",
                message: format!("invalid allowed-branches pattern: {e}"),
                clear_repo_metadata: true,
                requeue: REQUEUE_SHORT,
            }));
        }
    }
    let all_targets = Api::<Target>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    if let Some(winner) = conflict_winner(target, &all_targets) {
        return Ok(Err(GateFailure {
            gate: Gate::Validated,
            reason: "TargetConflict",
            message: format!(
                "conflicts with older target {}/{} (created {})",
                winner.namespace().unwrap_or_default(),
                winner.name_any(),
                winner
                    .creation_timestamp()
                    .map(|t| t.0.to_rfc3339())
                    .unwrap_or_default(),
            ),
            clear_repo_metadata: true,
            requeue: REQUEUE_SHORT,
        }));
    }
    conditions::upsert(
        &mut status.conditions,
        Gate::Validated,
        STATUS_TRUE,
        "Validated",
        "provider, branch, and destination are valid",
        generation,
        now,
    );

    // EncryptionConfigured
    if let Some(failure) = ensure_encryption(target, ctx, namespace).await? {
        return Ok(Err(failure));
    }
    conditions::upsert(
        &mut status.conditions,
        Gate::EncryptionConfigured,
        STATUS_TRUE,
        if target.spec.encryption.is_some() {
            "SecretReady"
        } else {
            "EncryptionDisabled"
        },
        "",
        generation,
        now,
    );

    // Bootstrapped
    let auth = match provider_auth(&provider, ctx, namespace).await? {
        Ok(auth) => auth,
        Err(failure) => return Ok(Err(failure)),
    };
    let worker_key = WorkerKey {
        repo_namespace: namespace.to_string(),
        repo_name: target.spec.provider_ref.name.clone(),
        branch: target.spec.branch.clone(),
    };
    let worker = match ctx
        .workers
        .ensure_worker(&worker_key, &provider.spec.url, auth)
        .await
    {
        Ok(worker) => worker,
        Err(e) => {
            return Ok(Err(GateFailure {
                gate: Gate::Bootstrapped,
                reason: "WorkerNotFound",
                message: format!("failed to create branch worker: {e}"),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
    };
    if let Err(e) = worker.bootstrap(&target.spec.path).await {
        return Ok(Err(GateFailure {
            gate: Gate::Bootstrapped,
            reason: "BootstrapFailed",
            message: format!("failed to initialize {}: {e}", target.spec.path),
            clear_repo_metadata: false,
            requeue: REQUEUE_SHORT,
        }));
    }
    let destination = Destination {
        repo_name: target.spec.provider_ref.name.clone(),
        repo_namespace: namespace.to_string(),
        branch: target.spec.branch.clone(),
        base_path: target.spec.path.trim_matches('/').to_string(),
    };
    ctx.targets.register(target_id.clone(), destination.clone());
    conditions::upsert(
        &mut status.conditions,
        Gate::Bootstrapped,
        STATUS_TRUE,
        "Bootstrapped",
        "branch worker ready and base path initialized",
        generation,
        now,
    );

    // SnapshotSynced
    match ctx.snapshots.state(&target_id) {
        SnapshotState::Completed(stats) => {
            status.snapshot_stats = Some(stats);
            conditions::upsert(
                &mut status.conditions,
                Gate::SnapshotSynced,
                STATUS_TRUE,
                "SnapshotCompleted",
                "initial snapshot reached parity",
                generation,
                now,
            );
        }
        SnapshotState::IdleNotStarted => {
            ctx.snapshots
                .start(target_id.clone(), destination.clone(), worker.clone());
            return Ok(Err(GateFailure {
                gate: Gate::SnapshotSynced,
                reason: "Running",
                message: "initial snapshot started".to_string(),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
        SnapshotState::Listing | SnapshotState::Diffing | SnapshotState::Applying => {
            return Ok(Err(GateFailure {
                gate: Gate::SnapshotSynced,
                reason: "Running",
                message: "snapshot in progress".to_string(),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
        SnapshotState::Failed(message) => {
            // restart; the failure stays visible until the rerun completes
            ctx.snapshots
                .start(target_id.clone(), destination.clone(), worker.clone());
            return Ok(Err(GateFailure {
                gate: Gate::SnapshotSynced,
                reason: "SnapshotFailed",
                message,
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
    }

    // EventStreamLive
    match ctx.targets.get(&target_id).map(|rt| rt.stream_state()) {
        Some(StreamState::Live) => {
            conditions::upsert(
                &mut status.conditions,
                Gate::EventStreamLive,
                STATUS_TRUE,
                "LiveProcessing",
                "streaming updates are live",
                generation,
                now,
            );
        }
        Some(StreamState::Pending) => {
            return Ok(Err(GateFailure {
                gate: Gate::EventStreamLive,
                reason: "Disconnected",
                message: "event stream has not taken over from the snapshot".to_string(),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
        None => {
            return Ok(Err(GateFailure {
                gate: Gate::EventStreamLive,
                reason: "RegistrationFailed",
                message: "target runtime is not registered".to_string(),
                clear_repo_metadata: false,
                requeue: REQUEUE_SHORT,
            }));
        }
    }

    Ok(Ok(worker))
}

async fn ensure_encryption(
    target: &Target,
    ctx: &Arc<Context>,
    namespace: &str,
) -> Result<Option<GateFailure>> {
    let Some(encryption) = &target.spec.encryption else {
        return Ok(None);
    };
    if encryption.provider != "sops" {
        return Ok(Some(GateFailure {
            gate: Gate::EncryptionConfigured,
            reason: "InvalidConfig",
            message: format!("unsupported encryption provider {:?}", encryption.provider),
            clear_repo_metadata: false,
            requeue: REQUEUE_MEDIUM,
        }));
    }
    let secrets_api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    match secrets_api.get_opt(&encryption.secret_ref.name).await? {
        Some(secret) => match secrets::validate_age_secret(&secret) {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(GateFailure {
                gate: Gate::EncryptionConfigured,
                reason: "InvalidConfig",
                message: e.to_string(),
                clear_repo_metadata: false,
                requeue: REQUEUE_MEDIUM,
            })),
        },
        None if encryption.generate_when_missing => {
            let generated = secrets::generate_age_key();
            let secret = build_age_secret(&encryption.secret_ref.name, &generated);
            match secrets_api.create(&PostParams::default(), &secret).await {
                Ok(_) => {
                    info!(
                        namespace,
                        secret = %encryption.secret_ref.name,
                        recipient = %generated.recipient,
                        "generated age key pair"
                    );
                    Ok(None)
                }
                // lost a creation race to a parallel reconcile, fine
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(None),
                Err(e) => Ok(Some(GateFailure {
                    gate: Gate::EncryptionConfigured,
                    reason: "MissingSecret",
                    message: format!("failed to create encryption secret: {e}"),
                    clear_repo_metadata: false,
                    requeue: REQUEUE_MEDIUM,
                })),
            }
        }
        None => Ok(Some(GateFailure {
            gate: Gate::EncryptionConfigured,
            reason: "SecretCreateDisabled",
            message: format!(
                "encryption secret {} is missing and generateWhenMissing is false",
                encryption.secret_ref.name
            ),
            clear_repo_metadata: false,
            requeue: REQUEUE_MEDIUM,
        })),
    }
}

fn build_age_secret(name: &str, generated: &secrets::GeneratedAgeKey) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(
                [
                    (
                        secrets::RECIPIENT_ANNOTATION.to_string(),
                        generated.recipient.clone(),
                    ),
                    (
                        secrets::BACKUP_WARNING_ANNOTATION.to_string(),
                        secrets::BACKUP_WARNING.to_string(),
                    ),
                ]
                .into(),
            ),
            ..Default::default()
        },
        string_data: Some(
            [(
                secrets::SOPS_AGE_KEY.to_string(),
                generated.identity.expose_secret().to_string(),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

async fn provider_auth(
    provider: &Provider,
    ctx: &Arc<Context>,
    namespace: &str,
) -> Result<std::result::Result<GitAuth, GateFailure>> {
    let Some(secret_ref) = &provider.spec.secret_ref else {
        return Ok(Ok(GitAuth::Anonymous));
    };
    let secrets_api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    match secrets_api.get_opt(&secret_ref.name).await? {
        Some(secret) => match secrets::git_auth_from_secret(&secret) {
            Ok(auth) => Ok(Ok(auth)),
            Err(e) => Ok(Err(GateFailure {
                gate: Gate::Bootstrapped,
                reason: "BootstrapFailed",
                message: format!("cannot decode auth secret {}: {e}", secret_ref.name),
                clear_repo_metadata: false,
                requeue: REQUEUE_MEDIUM,
            })),
        },
        None => Ok(Err(GateFailure {
            gate: Gate::Bootstrapped,
            reason: "BootstrapFailed",
            message: format!("auth secret {} not found", secret_ref.name),
            clear_repo_metadata: false,
            requeue: REQUEUE_MEDIUM,
        })),
    }
}

fn allowed_branches(patterns: &[String]) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Among every target binding the same (provider, branch, path), the one
/// with the earliest creationTimestamp wins; namespace/name breaks ties.
/// Returns the winner when it is not `me`.
fn conflict_winner<'a>(me: &Target, all: &'a [Target]) -> Option<&'a Target> {
    let my_key = binding_key(me)?;
    let me_rank = rank(me);
    all.iter()
        .filter(|other| binding_key(other).as_ref() == Some(&my_key))
        .min_by_key(|t| rank(t))
        .filter(|winner| rank(winner) < me_rank)
}

fn binding_key(target: &Target) -> Option<(String, String, String, String)> {
    Some((
        target.namespace()?,
        target.spec.provider_ref.name.clone(),
        target.spec.branch.clone(),
        target.spec.path.trim_matches('/').to_string(),
    ))
}

fn rank(target: &Target) -> (chrono::DateTime<Utc>, String, String) {
    (
        target
            .creation_timestamp()
            .map(|t| t.0)
            .unwrap_or_else(|| chrono::DateTime::<Utc>::MAX_UTC),
        target.namespace().unwrap_or_default(),
        target.name_any(),
    )
}

/// Deleting the target abandons its snapshot and unhooks its basePath from
/// the worker; the worker itself lives until process exit.
async fn cleanup(target: Arc<Target>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = target
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let target_id = TargetId {
        namespace: namespace.clone(),
        name: target.name_any(),
    };
    ctx.snapshots.cancel(&target_id);
    if let Some(runtime) = ctx.targets.get(&target_id)
        && let Some(worker) = ctx.workers.get(&runtime.destination.worker_key())
    {
        worker.deregister_base_path(&runtime.destination.base_path);
    }
    ctx.targets.deregister(&target_id);
    info!(target = %target_id, "target cleaned up");
    Ok(Action::await_change())
}
