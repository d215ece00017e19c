use std::path::PathBuf;

use anyhow::Error as AnyhowError;
use kube::Api;
use kube::api::ListParams;
use operator::Context;
use operator::controllers::{cluster_watch_rule, target, watch_rule};
use prometheus::Registry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Error)]
pub enum GitmirrorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), GitmirrorError> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,operator={level},services={level},rules={level},git={level},crd={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let client = kube::Client::try_default().await?;

    // fail fast when our CRDs are not installed
    let targets = Api::<crd::Target>::all(client.clone());
    if let Err(e) = targets.list(&ListParams::default().limit(1)).await {
        tracing::error!("Target CRD is not queryable; is it installed? {e}");
        return Err(e.into());
    }

    let clone_root = std::env::var("GITMIRROR_CLONE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("gitmirror").join("clones"));
    std::fs::create_dir_all(&clone_root)?;

    let cancel = CancellationToken::new();
    let registry = Registry::new();
    let ctx = Context::initialize(client, &registry, clone_root, cancel.clone())?;
    let background = ctx.spawn_background();

    tracing::info!("gitmirror operator started");

    // the controllers stop on SIGTERM/ctrl-c via shutdown_on_signal
    tokio::join!(
        target::run(ctx.clone()),
        watch_rule::run(ctx.clone()),
        cluster_watch_rule::run(ctx.clone()),
    );

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("gitmirror operator stopped");
    Ok(())
}
