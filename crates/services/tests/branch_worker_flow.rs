use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git::GitAuth;
use rules::{Event, Gvr, Operation, ResourceIdentifier, WorkerKey};
use serde_json::json;
use services::services::{
    metrics::Metrics, router::EventRouter, worker_manager::WorkerManager,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn worker_key() -> WorkerKey {
    WorkerKey {
        repo_namespace: "prod".into(),
        repo_name: "repo".into(),
        branch: "main".into(),
    }
}

fn init_bare_remote(root: &TempDir) -> PathBuf {
    let path = root.path().join("remote.git");
    git2::Repository::init_bare(&path).unwrap();
    path
}

fn remote_file(remote: &Path, path: &str) -> Option<String> {
    let repo = git2::Repository::open_bare(remote).unwrap();
    let head = repo.find_reference("refs/heads/main").ok()?;
    let tree = head.peel_to_tree().ok()?;
    let entry = tree.get_path(Path::new(path)).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    Some(String::from_utf8_lossy(blob.content()).into_owned())
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn deployment_event(name: &str, replicas: u64, op: Operation) -> Event {
    let gvr = Gvr::namespaced("apps", "v1", "deployments");
    let object = match op {
        Operation::Delete | Operation::SeedSync => None,
        _ => Some(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "prod"},
            "spec": {"replicas": replicas}
        })),
    };
    Event {
        object,
        id: ResourceIdentifier::new(&gvr, "prod", name),
        operation: op,
        user: None,
        base_path: "clusters/prod".into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn events_become_commits_on_the_remote_branch() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let metrics = Metrics::unregistered();
    let router = EventRouter::new(metrics.clone());
    let manager = WorkerManager::new(
        router.clone(),
        metrics,
        td.path().join("clones"),
        CancellationToken::new(),
    );

    let worker = manager
        .ensure_worker(&worker_key(), remote.to_str().unwrap(), GitAuth::Anonymous)
        .await
        .unwrap();
    worker.bootstrap("clusters/prod").await.unwrap();
    assert!(remote_file(&remote, "clusters/prod/.gitmirror-keep").is_some());

    router
        .route(&worker_key(), deployment_event("api", 3, Operation::Create))
        .unwrap();
    router
        .route(&worker_key(), deployment_event("web", 1, Operation::Create))
        .unwrap();

    let api_path = "clusters/prod/apps/v1/deployments/prod/api.yaml";
    wait_for("create commits to land", || {
        remote_file(&remote, api_path).is_some()
            && remote_file(&remote, "clusters/prod/apps/v1/deployments/prod/web.yaml").is_some()
    })
    .await;
    let content = remote_file(&remote, api_path).unwrap();
    assert!(content.contains("replicas: 3"), "unexpected yaml:\n{content}");

    // update rewrites the file in place
    router
        .route(&worker_key(), deployment_event("api", 5, Operation::Update))
        .unwrap();
    wait_for("update commit to land", || {
        remote_file(&remote, api_path).is_some_and(|c| c.contains("replicas: 5"))
    })
    .await;

    // delete removes it
    router
        .route(&worker_key(), deployment_event("api", 0, Operation::Delete))
        .unwrap();
    wait_for("delete commit to land", || {
        remote_file(&remote, api_path).is_none()
    })
    .await;

    // the commit author is the deterministic service identity
    let repo = git2::Repository::open_bare(&remote).unwrap();
    let head = repo
        .find_reference("refs/heads/main")
        .unwrap()
        .peel_to_commit()
        .unwrap();
    assert_eq!(head.author().name(), Some("gitmirror"));
}

#[tokio::test(flavor = "multi_thread")]
async fn correlated_identity_signs_the_commit() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let metrics = Metrics::unregistered();
    let router = EventRouter::new(metrics.clone());
    let manager = WorkerManager::new(
        router.clone(),
        metrics,
        td.path().join("clones"),
        CancellationToken::new(),
    );
    let worker = manager
        .ensure_worker(&worker_key(), remote.to_str().unwrap(), GitAuth::Anonymous)
        .await
        .unwrap();
    worker.bootstrap("clusters/prod").await.unwrap();

    let mut event = deployment_event("api", 1, Operation::Create);
    event.user = Some("alice".into());
    router.route(&worker_key(), event).unwrap();

    wait_for("authored commit", || {
        let repo = git2::Repository::open_bare(&remote).unwrap();
        let head = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        head.author().name() == Some("alice")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn seed_sync_sweeps_orphans_with_a_known_written_set() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let metrics = Metrics::unregistered();
    let router = EventRouter::new(metrics.clone());
    let manager = WorkerManager::new(
        router.clone(),
        metrics,
        td.path().join("clones"),
        CancellationToken::new(),
    );
    let worker = manager
        .ensure_worker(&worker_key(), remote.to_str().unwrap(), GitAuth::Anonymous)
        .await
        .unwrap();
    worker.bootstrap("clusters/prod").await.unwrap();

    for name in ["kept", "orphan"] {
        router
            .route(&worker_key(), deployment_event(name, 1, Operation::Create))
            .unwrap();
    }
    wait_for("seed files", || {
        remote_file(&remote, "clusters/prod/apps/v1/deployments/prod/orphan.yaml").is_some()
    })
    .await;

    // sweep without a written set is skipped
    worker.enqueue(Event {
        object: None,
        id: ResourceIdentifier::sweep_marker(),
        operation: Operation::SeedSync,
        user: None,
        base_path: "clusters/prod".into(),
    });
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(remote_file(&remote, "clusters/prod/apps/v1/deployments/prod/orphan.yaml").is_some());

    // with a written set, everything outside it goes
    let written: HashSet<String> =
        std::iter::once("clusters/prod/apps/v1/deployments/prod/kept.yaml".to_string()).collect();
    worker.set_snapshot_written("clusters/prod", written);
    worker.enqueue(Event {
        object: None,
        id: ResourceIdentifier::sweep_marker(),
        operation: Operation::SeedSync,
        user: None,
        base_path: "clusters/prod".into(),
    });
    wait_for("orphan sweep", || {
        remote_file(&remote, "clusters/prod/apps/v1/deployments/prod/orphan.yaml").is_none()
    })
    .await;
    assert!(remote_file(&remote, "clusters/prod/apps/v1/deployments/prod/kept.yaml").is_some());
    assert!(remote_file(&remote, "clusters/prod/.gitmirror-keep").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_reports_remote_state() {
    let td = TempDir::new().unwrap();
    let remote = init_bare_remote(&td);
    let metrics = Metrics::unregistered();
    let router = EventRouter::new(metrics.clone());
    let manager = WorkerManager::new(
        router,
        metrics,
        td.path().join("clones"),
        CancellationToken::new(),
    );
    let worker = manager
        .ensure_worker(&worker_key(), remote.to_str().unwrap(), GitAuth::Anonymous)
        .await
        .unwrap();

    let before = worker.sync_and_get_metadata().await.unwrap();
    assert!(!before.remote_exists);

    worker.bootstrap("clusters/prod").await.unwrap();
    // the 30s cache still holds the pre-bootstrap answer; last_push is the
    // fresh signal
    assert!(worker.last_push().is_some());
}
