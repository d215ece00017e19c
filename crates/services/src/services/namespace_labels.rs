use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use tracing::warn;

/// Cached lookup of a namespace's labels, used by rule matching.
#[async_trait]
pub trait NamespaceLabelSource: Send + Sync {
    async fn labels(&self, namespace: &str) -> BTreeMap<String, String>;
}

/// Reads namespaces through the API server with a short-lived cache so a
/// busy informer fleet does not hammer the namespace endpoint.
pub struct ClientNamespaceLabels {
    api: Api<Namespace>,
    cache: moka::future::Cache<String, Arc<BTreeMap<String, String>>>,
}

impl ClientNamespaceLabels {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            cache: moka::future::Cache::builder()
                .max_capacity(4096)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }
}

#[async_trait]
impl NamespaceLabelSource for ClientNamespaceLabels {
    async fn labels(&self, namespace: &str) -> BTreeMap<String, String> {
        let api = self.api.clone();
        let key = namespace.to_string();
        let labels = self
            .cache
            .get_with(key.clone(), async move {
                match api.get_opt(&key).await {
                    Ok(Some(ns)) => Arc::new(ns.metadata.labels.unwrap_or_default()),
                    Ok(None) => Arc::new(BTreeMap::new()),
                    Err(e) => {
                        warn!(namespace = %key, "namespace label lookup failed: {e}");
                        Arc::new(BTreeMap::new())
                    }
                }
            })
            .await;
        (*labels).clone()
    }
}

/// Fixed label map for tests.
#[derive(Default)]
pub struct StaticNamespaceLabels {
    pub by_namespace: BTreeMap<String, BTreeMap<String, String>>,
}

#[async_trait]
impl NamespaceLabelSource for StaticNamespaceLabels {
    async fn labels(&self, namespace: &str) -> BTreeMap<String, String> {
        self.by_namespace.get(namespace).cloned().unwrap_or_default()
    }
}
