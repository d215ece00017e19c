use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use kube::api::DynamicObject;
use rules::{Destination, Event, Gvr, Operation, ResourceIdentifier, RuleStore};
use tracing::{trace, warn};

use crate::services::correlation::{CorrelationStore, fingerprint};
use crate::services::metrics::Metrics;
use crate::services::namespace_labels::NamespaceLabelSource;
use crate::services::router::EventRouter;
use crate::services::sanitize::{Sanitizer, content_hash};

/// Converts an observed object into sanitized, deduplicated,
/// identity-enriched events, one per distinct destination among the
/// matching rules, and hands them to the router.
///
/// Re-entrant and stateless except for the per-id content-hash map.
pub struct ChangePipeline {
    rule_store: Arc<RuleStore>,
    correlation: Arc<CorrelationStore>,
    labels: Arc<dyn NamespaceLabelSource>,
    router: Arc<EventRouter>,
    sanitizer: Sanitizer,
    metrics: Arc<Metrics>,
    /// id key -> hash of the last emitted sanitized content.
    last_seen: RwLock<HashMap<String, u64>>,
}

impl ChangePipeline {
    pub fn new(
        rule_store: Arc<RuleStore>,
        correlation: Arc<CorrelationStore>,
        labels: Arc<dyn NamespaceLabelSource>,
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rule_store,
            correlation,
            labels,
            router,
            sanitizer: Sanitizer::new(),
            metrics,
            last_seen: RwLock::new(HashMap::new()),
        })
    }

    /// Informer callback entry point.
    pub async fn process(&self, obj: &DynamicObject, gvr: &Gvr, op: Operation) {
        let Some(name) = obj.metadata.name.clone() else {
            warn!(%gvr, "observed object without a name, skipping");
            return;
        };
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let id = ResourceIdentifier::new(gvr, &namespace, &name);
        self.metrics.objects_scanned.inc();

        let labels = obj.metadata.labels.clone().unwrap_or_default();
        let namespace_labels = if namespace.is_empty() {
            BTreeMap::new()
        } else {
            self.labels.labels(&namespace).await
        };

        let (watch, cluster) =
            self.rule_store
                .match_for_object(gvr, op, &namespace, &labels, &namespace_labels);
        if watch.is_empty() && cluster.is_empty() {
            trace!(id = %id, "no matching rules");
            return;
        }

        let raw = match serde_json::to_value(obj) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(id = %id, "object not serializable: {e}");
                return;
            }
        };

        let (sanitized, canonical) = if op == Operation::Delete {
            // no content for deletes; forget the id so a recreate is fresh
            self.last_seen.write().unwrap().remove(&id.key());
            (None, String::new())
        } else {
            let sanitized = self.sanitizer.sanitize(&raw);
            let canonical = match self.sanitizer.canonical_yaml(&sanitized) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(id = %id, "object not renderable as yaml: {e}");
                    return;
                }
            };
            let hash = content_hash(&canonical);
            if self.last_seen.read().unwrap().get(&id.key()) == Some(&hash) {
                self.metrics.duplicates_skipped.inc();
                trace!(id = %id, "content unchanged, dropping");
                return;
            }
            self.last_seen.write().unwrap().insert(id.key(), hash);
            (Some(sanitized), canonical)
        };

        let user = self
            .correlation
            .get_and_delete(fingerprint(&id, op, &canonical));
        if user.is_some() {
            self.metrics.enrich_hits.inc();
        } else {
            self.metrics.enrich_misses.inc();
        }

        // fan out once per distinct destination, not once per rule
        let mut destinations: HashSet<Destination> = HashSet::new();
        for rule in &watch {
            destinations.insert(rule.destination.clone());
        }
        for rule in &cluster {
            destinations.insert(rule.destination.clone());
        }
        for destination in destinations {
            let event = Event {
                // deep copy: the tree is shared across destinations
                object: sanitized.clone(),
                id: id.clone(),
                operation: op,
                user: user.clone(),
                base_path: destination.base_path.clone(),
            };
            if self.router.route(&destination.worker_key(), event).is_ok() {
                self.metrics.events_processed.inc();
            }
        }
    }

    /// Drop dedup state for a GVR when its informers are torn down.
    pub fn invalidate_gvr(&self, gvr: &Gvr) {
        let prefix = format!("{}/{}/{}/", gvr.group, gvr.version, gvr.resource);
        let mut last_seen = self.last_seen.write().unwrap();
        let before = last_seen.len();
        last_seen.retain(|key, _| !key.starts_with(&prefix));
        trace!(%gvr, removed = before - last_seen.len(), "invalidated dedup entries");
    }

    #[cfg(test)]
    pub(crate) fn dedup_len(&self) -> usize {
        self.last_seen.read().unwrap().len()
    }
}
