use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rules::{Operation, ResourceIdentifier};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use twox_hash::XxHash64;

use utils::clock::Clock;

/// How the admission path and the watch path agree on "the same mutation":
/// a stable hash over the object identity, the operation, and the sanitized
/// canonical content.
pub fn fingerprint(id: &ResourceIdentifier, op: Operation, canonical_yaml: &str) -> u64 {
    let composite = format!("{}\n{}\n{canonical_yaml}", id.key(), op.as_str());
    XxHash64::oneshot(0, composite.as_bytes())
}

struct Entry {
    username: String,
    inserted_at: DateTime<Utc>,
}

/// Short-lived map from mutation fingerprint to the username that issued
/// the mutation. Producers are the admission webhook; the change pipeline
/// drains entries via [`CorrelationStore::get_and_delete`]. Best effort:
/// misses are expected and never fail the pipeline.
pub struct CorrelationStore {
    entries: Mutex<HashMap<u64, Entry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

pub const DEFAULT_TTL: StdDuration = StdDuration::from_secs(120);
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(30);

impl CorrelationStore {
    pub fn new(ttl: StdDuration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(120)),
            clock,
        })
    }

    pub fn insert(&self, key: u64, username: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                username,
                inserted_at: self.clock.now(),
            },
        );
    }

    /// Atomic lookup-and-remove. Expired entries are treated as absent.
    pub fn get_and_delete(&self, key: u64) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(&key)?;
        if self.clock.now() - entry.inserted_at > self.ttl {
            trace!(key, "correlation entry expired before lookup");
            return None;
        }
        Some(entry.username)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything older than the TTL.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.inserted_at <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept correlation entries");
        }
    }

    /// Background sweep loop, stopped by the token.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => store.sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules::Gvr;
    use utils::clock::ManualClock;

    fn id() -> ResourceIdentifier {
        ResourceIdentifier::new(&Gvr::namespaced("apps", "v1", "deployments"), "prod", "api")
    }

    fn store_with_clock() -> (Arc<CorrelationStore>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = CorrelationStore::new(DEFAULT_TTL, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn get_and_delete_is_consuming() {
        let (store, _clock) = store_with_clock();
        let key = fingerprint(&id(), Operation::Update, "spec: {}\n");
        store.insert(key, "alice".into());
        assert_eq!(store.get_and_delete(key), Some("alice".into()));
        assert_eq!(store.get_and_delete(key), None);
    }

    #[test]
    fn miss_is_a_none_not_an_error() {
        let (store, _clock) = store_with_clock();
        assert_eq!(store.get_and_delete(42), None);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let (store, clock) = store_with_clock();
        store.insert(1, "old".into());
        clock.advance(Duration::seconds(90));
        store.insert(2, "fresh".into());
        clock.advance(Duration::seconds(60));
        store.sweep();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_and_delete(2), Some("fresh".into()));
    }

    #[test]
    fn expired_entry_is_not_returned_even_before_sweep() {
        let (store, clock) = store_with_clock();
        let key = fingerprint(&id(), Operation::Create, "spec: {}\n");
        store.insert(key, "alice".into());
        clock.advance(Duration::seconds(121));
        assert_eq!(store.get_and_delete(key), None);
    }

    #[test]
    fn fingerprint_depends_on_identity_operation_and_content() {
        let base = fingerprint(&id(), Operation::Update, "a: 1\n");
        assert_eq!(base, fingerprint(&id(), Operation::Update, "a: 1\n"));
        assert_ne!(base, fingerprint(&id(), Operation::Create, "a: 1\n"));
        assert_ne!(base, fingerprint(&id(), Operation::Update, "a: 2\n"));
        let other = ResourceIdentifier::new(&Gvr::namespaced("apps", "v1", "deployments"), "prod", "web");
        assert_ne!(base, fingerprint(&other, Operation::Update, "a: 1\n"));
    }
}
