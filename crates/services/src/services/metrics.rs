use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Registry};

/// Counter family for the ingestion pipeline. All monotonic except the
/// commit queue gauge.
pub struct Metrics {
    pub objects_scanned: IntCounter,
    pub events_processed: IntCounter,
    pub commit_queue_size: IntGauge,
    pub duplicates_skipped: IntCounter,
    pub enrich_hits: IntCounter,
    pub enrich_misses: IntCounter,
    pub events_dropped: IntCounter,
    pub push_retries: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Arc<Self>, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.objects_scanned.clone()))?;
        registry.register(Box::new(metrics.events_processed.clone()))?;
        registry.register(Box::new(metrics.commit_queue_size.clone()))?;
        registry.register(Box::new(metrics.duplicates_skipped.clone()))?;
        registry.register(Box::new(metrics.enrich_hits.clone()))?;
        registry.register(Box::new(metrics.enrich_misses.clone()))?;
        registry.register(Box::new(metrics.events_dropped.clone()))?;
        registry.register(Box::new(metrics.push_retries.clone()))?;
        Ok(Arc::new(metrics))
    }

    /// Counters without registry registration, for tests and embedders that
    /// wire their own exporter.
    pub fn unregistered() -> Arc<Self> {
        Arc::new(Self::build().expect("static metric definitions are valid"))
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            objects_scanned: IntCounter::new(
                "objects_scanned_total",
                "Objects observed by informers and seed lists",
            )?,
            events_processed: IntCounter::new(
                "events_processed_total",
                "Events routed to branch workers",
            )?,
            commit_queue_size: IntGauge::new(
                "git_commit_queue_size",
                "Events queued across branch workers",
            )?,
            duplicates_skipped: IntCounter::new(
                "watch_duplicates_skipped_total",
                "Observations dropped by the content-hash dedup",
            )?,
            enrich_hits: IntCounter::new(
                "enrich_hits_total",
                "Events enriched with a correlated username",
            )?,
            enrich_misses: IntCounter::new(
                "enrich_misses_total",
                "Events processed without a correlation entry",
            )?,
            events_dropped: IntCounter::new(
                "events_dropped_total",
                "Events dropped because no branch worker was registered",
            )?,
            push_retries: IntCounter::new(
                "git_push_retries_total",
                "Push attempts retried after a rejected push",
            )?,
        })
    }
}
