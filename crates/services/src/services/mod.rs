pub mod branch_worker;
pub mod correlation;
pub mod discovery;
pub mod metrics;
pub mod namespace_labels;
pub mod pipeline;
pub mod router;
pub mod sanitize;
pub mod snapshot;
pub mod supervisor;
pub mod targets;
pub mod worker_manager;
