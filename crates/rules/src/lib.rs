//! Core data model and compiled-rule index.
//!
//! Everything downstream of the informers speaks in terms of these types:
//! a [`model::Gvr`] names an API type, a [`model::ResourceIdentifier`] names
//! one object and its git path, and a [`model::Event`] is the unit of work
//! routed to branch workers.

pub mod compile;
pub mod model;
pub mod selector;
pub mod store;

pub use compile::{CompileError, compile_cluster_watch_rule, compile_watch_rule};
pub use model::{
    ApiScope, CompiledClusterRule, CompiledRule, CompiledSelector, Destination, Event, Gvr,
    Operation, ResourceIdentifier, RuleKey, ScopedSelector, WorkerKey,
};
pub use selector::{LabelMatcher, SelectorError};
pub use store::RuleStore;
