//! Declarative API types for gitmirror (`gitmirror.dev/v1alpha1`).

pub mod conditions;
pub mod v1alpha1;

pub use v1alpha1::{
    ClusterRuleSelector, ClusterWatchRule, ClusterWatchRuleSpec, EncryptionSpec, Provider,
    ProviderReference, ProviderSpec, RuleScope, RuleSelector, SecretReference, SnapshotStats,
    Target, TargetReference, TargetSpec, TargetStatus, WatchRule, WatchRuleSpec,
};
