use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A git repository that targets can mirror into.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitmirror.dev",
    version = "v1alpha1",
    kind = "Provider",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Clone/push URL (ssh or https).
    pub url: String,
    /// Glob patterns for branches targets may bind.
    pub allowed_branches: Vec<String>,
    /// Secret holding transport credentials. SSH secrets carry
    /// `ssh-privatekey` (required), `ssh-password` and `known_hosts`
    /// (optional); basic-auth secrets carry `username` and `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// A (provider, branch, path) destination that cluster state is mirrored to.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitmirror.dev",
    version = "v1alpha1",
    kind = "Target",
    namespaced,
    status = "TargetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Provider in the same namespace.
    pub provider_ref: ProviderReference,
    /// Branch to commit to; must match one of the provider's allowed-branch
    /// globs.
    pub branch: String,
    /// Base path inside the branch under which manifests are written.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_stats: Option<SnapshotStats>,
    /// HEAD commit of the mirrored branch after the last push.
    #[serde(default)]
    pub last_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SnapshotStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// Only "sops" is recognized.
    pub provider: String,
    /// Secret holding the age identity under `SOPS_AGE_KEY`.
    pub secret_ref: SecretReference,
    /// Generate an age key pair and create the secret when it is missing.
    #[serde(default)]
    pub generate_when_missing: bool,
}

/// Namespace-scoped selection of API objects to mirror into a target.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitmirror.dev",
    version = "v1alpha1",
    kind = "WatchRule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WatchRuleSpec {
    /// Target in the same namespace.
    pub target_ref: TargetReference,
    pub rules: Vec<RuleSelector>,
}

/// Cluster-wide selection of API objects to mirror into a target.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gitmirror.dev",
    version = "v1alpha1",
    kind = "ClusterWatchRule"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterWatchRuleSpec {
    /// Target, qualified by namespace.
    pub target_ref: TargetReference,
    pub rules: Vec<ClusterRuleSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    pub name: String,
    /// Required on ClusterWatchRule, ignored on WatchRule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSelector {
    /// API groups to match; empty defaults to the core group, `*` matches
    /// any group.
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// API versions to match; empty defaults to `v1`, `*` matches any.
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Plural resource names; `*` matches any. Subresources (`pods/log`)
    /// are rejected at discovery time.
    pub resources: Vec<String>,
    /// CREATE / UPDATE / DELETE; empty or `*` matches all.
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Only meaningful on cluster rules with namespaced scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRuleSelector {
    #[serde(flatten)]
    pub selector: RuleSelector,
    /// Reach of this rule.
    #[serde(default)]
    pub scope: RuleScope,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RuleScope {
    #[default]
    Cluster,
    Namespaced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_selector_defaults_from_yaml() {
        let selector: RuleSelector = serde_yaml::from_str("resources: [deployments]").unwrap();
        assert!(selector.api_groups.is_empty());
        assert!(selector.api_versions.is_empty());
        assert!(selector.operations.is_empty());
        assert_eq!(selector.resources, vec!["deployments"]);
    }

    #[test]
    fn cluster_rule_selector_flattens() {
        let selector: ClusterRuleSelector = serde_yaml::from_str(
            "resources: [namespaces]\napiVersions: [v1]\nscope: Cluster",
        )
        .unwrap();
        assert_eq!(selector.scope, RuleScope::Cluster);
        assert_eq!(selector.selector.resources, vec!["namespaces"]);
    }

    #[test]
    fn target_status_round_trips_empty_commit() {
        let status = TargetStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastCommit"], "");
        assert!(json.get("lastPushTime").is_none());
    }
}
