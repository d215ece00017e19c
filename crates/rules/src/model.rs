use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::selector::LabelMatcher;

/// Whether an API type lives at cluster scope or inside namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiScope {
    Cluster,
    Namespaced,
}

/// A group/version/resource triple plus scope, the unit of discovery.
/// All segments are lowercased; the core API group is the empty string,
/// which is distinct from the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub scope: ApiScope,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str, scope: ApiScope) -> Self {
        Self {
            group: group.to_lowercase(),
            version: version.to_lowercase(),
            resource: resource.to_lowercase(),
            scope,
        }
    }

    pub fn namespaced(group: &str, version: &str, resource: &str) -> Self {
        Self::new(group, version, resource, ApiScope::Namespaced)
    }

    pub fn cluster(group: &str, version: &str, resource: &str) -> Self {
        Self::new(group, version, resource, ApiScope::Cluster)
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Names one object observed in the cluster. `namespace` is empty iff the
/// resource is cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentifier {
    pub fn new(gvr: &Gvr, namespace: &str, name: &str) -> Self {
        Self {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            resource: gvr.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Relative git path for this object's manifest. Core-group resources
    /// omit the group segment entirely.
    pub fn to_git_path(&self) -> String {
        let mut segments = Vec::with_capacity(5);
        if !self.group.is_empty() {
            segments.push(self.group.as_str());
        }
        segments.push(self.version.as_str());
        segments.push(self.resource.as_str());
        if !self.namespace.is_empty() {
            segments.push(self.namespace.as_str());
        }
        segments.push(self.name.as_str());
        format!("{}.yaml", segments.join("/"))
    }

    /// Inverse of [`Self::to_git_path`]. `path` must already be relative to
    /// the target basePath. Returns `None` for paths that do not fit the
    /// layout.
    pub fn from_git_path(path: &str) -> Option<Self> {
        let stem = path.strip_suffix(".yaml")?;
        let segments: Vec<&str> = stem.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let (group, version, resource, namespace, name) = match segments.as_slice() {
            // core cluster-scoped: version/resource/name
            [version, resource, name] if is_version_segment(version) => {
                ("", *version, *resource, "", *name)
            }
            // core namespaced: version/resource/namespace/name
            [version, resource, namespace, name] if is_version_segment(version) => {
                ("", *version, *resource, *namespace, *name)
            }
            // grouped cluster-scoped: group/version/resource/name
            [group, version, resource, name] if is_version_segment(version) => {
                (*group, *version, *resource, "", *name)
            }
            // grouped namespaced: group/version/resource/namespace/name
            [group, version, resource, namespace, name] if is_version_segment(version) => {
                (*group, *version, *resource, *namespace, *name)
            }
            _ => return None,
        };
        Some(Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Placeholder identity carried by SEED_SYNC events, which name no
    /// object.
    pub fn sweep_marker() -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            resource: String::new(),
            namespace: String::new(),
            name: String::new(),
        }
    }

    /// Stable key for the dedup map.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.resource, self.namespace, self.name
        )
    }

    pub fn gvr(&self) -> Gvr {
        let scope = if self.namespace.is_empty() {
            ApiScope::Cluster
        } else {
            ApiScope::Namespaced
        };
        Gvr::new(&self.group, &self.version, &self.resource, scope)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// `v1`, `v2`, `v1alpha1`, `v1beta2`, ...
fn is_version_segment(segment: &str) -> bool {
    let rest = match segment.strip_prefix('v') {
        Some(rest) if !rest.is_empty() => rest,
        _ => return false,
    };
    let digits_end = rest.chars().take_while(char::is_ascii_digit).count();
    if digits_end == 0 {
        return false;
    }
    let suffix = &rest[digits_end..];
    if suffix.is_empty() {
        return true;
    }
    for stage in ["alpha", "beta"] {
        if let Some(n) = suffix.strip_prefix(stage) {
            return !n.is_empty() && n.chars().all(|c| c.is_ascii_digit());
        }
    }
    false
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Branch-scoped orphan sweep marker; carries no object.
    SeedSync,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::SeedSync => "SEED_SYNC",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rule delivers manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub repo_name: String,
    pub repo_namespace: String,
    pub branch: String,
    pub base_path: String,
}

impl Destination {
    pub fn worker_key(&self) -> WorkerKey {
        WorkerKey {
            repo_namespace: self.repo_namespace.clone(),
            repo_name: self.repo_name.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// Identity of a branch worker; at most one worker exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub repo_namespace: String,
    pub repo_name: String,
    pub branch: String,
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.repo_namespace, self.repo_name, self.branch
        )
    }
}

/// The unit of work handed to a branch worker.
#[derive(Debug, Clone)]
pub struct Event {
    /// Sanitized object tree; `None` for DELETE and SEED_SYNC.
    pub object: Option<serde_json::Value>,
    pub id: ResourceIdentifier,
    pub operation: Operation,
    /// Username correlated from the admission path, when available.
    pub user: Option<String>,
    /// Target basePath this event applies under. Empty on SEED_SYNC means
    /// "every basePath the worker owns".
    pub base_path: String,
}

/// Source identity of a rule custom resource. `namespace` is empty for
/// cluster rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// One selection clause of a compiled rule. Lists are already lowercased and
/// defaulted (empty apiGroups means core, empty apiVersions means v1) at
/// compile time; matching only deals in concrete values and `*`.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    /// Empty means all operations.
    pub operations: Vec<Operation>,
    pub label_selector: Option<LabelMatcher>,
    pub namespace_selector: Option<LabelMatcher>,
}

impl CompiledSelector {
    fn matches_gvr(&self, gvr: &Gvr) -> bool {
        list_matches(&self.api_groups, &gvr.group)
            && list_matches(&self.api_versions, &gvr.version)
            && list_matches(&self.resources, &gvr.resource)
    }

    fn matches_operation(&self, op: Operation) -> bool {
        self.operations.is_empty() || self.operations.contains(&op)
    }

    fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.label_selector
            .as_ref()
            .is_none_or(|sel| sel.matches(labels))
    }

    fn matches_namespace_labels(&self, namespace_labels: &BTreeMap<String, String>) -> bool {
        self.namespace_selector
            .as_ref()
            .is_none_or(|sel| sel.matches(namespace_labels))
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == value)
}

/// A cluster-rule clause plus its reach.
#[derive(Debug, Clone)]
pub struct ScopedSelector {
    pub selector: CompiledSelector,
    pub scope: ApiScope,
}

/// Compiled form of a WatchRule: namespace-scoped, destination resolved.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub key: RuleKey,
    pub source_namespace: String,
    pub selectors: Vec<CompiledSelector>,
    pub destination: Destination,
}

impl CompiledRule {
    /// Watch rules only ever reach namespaced objects inside their own
    /// namespace.
    pub fn matches(
        &self,
        gvr: &Gvr,
        op: Operation,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        gvr.scope == ApiScope::Namespaced
            && namespace == self.source_namespace
            && self.selectors.iter().any(|s| {
                s.matches_gvr(gvr) && s.matches_operation(op) && s.matches_labels(labels)
            })
    }

    /// True when any selector clause names this GVR, ignoring operation and
    /// label constraints. Used for informer planning and snapshot listing.
    pub fn selects_gvr(&self, gvr: &Gvr) -> bool {
        gvr.scope == ApiScope::Namespaced && self.selectors.iter().any(|s| s.matches_gvr(gvr))
    }

    /// Seed-time matching: the operation filter does not apply to a listed
    /// object, everything else does.
    pub fn matches_for_seed(
        &self,
        gvr: &Gvr,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        gvr.scope == ApiScope::Namespaced
            && namespace == self.source_namespace
            && self
                .selectors
                .iter()
                .any(|s| s.matches_gvr(gvr) && s.matches_labels(labels))
    }
}

/// Compiled form of a ClusterWatchRule.
#[derive(Debug, Clone)]
pub struct CompiledClusterRule {
    pub key: RuleKey,
    pub selectors: Vec<ScopedSelector>,
    pub destination: Destination,
}

impl CompiledClusterRule {
    pub fn matches(
        &self,
        gvr: &Gvr,
        op: Operation,
        labels: &BTreeMap<String, String>,
        namespace_labels: &BTreeMap<String, String>,
    ) -> bool {
        self.selectors.iter().any(|scoped| {
            scoped.scope == gvr.scope
                && scoped.selector.matches_gvr(gvr)
                && scoped.selector.matches_operation(op)
                && scoped.selector.matches_labels(labels)
                && (scoped.scope == ApiScope::Cluster
                    || scoped.selector.matches_namespace_labels(namespace_labels))
        })
    }

    pub fn selects_gvr(&self, gvr: &Gvr) -> bool {
        self.selectors
            .iter()
            .any(|scoped| scoped.scope == gvr.scope && scoped.selector.matches_gvr(gvr))
    }

    /// Seed-time matching, operation filter excluded.
    pub fn matches_for_seed(
        &self,
        gvr: &Gvr,
        labels: &BTreeMap<String, String>,
        namespace_labels: &BTreeMap<String, String>,
    ) -> bool {
        self.selectors.iter().any(|scoped| {
            scoped.scope == gvr.scope
                && scoped.selector.matches_gvr(gvr)
                && scoped.selector.matches_labels(labels)
                && (scoped.scope == ApiScope::Cluster
                    || scoped.selector.matches_namespace_labels(namespace_labels))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_path_namespaced_grouped() {
        let id = ResourceIdentifier::new(&Gvr::namespaced("apps", "v1", "deployments"), "prod", "api");
        assert_eq!(id.to_git_path(), "apps/v1/deployments/prod/api.yaml");
    }

    #[test]
    fn git_path_core_omits_group_segment() {
        let id = ResourceIdentifier::new(&Gvr::namespaced("", "v1", "configmaps"), "prod", "app");
        assert_eq!(id.to_git_path(), "v1/configmaps/prod/app.yaml");
        let id = ResourceIdentifier::new(&Gvr::cluster("", "v1", "namespaces"), "", "prod");
        assert_eq!(id.to_git_path(), "v1/namespaces/prod.yaml");
    }

    #[test]
    fn git_path_round_trips() {
        let ids = [
            ResourceIdentifier::new(&Gvr::namespaced("apps", "v1", "deployments"), "prod", "api"),
            ResourceIdentifier::new(&Gvr::namespaced("", "v1", "configmaps"), "prod", "app"),
            ResourceIdentifier::new(&Gvr::cluster("", "v1", "namespaces"), "", "prod"),
            ResourceIdentifier::new(
                &Gvr::cluster("rbac.authorization.k8s.io", "v1", "clusterroles"),
                "",
                "admin",
            ),
            ResourceIdentifier::new(
                &Gvr::namespaced("shop.example.com", "v1alpha1", "icecreamorders"),
                "default",
                "cone",
            ),
        ];
        for id in ids {
            assert_eq!(ResourceIdentifier::from_git_path(&id.to_git_path()), Some(id));
        }
    }

    #[test]
    fn git_path_rejects_garbage() {
        assert_eq!(ResourceIdentifier::from_git_path("README.md"), None);
        assert_eq!(ResourceIdentifier::from_git_path("a.yaml"), None);
        assert_eq!(ResourceIdentifier::from_git_path("x//y/z.yaml"), None);
        assert_eq!(
            ResourceIdentifier::from_git_path("notaversion/pods/ns/name.yaml"),
            None
        );
    }

    #[test]
    fn version_segments() {
        for good in ["v1", "v2", "v10", "v1alpha1", "v1beta2", "v2beta10"] {
            assert!(is_version_segment(good), "{good}");
        }
        for bad in ["", "v", "1", "apps", "valpha", "v1alpha", "v1gamma1", "version1"] {
            assert!(!is_version_segment(bad), "{bad}");
        }
    }

    fn selector(groups: &[&str], versions: &[&str], resources: &[&str]) -> CompiledSelector {
        CompiledSelector {
            api_groups: groups.iter().map(|s| s.to_string()).collect(),
            api_versions: versions.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            operations: Vec::new(),
            label_selector: None,
            namespace_selector: None,
        }
    }

    #[test]
    fn wildcard_matches_any_but_empty_string_does_not() {
        let wild = selector(&["*"], &["*"], &["*"]);
        assert!(wild.matches_gvr(&Gvr::namespaced("apps", "v1", "deployments")));
        assert!(wild.matches_gvr(&Gvr::namespaced("", "v1", "pods")));

        let core_only = selector(&[""], &["v1"], &["pods"]);
        assert!(core_only.matches_gvr(&Gvr::namespaced("", "v1", "pods")));
        assert!(!core_only.matches_gvr(&Gvr::namespaced("apps", "v1", "pods")));
    }

    #[test]
    fn watch_rule_is_bound_to_its_namespace() {
        let rule = CompiledRule {
            key: RuleKey {
                namespace: "prod".into(),
                name: "mirror".into(),
            },
            source_namespace: "prod".into(),
            selectors: vec![selector(&["apps"], &["v1"], &["deployments"])],
            destination: Destination {
                repo_name: "repo".into(),
                repo_namespace: "prod".into(),
                branch: "main".into(),
                base_path: "clusters/prod".into(),
            },
        };
        let gvr = Gvr::namespaced("apps", "v1", "deployments");
        let labels = BTreeMap::new();
        assert!(rule.matches(&gvr, Operation::Create, "prod", &labels));
        assert!(!rule.matches(&gvr, Operation::Create, "staging", &labels));
        assert!(!rule.matches(
            &Gvr::cluster("apps", "v1", "deployments"),
            Operation::Create,
            "",
            &labels
        ));
    }

    #[test]
    fn cluster_rule_scope_must_agree() {
        let rule = CompiledClusterRule {
            key: RuleKey {
                namespace: String::new(),
                name: "all-namespaces".into(),
            },
            selectors: vec![ScopedSelector {
                selector: selector(&[""], &["v1"], &["namespaces"]),
                scope: ApiScope::Cluster,
            }],
            destination: Destination {
                repo_name: "repo".into(),
                repo_namespace: "ops".into(),
                branch: "main".into(),
                base_path: "clusters/all".into(),
            },
        };
        let labels = BTreeMap::new();
        assert!(rule.matches(
            &Gvr::cluster("", "v1", "namespaces"),
            Operation::Update,
            &labels,
            &labels
        ));
        assert!(!rule.matches(
            &Gvr::namespaced("", "v1", "namespaces"),
            Operation::Update,
            &labels,
            &labels
        ));
    }

    #[test]
    fn operation_filter() {
        let mut sel = selector(&["*"], &["*"], &["*"]);
        sel.operations = vec![Operation::Delete];
        assert!(sel.matches_operation(Operation::Delete));
        assert!(!sel.matches_operation(Operation::Create));
        sel.operations.clear();
        assert!(sel.matches_operation(Operation::Create));
    }
}
