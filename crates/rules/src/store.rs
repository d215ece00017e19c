use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::model::{CompiledClusterRule, CompiledRule, Gvr, Operation, RuleKey};

/// Process-wide index of compiled rules. Read by the change pipeline on
/// every event, written by the rule controllers; reads take the read lock,
/// matching returns owned copies so no lock is held during fan-out.
#[derive(Default)]
pub struct RuleStore {
    watch: RwLock<HashMap<RuleKey, CompiledRule>>,
    cluster: RwLock<HashMap<RuleKey, CompiledClusterRule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update_watch_rule(&self, rule: CompiledRule) {
        self.watch.write().unwrap().insert(rule.key.clone(), rule);
    }

    pub fn delete_watch_rule(&self, key: &RuleKey) {
        self.watch.write().unwrap().remove(key);
    }

    pub fn add_or_update_cluster_rule(&self, rule: CompiledClusterRule) {
        self.cluster.write().unwrap().insert(rule.key.clone(), rule);
    }

    pub fn delete_cluster_rule(&self, key: &RuleKey) {
        self.cluster.write().unwrap().remove(key);
    }

    /// All rules matching one observed object. Order is not significant;
    /// destination-level deduplication happens in the change pipeline.
    pub fn match_for_object(
        &self,
        gvr: &Gvr,
        op: Operation,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        namespace_labels: &BTreeMap<String, String>,
    ) -> (Vec<CompiledRule>, Vec<CompiledClusterRule>) {
        let watch = self
            .watch
            .read()
            .unwrap()
            .values()
            .filter(|rule| rule.matches(gvr, op, namespace, labels))
            .cloned()
            .collect();
        let cluster = self
            .cluster
            .read()
            .unwrap()
            .values()
            .filter(|rule| rule.matches(gvr, op, labels, namespace_labels))
            .cloned()
            .collect();
        (watch, cluster)
    }

    /// Point-in-time copy for the discovery planner.
    pub fn snapshot_watch_rules(&self) -> Vec<CompiledRule> {
        self.watch.read().unwrap().values().cloned().collect()
    }

    /// Point-in-time copy for the discovery planner.
    pub fn snapshot_cluster_rules(&self) -> Vec<CompiledClusterRule> {
        self.cluster.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiScope, CompiledSelector, Destination, ScopedSelector};

    fn selector(resources: &[&str]) -> CompiledSelector {
        CompiledSelector {
            api_groups: vec!["apps".into()],
            api_versions: vec!["v1".into()],
            resources: resources.iter().map(|s| s.to_string()).collect(),
            operations: Vec::new(),
            label_selector: None,
            namespace_selector: None,
        }
    }

    fn watch_rule(name: &str, namespace: &str) -> CompiledRule {
        CompiledRule {
            key: RuleKey {
                namespace: namespace.into(),
                name: name.into(),
            },
            source_namespace: namespace.into(),
            selectors: vec![selector(&["deployments"])],
            destination: Destination {
                repo_name: "repo".into(),
                repo_namespace: namespace.into(),
                branch: "main".into(),
                base_path: format!("clusters/{namespace}"),
            },
        }
    }

    #[test]
    fn add_update_delete_are_idempotent() {
        let store = RuleStore::new();
        let rule = watch_rule("mirror", "prod");
        store.add_or_update_watch_rule(rule.clone());
        store.add_or_update_watch_rule(rule.clone());
        assert_eq!(store.snapshot_watch_rules().len(), 1);
        store.delete_watch_rule(&rule.key);
        store.delete_watch_rule(&rule.key);
        assert!(store.snapshot_watch_rules().is_empty());
    }

    #[test]
    fn matching_respects_namespace_boundary() {
        let store = RuleStore::new();
        store.add_or_update_watch_rule(watch_rule("a", "prod"));
        store.add_or_update_watch_rule(watch_rule("b", "staging"));

        let gvr = Gvr::namespaced("apps", "v1", "deployments");
        let labels = BTreeMap::new();
        let (watch, cluster) =
            store.match_for_object(&gvr, Operation::Update, "prod", &labels, &labels);
        assert_eq!(watch.len(), 1);
        assert_eq!(watch[0].key.name, "a");
        assert!(cluster.is_empty());
    }

    #[test]
    fn cluster_rules_match_cluster_scope() {
        let store = RuleStore::new();
        store.add_or_update_cluster_rule(CompiledClusterRule {
            key: RuleKey {
                namespace: String::new(),
                name: "cluster-wide".into(),
            },
            selectors: vec![ScopedSelector {
                selector: CompiledSelector {
                    api_groups: vec![String::new()],
                    api_versions: vec!["v1".into()],
                    resources: vec!["namespaces".into()],
                    operations: Vec::new(),
                    label_selector: None,
                    namespace_selector: None,
                },
                scope: ApiScope::Cluster,
            }],
            destination: Destination {
                repo_name: "repo".into(),
                repo_namespace: "ops".into(),
                branch: "main".into(),
                base_path: "clusters/all".into(),
            },
        });

        let labels = BTreeMap::new();
        let (watch, cluster) = store.match_for_object(
            &Gvr::cluster("", "v1", "namespaces"),
            Operation::Create,
            "",
            &labels,
            &labels,
        );
        assert!(watch.is_empty());
        assert_eq!(cluster.len(), 1);
    }
}
