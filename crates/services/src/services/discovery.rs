use std::collections::{BTreeSet, HashMap, HashSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use kube::core::ApiResource;
use rules::{ApiScope, CompiledClusterRule, CompiledRule, Gvr};
use tracing::{debug, warn};

/// Resources the operator refuses to mirror: high-churn or ephemeral types
/// whose git history would be noise. Matched by plural name in any group.
const EXCLUDED_RESOURCES: [&str; 10] = [
    "pods",
    "events",
    "endpoints",
    "endpointslices",
    "leases",
    "controllerrevisions",
    "flowschemas",
    "prioritylevelconfigurations",
    "jobs",
    "cronjobs",
];

/// A requested GVR confirmed by live discovery, with the kind needed to
/// build a dynamic API client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGvr {
    pub gvr: Gvr,
    pub kind: String,
}

impl DiscoveredGvr {
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.gvr.group.is_empty() {
            self.gvr.version.clone()
        } else {
            format!("{}/{}", self.gvr.group, self.gvr.version)
        };
        ApiResource {
            group: self.gvr.group.clone(),
            version: self.gvr.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.gvr.resource.clone(),
        }
    }
}

/// Informer reach for one GVR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    ClusterWide,
    Namespaces(BTreeSet<String>),
    /// No rule reaches the GVR; no informer is needed.
    None,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    namespaced: bool,
    listable: bool,
    kind: String,
}

/// Aggregates rules into requested GVRs and intersects them with what the
/// API server actually serves.
#[derive(Clone)]
pub struct DiscoveryPlanner {
    client: Client,
}

impl DiscoveryPlanner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Concrete GVRs the rule set asks for. Only selector clauses with
    /// exactly one concrete apiGroup and apiVersion contribute; wildcards
    /// and subresource patterns never produce informers. Deduplicated on
    /// (group, version, resource, scope).
    pub fn compute_requested_gvrs(
        watch: &[CompiledRule],
        cluster: &[CompiledClusterRule],
    ) -> Vec<Gvr> {
        let mut seen = HashSet::new();
        let mut requested = Vec::new();
        let mut push = |gvr: Gvr| {
            if seen.insert(gvr.clone()) {
                requested.push(gvr);
            }
        };
        for rule in watch {
            for selector in &rule.selectors {
                for gvr in concrete_gvrs(selector, ApiScope::Namespaced) {
                    push(gvr);
                }
            }
        }
        for rule in cluster {
            for scoped in &rule.selectors {
                for gvr in concrete_gvrs(&scoped.selector, scoped.scope) {
                    push(gvr);
                }
            }
        }
        requested
    }

    /// Intersect requested GVRs with live discovery. A requested GVR passes
    /// when the server lists it with both `list` and `watch` verbs, at the
    /// requested scope, and it is not on the built-in exclusion list.
    /// Discovery failures in individual API groups are skipped; partial
    /// discovery returns what it can.
    pub async fn filter_discoverable(&self, requested: &[Gvr]) -> Vec<DiscoveredGvr> {
        if requested.is_empty() {
            return Vec::new();
        }
        let lists = self.collect_resource_lists().await;
        let index = build_index(&lists);
        filter_against_index(requested, &index)
    }

    async fn collect_resource_lists(&self) -> Vec<APIResourceList> {
        let mut lists = Vec::new();
        match self.client.list_core_api_versions().await {
            Ok(versions) => {
                for version in versions.versions {
                    match self.client.list_core_api_resources(&version).await {
                        Ok(list) => lists.push(list),
                        Err(e) => warn!(%version, "core discovery failed: {e}"),
                    }
                }
            }
            Err(e) => warn!("core API version discovery failed: {e}"),
        }
        match self.client.list_api_groups().await {
            Ok(groups) => {
                for group in groups.groups {
                    for version in &group.versions {
                        match self
                            .client
                            .list_api_group_resources(&version.group_version)
                            .await
                        {
                            Ok(list) => lists.push(list),
                            Err(e) => {
                                debug!(group_version = %version.group_version, "group discovery failed: {e}");
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("API group discovery failed: {e}"),
        }
        lists
    }

    /// Informer scope for one discoverable GVR: cluster-scoped types watch
    /// cluster-wide; namespaced types watch cluster-wide as soon as any
    /// cluster rule with namespaced reach selects them (that subsumes any
    /// per-namespace set), otherwise the union of the selecting watch
    /// rules' source namespaces.
    pub fn namespaces_for(
        gvr: &Gvr,
        watch: &[CompiledRule],
        cluster: &[CompiledClusterRule],
    ) -> NamespaceScope {
        if gvr.scope == ApiScope::Cluster {
            return NamespaceScope::ClusterWide;
        }
        if cluster.iter().any(|rule| rule.selects_gvr(gvr)) {
            return NamespaceScope::ClusterWide;
        }
        let namespaces: BTreeSet<String> = watch
            .iter()
            .filter(|rule| rule.selects_gvr(gvr))
            .map(|rule| rule.source_namespace.clone())
            .collect();
        if namespaces.is_empty() {
            NamespaceScope::None
        } else {
            NamespaceScope::Namespaces(namespaces)
        }
    }
}

fn concrete_gvrs(selector: &rules::CompiledSelector, scope: ApiScope) -> Vec<Gvr> {
    let [group] = selector.api_groups.as_slice() else {
        return Vec::new();
    };
    let [version] = selector.api_versions.as_slice() else {
        return Vec::new();
    };
    if group == "*" || version == "*" {
        return Vec::new();
    }
    selector
        .resources
        .iter()
        .filter(|resource| *resource != "*" && !resource.contains('/'))
        .map(|resource| Gvr::new(group, version, resource, scope))
        .collect()
}

fn build_index(lists: &[APIResourceList]) -> HashMap<(String, String, String), IndexEntry> {
    let mut index = HashMap::new();
    for list in lists {
        let (group, version) = match list.group_version.split_once('/') {
            Some((group, version)) => (group.to_lowercase(), version.to_lowercase()),
            None => (String::new(), list.group_version.to_lowercase()),
        };
        for resource in &list.resources {
            if resource.name.contains('/') {
                continue;
            }
            let listable = resource.verbs.iter().any(|v| v == "list")
                && resource.verbs.iter().any(|v| v == "watch");
            index.insert(
                (group.clone(), version.clone(), resource.name.to_lowercase()),
                IndexEntry {
                    namespaced: resource.namespaced,
                    listable,
                    kind: resource.kind.clone(),
                },
            );
        }
    }
    index
}

fn filter_against_index(
    requested: &[Gvr],
    index: &HashMap<(String, String, String), IndexEntry>,
) -> Vec<DiscoveredGvr> {
    requested
        .iter()
        .filter_map(|gvr| {
            if EXCLUDED_RESOURCES.contains(&gvr.resource.as_str()) {
                return None;
            }
            let entry = index.get(&(
                gvr.group.clone(),
                gvr.version.clone(),
                gvr.resource.clone(),
            ))?;
            if !entry.listable {
                return None;
            }
            let scope_matches = match gvr.scope {
                ApiScope::Namespaced => entry.namespaced,
                ApiScope::Cluster => !entry.namespaced,
            };
            if !scope_matches {
                return None;
            }
            Some(DiscoveredGvr {
                gvr: gvr.clone(),
                kind: entry.kind.clone(),
            })
        })
        .collect()
}
