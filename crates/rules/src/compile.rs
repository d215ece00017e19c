//! Translation from the declarative rule resources into their compiled,
//! matchable form. Defaults are applied here so matching only ever sees
//! concrete values: an empty apiGroups list becomes the core group, an empty
//! apiVersions list becomes `v1`.

use thiserror::Error;

use crd::{ClusterWatchRule, RuleScope, RuleSelector, WatchRule};

use crate::model::{
    ApiScope, CompiledClusterRule, CompiledRule, CompiledSelector, Destination, Operation, RuleKey,
    ScopedSelector,
};
use crate::selector::{LabelMatcher, SelectorError};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("rule has no name")]
    MissingName,
    #[error("watch rule has no namespace")]
    MissingNamespace,
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("invalid label selector: {0}")]
    InvalidSelector(#[from] SelectorError),
}

pub fn compile_watch_rule(
    rule: &WatchRule,
    destination: Destination,
) -> Result<CompiledRule, CompileError> {
    let name = rule.metadata.name.clone().ok_or(CompileError::MissingName)?;
    let namespace = rule
        .metadata
        .namespace
        .clone()
        .ok_or(CompileError::MissingNamespace)?;
    let selectors = rule
        .spec
        .rules
        .iter()
        .map(compile_selector)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledRule {
        key: RuleKey {
            namespace: namespace.clone(),
            name,
        },
        source_namespace: namespace,
        selectors,
        destination,
    })
}

pub fn compile_cluster_watch_rule(
    rule: &ClusterWatchRule,
    destination: Destination,
) -> Result<CompiledClusterRule, CompileError> {
    let name = rule.metadata.name.clone().ok_or(CompileError::MissingName)?;
    let selectors = rule
        .spec
        .rules
        .iter()
        .map(|scoped| {
            Ok(ScopedSelector {
                selector: compile_selector(&scoped.selector)?,
                scope: match scoped.scope {
                    RuleScope::Cluster => ApiScope::Cluster,
                    RuleScope::Namespaced => ApiScope::Namespaced,
                },
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;
    Ok(CompiledClusterRule {
        key: RuleKey {
            namespace: String::new(),
            name,
        },
        selectors,
        destination,
    })
}

fn compile_selector(selector: &RuleSelector) -> Result<CompiledSelector, CompileError> {
    let api_groups = if selector.api_groups.is_empty() {
        vec![String::new()]
    } else {
        selector
            .api_groups
            .iter()
            .map(|g| g.to_lowercase())
            .collect()
    };
    let api_versions = if selector.api_versions.is_empty() {
        vec!["v1".to_string()]
    } else {
        selector
            .api_versions
            .iter()
            .map(|v| v.to_lowercase())
            .collect()
    };
    let resources = selector
        .resources
        .iter()
        .map(|r| r.to_lowercase())
        .collect();
    let operations = compile_operations(&selector.operations)?;
    let label_selector = selector
        .label_selector
        .as_ref()
        .map(LabelMatcher::try_from)
        .transpose()?;
    let namespace_selector = selector
        .namespace_selector
        .as_ref()
        .map(LabelMatcher::try_from)
        .transpose()?;
    Ok(CompiledSelector {
        api_groups,
        api_versions,
        resources,
        operations,
        label_selector,
        namespace_selector,
    })
}

/// An empty list and the `*` wildcard both mean "all operations", encoded as
/// an empty compiled list.
fn compile_operations(operations: &[String]) -> Result<Vec<Operation>, CompileError> {
    let mut compiled = Vec::new();
    for op in operations {
        match op.to_uppercase().as_str() {
            "*" => return Ok(Vec::new()),
            "CREATE" => compiled.push(Operation::Create),
            "UPDATE" => compiled.push(Operation::Update),
            "DELETE" => compiled.push(Operation::Delete),
            _ => return Err(CompileError::UnknownOperation(op.clone())),
        }
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crd::{TargetReference, WatchRuleSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn destination() -> Destination {
        Destination {
            repo_name: "repo".into(),
            repo_namespace: "prod".into(),
            branch: "main".into(),
            base_path: "clusters/prod".into(),
        }
    }

    fn watch_rule(selectors: Vec<RuleSelector>) -> WatchRule {
        WatchRule {
            metadata: ObjectMeta {
                name: Some("mirror".into()),
                namespace: Some("prod".into()),
                ..Default::default()
            },
            spec: WatchRuleSpec {
                target_ref: TargetReference {
                    name: "target".into(),
                    namespace: None,
                },
                rules: selectors,
            },
        }
    }

    #[test]
    fn defaults_applied_at_compile_time() {
        let rule = watch_rule(vec![RuleSelector {
            resources: vec!["ConfigMaps".into()],
            ..Default::default()
        }]);
        let compiled = compile_watch_rule(&rule, destination()).unwrap();
        let selector = &compiled.selectors[0];
        assert_eq!(selector.api_groups, vec![String::new()]);
        assert_eq!(selector.api_versions, vec!["v1".to_string()]);
        assert_eq!(selector.resources, vec!["configmaps".to_string()]);
        assert!(selector.operations.is_empty());
    }

    #[test]
    fn star_operation_means_all() {
        let rule = watch_rule(vec![RuleSelector {
            resources: vec!["deployments".into()],
            operations: vec!["CREATE".into(), "*".into()],
            ..Default::default()
        }]);
        let compiled = compile_watch_rule(&rule, destination()).unwrap();
        assert!(compiled.selectors[0].operations.is_empty());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let rule = watch_rule(vec![RuleSelector {
            resources: vec!["deployments".into()],
            operations: vec!["CONNECT".into()],
            ..Default::default()
        }]);
        assert!(matches!(
            compile_watch_rule(&rule, destination()),
            Err(CompileError::UnknownOperation(_))
        ));
    }

    #[test]
    fn operations_parse_case_insensitively() {
        let rule = watch_rule(vec![RuleSelector {
            resources: vec!["deployments".into()],
            operations: vec!["create".into(), "Delete".into()],
            ..Default::default()
        }]);
        let compiled = compile_watch_rule(&rule, destination()).unwrap();
        assert_eq!(
            compiled.selectors[0].operations,
            vec![Operation::Create, Operation::Delete]
        );
    }
}
