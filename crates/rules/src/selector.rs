//! Evaluation of Kubernetes label selectors (matchLabels + matchExpressions)
//! against a label map.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("unknown selector operator {0:?}")]
    UnknownOperator(String),
    #[error("operator {0} requires a values list")]
    ValuesRequired(&'static str),
    #[error("operator {0} takes no values")]
    ValuesForbidden(&'static str),
}

#[derive(Debug, Clone)]
enum Requirement {
    In { key: String, values: BTreeSet<String> },
    NotIn { key: String, values: BTreeSet<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::In { key, values } => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::NotIn { key, values } => {
                !labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

/// Compiled form of a `LabelSelector`. An empty selector matches everything,
/// like the API server's semantics.
#[derive(Debug, Clone, Default)]
pub struct LabelMatcher {
    match_labels: BTreeMap<String, String>,
    requirements: Vec<Requirement>,
}

impl LabelMatcher {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self.requirements.iter().all(|req| req.matches(labels))
    }
}

impl TryFrom<&LabelSelector> for LabelMatcher {
    type Error = SelectorError;

    fn try_from(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let match_labels = selector.match_labels.clone().unwrap_or_default();
        let mut requirements = Vec::new();
        for requirement in selector.match_expressions.iter().flatten() {
            let key = requirement.key.clone();
            let values = || -> Result<BTreeSet<String>, SelectorError> {
                match &requirement.values {
                    Some(values) if !values.is_empty() => Ok(values.iter().cloned().collect()),
                    _ => Err(SelectorError::ValuesRequired("In/NotIn")),
                }
            };
            let no_values = |op: &'static str| -> Result<(), SelectorError> {
                match &requirement.values {
                    Some(values) if !values.is_empty() => Err(SelectorError::ValuesForbidden(op)),
                    _ => Ok(()),
                }
            };
            requirements.push(match requirement.operator.as_str() {
                "In" => Requirement::In {
                    key,
                    values: values()?,
                },
                "NotIn" => Requirement::NotIn {
                    key,
                    values: values()?,
                },
                "Exists" => {
                    no_values("Exists")?;
                    Requirement::Exists { key }
                }
                "DoesNotExist" => {
                    no_values("DoesNotExist")?;
                    Requirement::DoesNotExist { key }
                }
                other => return Err(SelectorError::UnknownOperator(other.to_string())),
            });
        }
        Ok(Self {
            match_labels,
            requirements,
        })
    }
}
