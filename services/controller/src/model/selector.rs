//! Label selectors.
//!
//! A selector combines label equality (`app=web`) with structured
//! requirements (`tier in (front, back)`, `!canary`). An empty selector is
//! refused: it would match the whole cluster.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Selector errors. Always user errors, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector can't be an empty set")]
    Empty,

    #[error("requirement on {key:?}: operator {operator} needs at least one value")]
    MissingValues { key: String, operator: Operator },

    #[error("requirement on {key:?}: operator {operator} takes no values")]
    UnexpectedValues { key: String, operator: Operator },

    #[error("invalid label key {0:?}")]
    InvalidKey(String),
}

/// Requirement operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!",
        })
    }
}

/// A structured label requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelRequirement {
    pub key: String,
    pub operator: Operator,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelRequirement {
    pub fn new(key: &str, operator: Operator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn exists(key: &str) -> Self {
        Self::new(key, Operator::Exists, &[])
    }

    fn validate(&self) -> Result<(), SelectorError> {
        if self.key.is_empty() || self.key.chars().any(char::is_whitespace) {
            return Err(SelectorError::InvalidKey(self.key.clone()));
        }
        match self.operator {
            Operator::In | Operator::NotIn if self.values.is_empty() => {
                Err(SelectorError::MissingValues {
                    key: self.key.clone(),
                    operator: self.operator,
                })
            }
            Operator::Exists | Operator::DoesNotExist if !self.values.is_empty() => {
                Err(SelectorError::UnexpectedValues {
                    key: self.key.clone(),
                    operator: self.operator,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            op => write!(f, "{} {} ({})", self.key, op, self.values.join(",")),
        }
    }
}

/// Combined equality + requirement selector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    /// Build a selector, refusing the empty one.
    pub fn build(
        match_labels: &BTreeMap<String, String>,
        requirements: &[LabelRequirement],
    ) -> Result<Self, SelectorError> {
        let selector = Self {
            match_labels: match_labels.clone(),
            requirements: requirements.to_vec(),
        };
        selector.validate()?;
        Ok(selector)
    }

    /// A selector from equality pairs only. Does not validate.
    pub fn from_labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            requirements: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, requirement: LabelRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.requirements.is_empty()
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.is_empty() {
            return Err(SelectorError::Empty);
        }
        for key in self.match_labels.keys() {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(SelectorError::InvalidKey(key.clone()));
            }
        }
        self.requirements.iter().try_for_each(LabelRequirement::validate)
    }

    /// Whether a label set satisfies every term.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(self.requirements.iter().map(ToString::to_string))
            .collect();
        f.write_str(&terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_is_refused() {
        assert_eq!(
            LabelSelector::build(&BTreeMap::new(), &[]).unwrap_err(),
            SelectorError::Empty
        );
        assert_eq!(
            SelectorError::Empty.to_string(),
            "selector can't be an empty set"
        );
    }

    #[rstest]
    #[case(LabelRequirement::new("tier", Operator::In, &["front", "back"]), &[("tier", "front")], true)]
    #[case(LabelRequirement::new("tier", Operator::In, &["front"]), &[("tier", "db")], false)]
    #[case(LabelRequirement::new("tier", Operator::In, &["front"]), &[], false)]
    #[case(LabelRequirement::new("tier", Operator::NotIn, &["db"]), &[("tier", "front")], true)]
    #[case(LabelRequirement::new("tier", Operator::NotIn, &["db"]), &[], true)]
    #[case(LabelRequirement::new("tier", Operator::NotIn, &["db"]), &[("tier", "db")], false)]
    #[case(LabelRequirement::exists("canary"), &[("canary", "")], true)]
    #[case(LabelRequirement::exists("canary"), &[], false)]
    #[case(LabelRequirement::new("canary", Operator::DoesNotExist, &[]), &[], true)]
    fn test_requirement_matching(
        #[case] requirement: LabelRequirement,
        #[case] pod_labels: &[(&str, &str)],
        #[case] want: bool,
    ) {
        assert_eq!(requirement.matches(&labels(pod_labels)), want);
    }

    #[test]
    fn test_combined_selector() {
        let selector = LabelSelector::from_labels([("app", "web")])
            .with_requirement(LabelRequirement::new("zone", Operator::NotIn, &["us-east-1a"]));
        assert!(selector.validate().is_ok());

        assert!(selector.matches(&labels(&[("app", "web"), ("zone", "us-east-1b")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("zone", "us-east-1a")])));
        assert!(!selector.matches(&labels(&[("app", "api")])));
        assert_eq!(selector.to_string(), "app=web,zone notin (us-east-1a)");
    }

    #[test]
    fn test_requirement_values_are_validated() {
        let missing = LabelSelector::default()
            .with_requirement(LabelRequirement::new("tier", Operator::In, &[]));
        assert!(matches!(
            missing.validate(),
            Err(SelectorError::MissingValues { .. })
        ));

        let unexpected = LabelSelector::default()
            .with_requirement(LabelRequirement::new("tier", Operator::Exists, &["x"]));
        assert!(matches!(
            unexpected.validate(),
            Err(SelectorError::UnexpectedValues { .. })
        ));
    }
}
