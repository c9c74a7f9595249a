//! Label and field selector matching for cached and in-memory reads

use crate::{CoreError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A single label requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// Parsed label selector, all requirements ANDed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Parse the string form used by list requests,
    /// e.g. `app=shop,tier!=db,zone in (a,b),!legacy`
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(selector) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    /// Selector requiring every given label to be present with the given value
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(k, v)| Requirement::Equals(k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Render back to the list-request string form
    pub fn to_query(&self) -> String {
        self.requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::In(k, vs) => format!("{} in ({})", k, join(vs)),
                Requirement::NotIn(k, vs) => format!("{} notin ({})", k, join(vs)),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(",")
}

// Commas inside `in (...)` sets do not separate terms
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, set)) = term.split_once(" notin ") {
        return Ok(Requirement::NotIn(k.trim().to_string(), parse_set(set)?));
    }
    if let Some((k, set)) = term.split_once(" in ") {
        return Ok(Requirement::In(k.trim().to_string(), parse_set(set)?));
    }
    if term.contains(char::is_whitespace) || term.contains('(') {
        return Err(CoreError::InvalidDesiredState(format!(
            "invalid label selector term: {}",
            term
        )));
    }
    Ok(Requirement::Exists(term.to_string()))
}

fn parse_set(set: &str) -> Result<BTreeSet<String>> {
    let inner = set
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| CoreError::InvalidDesiredState(format!("invalid set: {}", set)))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Parsed field selector (`path=value` / `path!=value` terms ANDed) evaluated
/// against the JSON form of an object
#[derive(Clone, Debug, Default)]
pub struct FieldSelector {
    terms: Vec<(String, String, bool)>,
}

impl FieldSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (path, value, negated) = if let Some((p, v)) = term.split_once("!=") {
                (p, v, true)
            } else if let Some((p, v)) = term.split_once("==") {
                (p, v, false)
            } else if let Some((p, v)) = term.split_once('=') {
                (p, v, false)
            } else {
                return Err(CoreError::InvalidDesiredState(format!(
                    "invalid field selector term: {}",
                    term
                )));
            };
            terms.push((path.trim().to_string(), value.trim().to_string(), negated));
        }
        Ok(Self { terms })
    }

    pub fn matches(&self, object: &Value) -> bool {
        self.terms.iter().all(|(path, expected, negated)| {
            let actual = lookup(object, path);
            (actual.as_deref() == Some(expected.as_str())) != *negated
        })
    }
}

fn lookup(object: &Value, path: &str) -> Option<String> {
    let mut current = object;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equality_and_existence() {
        let selector = LabelSelector::parse("app=shop,tier!=db,!legacy,zone").unwrap();
        assert!(selector.matches(&labels(&[("app", "shop"), ("zone", "a")])));
        assert!(!selector.matches(&labels(&[("app", "shop")])));
        assert!(!selector.matches(&labels(&[("app", "shop"), ("zone", "a"), ("legacy", "1")])));
        assert!(!selector.matches(&labels(&[("app", "shop"), ("zone", "a"), ("tier", "db")])));
    }

    #[test]
    fn test_set_based() {
        let selector = LabelSelector::parse("zone in (a, b),group notin (canary)").unwrap();
        assert!(selector.matches(&labels(&[("zone", "b")])));
        assert!(!selector.matches(&labels(&[("zone", "c")])));
        assert!(!selector.matches(&labels(&[("zone", "a"), ("group", "canary")])));
        assert_eq!(selector.to_query(), "zone in (a,b),group notin (canary)");
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_invalid_term() {
        assert!(LabelSelector::parse("zone in a").is_err());
    }

    #[test]
    fn test_field_selector() {
        let event = json!({"type": "Warning", "involvedObject": {"name": "shop-blue"}});
        assert!(FieldSelector::parse("type=Warning").unwrap().matches(&event));
        assert!(FieldSelector::parse("involvedObject.name=shop-blue,type!=Normal")
            .unwrap()
            .matches(&event));
        assert!(!FieldSelector::parse("type=Normal").unwrap().matches(&event));
        assert!(FieldSelector::parse("nonsense").is_err());
    }
}
