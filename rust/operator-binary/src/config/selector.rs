//! Parsing and evaluation of annotation-selector expressions, used by the
//! Configuration Merger to decide which conditionals apply to a given
//! `InstanceGroup`.
//!
//! The grammar mirrors Kubernetes label-selector syntax (comma-separated,
//! implicit AND) but is evaluated against an annotation map instead of a
//! label map:
//!
//! - `key=value` / `key==value`: equality
//! - `key!=value`: inequality
//! - `key`: existence
//! - `!key`: non-existence

use std::collections::BTreeMap;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum SelectorError {
    #[snafu(display("empty selector term in {selector:?}"))]
    EmptyTerm { selector: String },
    #[snafu(display("malformed selector term {term:?} in {selector:?}"))]
    MalformedTerm { term: String, selector: String },
}

#[derive(Clone, Debug, PartialEq)]
enum Requirement {
    Exists(String),
    NotExists(String),
    Equals(String, String),
    NotEquals(String, String),
}

/// A parsed annotation selector. An empty selector matches every object,
/// mirroring Kubernetes' treatment of an empty label selector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnnotationSelector {
    requirements: Vec<Requirement>,
}

impl AnnotationSelector {
    pub fn parse(raw: &str) -> Result<AnnotationSelector, SelectorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(AnnotationSelector::default());
        }

        let mut requirements = Vec::new();
        for term in raw.split(',') {
            let term = term.trim();
            ensure_non_empty(term, raw)?;
            requirements.push(parse_term(term, raw)?);
        }
        Ok(AnnotationSelector { requirements })
    }

    pub fn matches(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Exists(key) => annotations.contains_key(key),
            Requirement::NotExists(key) => !annotations.contains_key(key),
            Requirement::Equals(key, value) => annotations.get(key) == Some(value),
            Requirement::NotEquals(key, value) => annotations.get(key) != Some(value),
        })
    }
}

fn ensure_non_empty(term: &str, raw: &str) -> Result<(), SelectorError> {
    if term.is_empty() {
        return EmptyTermSnafu {
            selector: raw.to_string(),
        }
        .fail();
    }
    Ok(())
}

fn parse_term(term: &str, raw: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = term.strip_prefix('!') {
        return non_empty_key(key, term, raw).map(|k| Requirement::NotExists(k.to_string()));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(
            non_empty_key(key, term, raw)?.to_string(),
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Requirement::Equals(
            non_empty_key(key, term, raw)?.to_string(),
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Requirement::Equals(
            non_empty_key(key, term, raw)?.to_string(),
            value.trim().to_string(),
        ));
    }
    non_empty_key(term, term, raw).map(|k| Requirement::Exists(k.to_string()))
}

fn non_empty_key<'a>(key: &'a str, term: &str, raw: &str) -> Result<&'a str, SelectorError> {
    let key = key.trim();
    if key.is_empty() {
        return MalformedTermSnafu {
            term: term.to_string(),
            selector: raw.to_string(),
        }
        .fail();
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = AnnotationSelector::parse("").unwrap();
        assert!(selector.matches(&annotations(&[])));
        assert!(selector.matches(&annotations(&[("a", "b")])));
    }

    #[test]
    fn equality_and_existence_terms_combine_with_and() {
        let selector = AnnotationSelector::parse("env=prod, tier").unwrap();
        assert!(selector.matches(&annotations(&[("env", "prod"), ("tier", "gpu")])));
        assert!(!selector.matches(&annotations(&[("env", "staging"), ("tier", "gpu")])));
        assert!(!selector.matches(&annotations(&[("env", "prod")])));
    }

    #[test]
    fn negation_terms_are_supported() {
        let selector = AnnotationSelector::parse("!spot, env!=staging").unwrap();
        assert!(selector.matches(&annotations(&[("env", "prod")])));
        assert!(!selector.matches(&annotations(&[("spot", "true"), ("env", "prod")])));
        assert!(!selector.matches(&annotations(&[("env", "staging")])));
    }

    #[test]
    fn malformed_term_is_rejected() {
        assert!(AnnotationSelector::parse("=value").is_err());
        assert!(AnnotationSelector::parse("a,,b").is_err());
    }
}
