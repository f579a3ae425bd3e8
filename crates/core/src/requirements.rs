//! Resource requirements declared by pipeline steps.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

use crate::Gvk;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("requirement {0} has no selector")]
    Missing(String),
    #[error("requirement {0} is missing apiVersion or kind")]
    MissingType(String),
    #[error("requirement {0} must set exactly one of matchName or matchLabels")]
    Unsupported(String),
    #[error("requirement {0}: matchLabels must map strings to strings")]
    BadLabels(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMatch {
    Name(String),
    Labels(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub matcher: ResourceMatch,
}

impl ResourceSelector {
    pub fn by_name(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: None,
            matcher: ResourceMatch::Name(name.to_string()),
        }
    }

    pub fn by_labels(api_version: &str, kind: &str, labels: BTreeMap<String, String>) -> Self {
        Self { api_version: api_version.to_string(), kind: kind.to_string(), namespace: None, matcher: ResourceMatch::Labels(labels) }
    }

    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(&self.api_version, &self.kind) }

    /// Parse the `{apiVersion, kind, matchName | matchLabels, namespace?}` selector shape.
    pub fn from_json(requirement: &str, v: &Json) -> Result<Self, SelectorError> {
        let obj = match v.as_object() {
            Some(o) => o,
            None => return Err(SelectorError::Missing(requirement.to_string())),
        };
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if api_version.is_empty() || kind.is_empty() {
            return Err(SelectorError::MissingType(requirement.to_string()));
        }
        let namespace = obj.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
        let name = obj.get("matchName").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let labels = obj.get("matchLabels").filter(|v| !v.is_null());
        let matcher = match (name, labels) {
            (Some(n), None) => ResourceMatch::Name(n.to_string()),
            (None, Some(l)) => {
                let map = l.as_object().ok_or_else(|| SelectorError::BadLabels(requirement.to_string()))?;
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let s = v.as_str().ok_or_else(|| SelectorError::BadLabels(requirement.to_string()))?;
                    out.insert(k.clone(), s.to_string());
                }
                ResourceMatch::Labels(out)
            }
            _ => return Err(SelectorError::Unsupported(requirement.to_string())),
        };
        Ok(Self { api_version: api_version.to_string(), kind: kind.to_string(), namespace, matcher })
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            ResourceMatch::Name(n) => write!(f, "{}/{} named {}", self.api_version, self.kind, n),
            ResourceMatch::Labels(l) => write!(f, "{}/{} labelled {}", self.api_version, self.kind, label_selector(l)),
        }
    }
}

/// Render a label map as a Kubernetes equality selector, e.g. `a=1,b=2`.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Named selectors one pipeline step needs satisfied before it can run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub resources: BTreeMap<String, ResourceSelector>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    /// Parse a `requirements:` map (`{<name>: <selector>}`), as found in `ExtraResources` documents.
    pub fn from_json(v: &Json) -> Result<Self, SelectorError> {
        let mut resources = BTreeMap::new();
        if let Some(map) = v.as_object() {
            for (name, sel) in map {
                if sel.is_null() {
                    return Err(SelectorError::Missing(name.clone()));
                }
                resources.insert(name.clone(), ResourceSelector::from_json(name, sel)?);
            }
        }
        Ok(Self { resources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_name_and_label_selectors() {
        let reqs = Requirements::from_json(&json!({
            "cool": { "apiVersion": "example.org/v1", "kind": "Cool", "matchName": "cool-1" },
            "envs": { "apiVersion": "v1", "kind": "ConfigMap", "matchLabels": { "env": "prod" } }
        }))
        .unwrap();
        assert_eq!(reqs.resources["cool"].matcher, ResourceMatch::Name("cool-1".into()));
        match &reqs.resources["envs"].matcher {
            ResourceMatch::Labels(l) => assert_eq!(label_selector(l), "env=prod"),
            other => panic!("unexpected matcher {:?}", other),
        }
    }

    #[test]
    fn rejects_ambiguous_and_empty_selectors() {
        let both = json!({ "x": { "apiVersion": "v1", "kind": "ConfigMap", "matchName": "a", "matchLabels": { "b": "c" } } });
        assert_eq!(Requirements::from_json(&both), Err(SelectorError::Unsupported("x".into())));
        let none = json!({ "x": { "apiVersion": "v1", "kind": "ConfigMap" } });
        assert_eq!(Requirements::from_json(&none), Err(SelectorError::Unsupported("x".into())));
        let null = json!({ "x": null });
        assert_eq!(Requirements::from_json(&null), Err(SelectorError::Missing("x".into())));
    }
}
