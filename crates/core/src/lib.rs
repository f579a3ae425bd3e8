//! xpdiff core types: the unstructured resource model shared by every crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

pub mod composition;
pub mod requirements;

pub use composition::{Composition, Function, PipelineStep};
pub use requirements::{Requirements, ResourceMatch, ResourceSelector, SelectorError};

/// Label carried by every composed resource, naming its composite.
pub const LABEL_COMPOSITE: &str = "crossplane.io/composite";
/// Annotation naming the composition template a composed resource came from.
pub const ANNOTATION_COMPOSITION_RESOURCE_NAME: &str = "crossplane.io/composition-resource-name";

/// Group/Version/Kind triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` ("group/version" or bare "version") and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of a resource for caching and diff bookkeeping. Namespace is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        Self { api_version: api_version.to_string(), kind: kind.to_string(), name: name.to_string() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// A Kubernetes object of any kind, held as its JSON document.
///
/// Always an object at the top level. Resources are passed by value between
/// stages; mutate a clone, never a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub struct Resource(Json);

impl TryFrom<Json> for Resource {
    type Error = anyhow::Error;

    fn try_from(v: Json) -> Result<Self> {
        Resource::from_json(v)
    }
}

impl From<Resource> for Json {
    fn from(r: Resource) -> Self { r.0 }
}

impl Resource {
    pub fn new(api_version: &str, kind: &str) -> Self {
        let mut m = Map::new();
        m.insert("apiVersion".into(), Json::String(api_version.to_string()));
        m.insert("kind".into(), Json::String(kind.to_string()));
        m.insert("metadata".into(), Json::Object(Map::new()));
        Self(Json::Object(m))
    }

    pub fn from_json(v: Json) -> Result<Self> {
        if !v.is_object() {
            return Err(anyhow!("resource must be a JSON object"));
        }
        Ok(Self(v))
    }

    pub fn as_json(&self) -> &Json { &self.0 }
    pub fn into_json(self) -> Json { self.0 }

    pub fn pointer(&self, ptr: &str) -> Option<&Json> { self.0.pointer(ptr) }

    fn str_at(&self, ptr: &str) -> Option<&str> {
        self.0.pointer(ptr).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn api_version(&self) -> &str { self.str_at("/apiVersion").unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at("/kind").unwrap_or("") }
    pub fn name(&self) -> Option<&str> { self.str_at("/metadata/name") }
    pub fn generate_name(&self) -> Option<&str> { self.str_at("/metadata/generateName") }
    pub fn namespace(&self) -> Option<&str> { self.str_at("/metadata/namespace") }
    pub fn uid(&self) -> Option<&str> { self.str_at("/metadata/uid") }

    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(self.api_version(), self.kind()) }

    /// Key used for caching and diff maps. Unnamed resources key on their generateName.
    pub fn key(&self) -> ResourceKey {
        let name = self.name().or_else(|| self.generate_name()).unwrap_or("");
        ResourceKey::new(self.api_version(), self.kind(), name)
    }

    /// Name shown to humans; server-generated names render as `<prefix>(generated)`.
    pub fn display_name(&self) -> String {
        match (self.name(), self.generate_name()) {
            (Some(n), _) => n.to_string(),
            (None, Some(g)) => format!("{}(generated)", g),
            (None, None) => "<unnamed>".to_string(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map("/metadata/labels") }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map("/metadata/annotations") }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0.pointer("/metadata/labels").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.pointer("/metadata/annotations").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    fn string_map(&self, ptr: &str) -> BTreeMap<String, String> {
        self.0
            .pointer(ptr)
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.0
            .pointer("/metadata/ownerReferences")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_owner_references(&mut self, refs: &[OwnerReference]) {
        let v = serde_json::to_value(refs).unwrap_or(Json::Array(Vec::new()));
        self.metadata_mut().insert("ownerReferences".into(), v);
    }

    pub fn spec(&self) -> Option<&Json> { self.0.get("spec") }
    pub fn status(&self) -> Option<&Json> { self.0.get("status") }

    /// Mutable handle to `metadata`, created when missing or not an object.
    pub fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        let root = self.0.as_object_mut().expect("resource is always an object");
        let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        meta.as_object_mut().expect("metadata coerced to object")
    }

    pub fn root_mut(&mut self) -> &mut Map<String, Json> {
        self.0.as_object_mut().expect("resource is always an object")
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().insert("name".into(), Json::String(name.to_string()));
    }

    pub fn set_namespace(&mut self, ns: &str) {
        self.metadata_mut().insert("namespace".into(), Json::String(ns.to_string()));
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.metadata_mut().insert("uid".into(), Json::String(uid.to_string()));
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        Self::nested_map(self.metadata_mut(), "labels").insert(key.into(), Json::String(value.to_string()));
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        Self::nested_map(self.metadata_mut(), "annotations").insert(key.into(), Json::String(value.to_string()));
    }

    fn nested_map<'a>(parent: &'a mut Map<String, Json>, key: &str) -> &'a mut Map<String, Json> {
        let v = parent.entry(key).or_insert_with(|| Json::Object(Map::new()));
        if !v.is_object() {
            *v = Json::Object(Map::new());
        }
        v.as_object_mut().expect("coerced to object")
    }
}

pub mod prelude {
    pub use super::{
        Composition, Function, Gvk, OwnerReference, PipelineStep, Requirements, Resource, ResourceKey,
        ResourceMatch, ResourceSelector, ANNOTATION_COMPOSITION_RESOURCE_NAME, LABEL_COMPOSITE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_display_matches_kubernetes_form() {
        let gvk = Gvk::from_api_version("example.org/v1", "XR1");
        assert_eq!(gvk.to_string(), "example.org/v1, Kind=XR1");
        assert_eq!(Gvk::from_api_version("v1", "ConfigMap").api_version(), "v1");
    }

    #[test]
    fn accessors_treat_empty_strings_as_absent() {
        let r = Resource::from_json(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "", "generateName": "cm-", "labels": { "a": "b" } }
        }))
        .unwrap();
        assert_eq!(r.name(), None);
        assert_eq!(r.generate_name(), Some("cm-"));
        assert_eq!(r.display_name(), "cm-(generated)");
        assert_eq!(r.key().to_string(), "v1/ConfigMap/cm-");
        assert_eq!(r.label("a"), Some("b"));
    }

    #[test]
    fn setters_create_missing_metadata() {
        let mut r = Resource::from_json(json!({ "apiVersion": "v1", "kind": "Secret" })).unwrap();
        r.set_name("s");
        r.set_annotation(ANNOTATION_COMPOSITION_RESOURCE_NAME, "res");
        r.set_label(LABEL_COMPOSITE, "xr");
        assert_eq!(r.name(), Some("s"));
        assert_eq!(r.annotation(ANNOTATION_COMPOSITION_RESOURCE_NAME), Some("res"));
        assert_eq!(r.labels().get(LABEL_COMPOSITE).map(String::as_str), Some("xr"));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Resource::from_json(json!([1, 2])).is_err());
        assert!(serde_json::from_value::<Resource>(json!("x")).is_err());
    }

    #[test]
    fn owner_references_roundtrip_through_metadata() {
        let mut r = Resource::new("v1", "ConfigMap");
        r.set_owner_references(&[OwnerReference {
            api_version: "example.org/v1".into(),
            kind: "XR1".into(),
            name: "xr".into(),
            ..Default::default()
        }]);
        let refs = r.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "");
        assert_eq!(r.pointer("/metadata/ownerReferences/0/apiVersion"), Some(&json!("example.org/v1")));
    }
}
