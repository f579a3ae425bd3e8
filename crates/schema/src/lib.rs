//! xpdiff schema: validate rendered resources against their CRD schemas.
//!
//! Kubernetes structural schemas are OpenAPI v3 with a few extensions. They are
//! converted to plain JSON Schema (draft 7) before validation: `nullable` becomes a
//! `"null"` type alternative and `x-kubernetes-int-or-string` becomes an `anyOf`.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};
use xpdiff_core::{Gvk, Resource};
use xpdiff_kubehub::DefinitionSource;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The CRD's embedded schema could not be turned into a usable validator.
    #[error("cannot convert schema for {gvk}")]
    Conversion {
        gvk: Gvk,
        #[source]
        source: anyhow::Error,
    },
    /// The resource does not conform to its schema.
    #[error("{kind}/{name} is invalid at {path:?}: {message}")]
    Invalid { kind: String, name: String, path: String, message: String },
}

/// Pick the version whose schema describes a CRD: storage first, else the last listed.
pub fn preferred_version(crd: &Resource) -> Option<String> {
    let versions = crd.pointer("/spec/versions").and_then(|v| v.as_array())?;
    versions
        .iter()
        .find(|ver| ver.get("storage").and_then(|b| b.as_bool()).unwrap_or(false))
        .or_else(|| versions.last())
        .and_then(|ver| ver.get("name").and_then(|s| s.as_str()))
        .map(str::to_string)
}

/// Convert a structural schema node (and its children) to JSON Schema.
pub fn to_json_schema(structural: &Json) -> Result<Json> {
    convert(structural, "")
}

fn convert(node: &Json, path: &str) -> Result<Json> {
    let obj = node.as_object().ok_or_else(|| anyhow!("schema node at {:?} is not an object", path))?;
    let mut out = Map::new();
    let mut nullable = false;
    let mut int_or_string = false;

    for (k, v) in obj {
        match k.as_str() {
            "type" => {
                if !v.is_string() {
                    return Err(anyhow!("schema node at {:?} has a non-string type", path));
                }
                out.insert(k.clone(), v.clone());
            }
            "nullable" => nullable = v.as_bool().unwrap_or(false),
            "x-kubernetes-int-or-string" => int_or_string = v.as_bool().unwrap_or(false),
            "properties" | "patternProperties" | "definitions" => {
                let props = v.as_object().ok_or_else(|| anyhow!("{} at {:?} is not an object", k, path))?;
                let mut converted = Map::new();
                for (pk, pv) in props {
                    converted.insert(pk.clone(), convert(pv, &format!("{}/{}", path, pk))?);
                }
                out.insert(k.clone(), Json::Object(converted));
            }
            "items" | "not" => {
                out.insert(k.clone(), convert(v, &format!("{}/{}", path, k))?);
            }
            "additionalProperties" => {
                let conv = if v.is_boolean() { v.clone() } else { convert(v, &format!("{}/{}", path, k))? };
                out.insert(k.clone(), conv);
            }
            "allOf" | "anyOf" | "oneOf" => {
                let arr = v.as_array().ok_or_else(|| anyhow!("{} at {:?} is not an array", k, path))?;
                let conv = arr
                    .iter()
                    .enumerate()
                    .map(|(i, s)| convert(s, &format!("{}/{}/{}", path, k, i)))
                    .collect::<Result<Vec<_>>>()?;
                out.insert(k.clone(), Json::Array(conv));
            }
            k if k.starts_with("x-kubernetes-") => {}
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }

    if int_or_string {
        out.remove("type");
        out.insert("anyOf".into(), serde_json::json!([{ "type": "integer" }, { "type": "string" }]));
    }
    if nullable {
        if let Some(Json::String(t)) = out.remove("type") {
            out.insert("type".into(), serde_json::json!([t, "null"]));
        }
    }
    Ok(Json::Object(out))
}

/// Structural schemas indexed by GVK, loaded from CRDs once per run.
#[derive(Default)]
pub struct SchemaValidator {
    schemas: RwLock<FxHashMap<Gvk, Json>>,
}

impl SchemaValidator {
    pub fn new() -> Self { Self::default() }

    pub async fn initialize<S: DefinitionSource + ?Sized>(&self, source: &S) -> Result<()> {
        let crds = source.get_crds().await?;
        let n = self.load_crds(&crds);
        debug!(crds = crds.len(), schemas = n, "schema validator initialized");
        Ok(())
    }

    /// Index every version schema of every CRD; returns the number of schemas indexed.
    pub fn load_crds(&self, crds: &[Resource]) -> usize {
        let mut schemas = self.schemas.write().unwrap_or_else(|p| p.into_inner());
        let mut n = 0;
        for crd in crds {
            let group = crd.pointer("/spec/group").and_then(|v| v.as_str()).unwrap_or("");
            let kind = crd.pointer("/spec/names/kind").and_then(|v| v.as_str()).unwrap_or("");
            if kind.is_empty() {
                warn!(crd = crd.name().unwrap_or(""), "CRD without spec.names.kind; skipping");
                continue;
            }
            let versions = crd.pointer("/spec/versions").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for ver in &versions {
                let name = ver.get("name").and_then(|s| s.as_str()).unwrap_or("");
                if let Some(s) = ver.pointer("/schema/openAPIV3Schema") {
                    schemas.insert(Gvk::new(group, name, kind), s.clone());
                    n += 1;
                }
            }
            // Legacy location shared by every version.
            if let (Some(s), Some(v)) = (crd.pointer("/spec/validation/openAPIV3Schema"), preferred_version(crd)) {
                schemas.entry(Gvk::new(group, &v, kind)).or_insert_with(|| s.clone());
            }
        }
        n
    }

    pub fn has_schema(&self, gvk: &Gvk) -> bool {
        self.schemas.read().unwrap_or_else(|p| p.into_inner()).contains_key(gvk)
    }

    /// Validate one resource. Kinds without a known schema pass.
    pub fn validate(&self, resource: &Resource) -> Result<(), SchemaError> {
        let gvk = resource.gvk();
        let structural = match self.schemas.read().unwrap_or_else(|p| p.into_inner()).get(&gvk) {
            Some(s) => s.clone(),
            None => {
                debug!(gvk = %gvk, "no schema known; skipping validation");
                return Ok(());
            }
        };
        let schema = to_json_schema(&structural).map_err(|source| SchemaError::Conversion { gvk: gvk.clone(), source })?;
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| SchemaError::Conversion { gvk: gvk.clone(), source: anyhow!("compiling schema: {}", e) })?;

        let instance = resource.as_json();
        let first = match compiled.validate(instance) {
            Ok(()) => None,
            Err(mut errors) => errors.next().map(|e| (e.instance_path.to_string(), e.to_string())),
        };
        match first {
            None => Ok(()),
            Some((path, message)) => Err(SchemaError::Invalid {
                kind: resource.kind().to_string(),
                name: resource.display_name(),
                path,
                message,
            }),
        }
    }

    /// Validate the composite and every composed resource, stopping at the first violation.
    pub fn validate_resources(&self, composite: &Resource, composed: &[Resource]) -> Result<(), SchemaError> {
        self.validate(composite)?;
        for r in composed {
            self.validate(r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd() -> Resource {
        Resource::from_json(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "xr1s.example.org" },
            "spec": {
                "group": "example.org",
                "names": { "kind": "XR1", "plural": "xr1s" },
                "versions": [
                    { "name": "v1alpha1", "served": true, "storage": false },
                    {
                        "name": "v1", "served": true, "storage": true,
                        "schema": { "openAPIV3Schema": {
                            "type": "object",
                            "properties": {
                                "spec": {
                                    "type": "object",
                                    "required": ["size"],
                                    "properties": {
                                        "size": { "type": "string", "enum": ["small", "large"] },
                                        "port": { "x-kubernetes-int-or-string": true },
                                        "note": { "type": "string", "nullable": true }
                                    }
                                }
                            }
                        } }
                    }
                ]
            }
        }))
        .unwrap()
    }

    fn xr(spec: Json) -> Resource {
        Resource::from_json(json!({ "apiVersion": "example.org/v1", "kind": "XR1", "metadata": { "name": "my-xr" }, "spec": spec })).unwrap()
    }

    #[test]
    fn preferred_version_is_storage_version() {
        assert_eq!(preferred_version(&crd()).as_deref(), Some("v1"));
    }

    #[test]
    fn conversion_handles_kubernetes_extensions() {
        let s = to_json_schema(&json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
            "properties": {
                "a": { "x-kubernetes-int-or-string": true },
                "b": { "type": "string", "nullable": true }
            }
        }))
        .unwrap();
        assert!(s.get("x-kubernetes-preserve-unknown-fields").is_none());
        assert_eq!(s["properties"]["a"]["anyOf"][0]["type"], "integer");
        assert_eq!(s["properties"]["b"]["type"], json!(["string", "null"]));
    }

    #[test]
    fn conforming_resources_pass() {
        let v = SchemaValidator::new();
        assert_eq!(v.load_crds(&[crd()]), 1);
        v.validate_resources(&xr(json!({ "size": "small", "port": 8080, "note": null })), &[]).unwrap();
        v.validate(&xr(json!({ "size": "large", "port": "http" }))).unwrap();
    }

    #[test]
    fn violations_report_path() {
        let v = SchemaValidator::new();
        v.load_crds(&[crd()]);
        match v.validate(&xr(json!({ "size": "huge" }))) {
            Err(SchemaError::Invalid { path, name, .. }) => {
                assert_eq!(path, "/spec/size");
                assert_eq!(name, "my-xr");
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    #[test]
    fn malformed_schema_is_a_conversion_error() {
        let mut raw = crd().into_json();
        raw["spec"]["versions"][1]["schema"]["openAPIV3Schema"]["properties"]["spec"]["type"] = json!(7);
        let v = SchemaValidator::new();
        v.load_crds(&[Resource::from_json(raw).unwrap()]);
        assert!(matches!(v.validate(&xr(json!({ "size": "small" }))), Err(SchemaError::Conversion { .. })));
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let v = SchemaValidator::new();
        let cm = Resource::new("v1", "ConfigMap");
        assert!(!v.has_schema(&cm.gvk()));
        v.validate(&cm).unwrap();
    }

    #[tokio::test]
    async fn initialize_reads_crds_from_source() {
        let fake = xpdiff_kubehub::testing::FakeCluster::new();
        fake.add_crd(crd());
        let v = SchemaValidator::new();
        v.initialize(&fake).await.unwrap();
        assert!(v.has_schema(&Gvk::new("example.org", "v1", "XR1")));
    }
}
