//! Typed views over Composition and Function objects.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Gvk, Resource};

pub const COMPOSITION_API_VERSION: &str = "apiextensions.crossplane.io/v1";
pub const COMPOSITION_KIND: &str = "Composition";
pub const FUNCTION_API_VERSION: &str = "pkg.crossplane.io/v1";
pub const FUNCTION_KIND: &str = "Function";
pub const MODE_PIPELINE: &str = "Pipeline";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub step: String,
    pub function_ref: String,
    pub input: Option<Json>,
}

/// A composition, parsed once and then treated as immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub name: String,
    /// Composite type this composition targets.
    pub composite_type: Gvk,
    pub mode: Option<String>,
    pub pipeline: Vec<PipelineStep>,
    pub raw: Resource,
}

impl Composition {
    pub fn from_resource(raw: &Resource) -> Result<Self> {
        let name = raw.name().ok_or_else(|| anyhow!("composition is missing metadata.name"))?.to_string();
        let type_ref = raw
            .pointer("/spec/compositeTypeRef")
            .ok_or_else(|| anyhow!("composition {} is missing spec.compositeTypeRef", name))?;
        let api_version = type_ref.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = type_ref.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if api_version.is_empty() || kind.is_empty() {
            return Err(anyhow!("composition {} has an incomplete compositeTypeRef", name));
        }
        let mode = raw.pointer("/spec/mode").and_then(|v| v.as_str()).map(str::to_string);

        let mut pipeline = Vec::new();
        if let Some(steps) = raw.pointer("/spec/pipeline").and_then(|v| v.as_array()) {
            for (i, s) in steps.iter().enumerate() {
                let step = s
                    .get("step")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("pipeline step {} has no name", i))
                    .with_context(|| format!("parsing composition {}", name))?;
                let function_ref = s
                    .pointer("/functionRef/name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("pipeline step {} has no functionRef.name", step))
                    .with_context(|| format!("parsing composition {}", name))?;
                pipeline.push(PipelineStep {
                    step: step.to_string(),
                    function_ref: function_ref.to_string(),
                    input: s.get("input").cloned(),
                });
            }
        }

        Ok(Self { name, composite_type: Gvk::from_api_version(api_version, kind), mode, pipeline, raw: raw.clone() })
    }

    pub fn is_pipeline(&self) -> bool { self.mode.as_deref() == Some(MODE_PIPELINE) }
}

/// Function package metadata, referenced by pipeline steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub package: Option<String>,
    pub raw: Resource,
}

impl Function {
    pub fn from_resource(raw: &Resource) -> Result<Self> {
        let name = raw.name().ok_or_else(|| anyhow!("function is missing metadata.name"))?.to_string();
        let package = raw.pointer("/spec/package").and_then(|v| v.as_str()).map(str::to_string);
        Ok(Self { name, package, raw: raw.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn composition_json() -> Json {
        json!({
            "apiVersion": COMPOSITION_API_VERSION,
            "kind": COMPOSITION_KIND,
            "metadata": { "name": "xr1-comp" },
            "spec": {
                "compositeTypeRef": { "apiVersion": "example.org/v1", "kind": "XR1" },
                "mode": "Pipeline",
                "pipeline": [
                    { "step": "render", "functionRef": { "name": "function-a" }, "input": { "kind": "Input" } },
                    { "step": "ready", "functionRef": { "name": "function-auto-ready" } }
                ]
            }
        })
    }

    #[test]
    fn parses_pipeline_composition() {
        let c = Composition::from_resource(&Resource::from_json(composition_json()).unwrap()).unwrap();
        assert_eq!(c.composite_type, Gvk::new("example.org", "v1", "XR1"));
        assert!(c.is_pipeline());
        assert_eq!(c.pipeline.len(), 2);
        assert_eq!(c.pipeline[0].function_ref, "function-a");
        assert!(c.pipeline[1].input.is_none());
    }

    #[test]
    fn missing_function_ref_is_an_error() {
        let mut v = composition_json();
        v["spec"]["pipeline"][1]["functionRef"] = json!({});
        let err = Composition::from_resource(&Resource::from_json(v).unwrap()).unwrap_err();
        assert!(format!("{:#}", err).contains("ready has no functionRef.name"));
    }
}
