//! Requirement discovery: static (from pipeline inputs) and dynamic (from render results).

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;
use xpdiff_core::{Composition, Requirements, Resource, ResourceSelector};

use crate::render::{RenderOutput, EXTRA_RESOURCES_KIND};

const EXTRA_RESOURCES_INPUT_GROUP: &str = "extra-resources.fn.crossplane.io";
const GO_TEMPLATING_INPUT_GROUP: &str = "gotemplating.fn.crossplane.io";

/// Walk a dotted field path with optional `[index]` or `[key]` segments, e.g. `spec.items[0].name`.
pub fn extract_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, rest) = match seg.find('[') {
            Some(brk) => (&seg[..brk], &seg[brk..]),
            None => (seg, ""),
        };
        if !key.is_empty() {
            cur = cur.as_object()?.get(key)?;
        }
        let mut rest = rest;
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            let inner = &stripped[..end];
            cur = match cur {
                Json::Array(arr) => arr.get(inner.parse::<usize>().ok()?)?,
                Json::Object(map) => map.get(inner)?,
                _ => return None,
            };
            rest = &stripped[end + 1..];
        }
    }
    Some(cur)
}

fn api_group(api_version: &str) -> &str {
    api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtraResourcesInput {
    #[serde(default)]
    spec: ExtraResourcesSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtraResourcesSpec {
    #[serde(default)]
    extra_resources: Vec<ExtraResourceSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtraResourceSource {
    api_version: String,
    kind: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    into: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, rename = "ref")]
    reference: Option<NameRef>,
    #[serde(default)]
    selector: Option<LabelSelectorSpec>,
}

#[derive(Debug, Deserialize)]
struct NameRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelSelectorSpec {
    #[serde(default)]
    match_labels: Vec<LabelMatcher>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelMatcher {
    key: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    value_from_field_path: Option<String>,
    #[serde(default)]
    from_field_path_policy: Option<String>,
}

fn label_value(m: &LabelMatcher, xr: &Resource) -> Result<Option<String>> {
    match m.r#type.as_deref().unwrap_or("FromCompositeFieldPath") {
        "Value" => m.value.clone().map(Some).ok_or_else(|| anyhow!("label {} has type Value but no value", m.key)),
        "FromCompositeFieldPath" => {
            let path = m
                .value_from_field_path
                .as_deref()
                .ok_or_else(|| anyhow!("label {} has no valueFromFieldPath", m.key))?;
            match extract_path(xr.as_json(), path) {
                Some(Json::String(s)) => Ok(Some(s.clone())),
                Some(v @ (Json::Number(_) | Json::Bool(_))) => Ok(Some(v.to_string())),
                Some(_) => Err(anyhow!("field path {} on {} is not a scalar", path, xr.display_name())),
                None if m.from_field_path_policy.as_deref() == Some("Optional") => Ok(None),
                None => Err(anyhow!("field path {} not found on {}", path, xr.display_name())),
            }
        }
        other => Err(anyhow!("label {} has unsupported type {}", m.key, other)),
    }
}

fn step_requirements(input: &Json, xr: &Resource) -> Result<Requirements> {
    let parsed = ExtraResourcesInput::deserialize(input).context("cannot parse extra-resources input")?;
    let mut reqs = Requirements::default();
    for (i, src) in parsed.spec.extra_resources.iter().enumerate() {
        let name = src.into.clone().unwrap_or_else(|| format!("{}-{}", src.kind, i));
        let mut sel = match src.r#type.as_deref().unwrap_or("Reference") {
            "Reference" => {
                let r = src.reference.as_ref().ok_or_else(|| anyhow!("extra resource {} has no ref", name))?;
                ResourceSelector::by_name(&src.api_version, &src.kind, &r.name)
            }
            "Selector" => {
                let s = src.selector.as_ref().ok_or_else(|| anyhow!("extra resource {} has no selector", name))?;
                let mut labels = BTreeMap::new();
                for m in &s.match_labels {
                    if let Some(v) = label_value(m, xr).with_context(|| format!("cannot resolve selector for {}", name))? {
                        labels.insert(m.key.clone(), v);
                    }
                }
                if labels.is_empty() {
                    debug!(requirement = %name, "selector resolved to no labels; skipping");
                    continue;
                }
                ResourceSelector::by_labels(&src.api_version, &src.kind, labels)
            }
            other => return Err(anyhow!("extra resource {} has unsupported type {}", name, other)),
        };
        sel.namespace = src.namespace.clone();
        reqs.resources.insert(name, sel);
    }
    Ok(reqs)
}

/// Requirements declared up front by extra-resources steps, keyed by step name.
pub fn identify_static_requirements(comp: &Composition, xr: &Resource) -> Result<BTreeMap<String, Requirements>> {
    let mut out = BTreeMap::new();
    for step in &comp.pipeline {
        let Some(input) = step.input.as_ref() else { continue };
        let av = input.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        if api_group(av) != EXTRA_RESOURCES_INPUT_GROUP {
            continue;
        }
        let reqs = step_requirements(input, xr).with_context(|| format!("cannot identify requirements of step {}", step.step))?;
        if !reqs.is_empty() {
            out.insert(step.step.clone(), reqs);
        }
    }
    Ok(out)
}

/// Whether an inline template contains a YAML document of kind `ExtraResources`.
///
/// Only unindented `kind:` keys count; nested ones belong to some inner object.
fn template_declares_extra_resources(template: &str) -> bool {
    template.lines().any(|l| {
        l.strip_prefix("kind:")
            .map(|k| k.split('#').next().unwrap_or("").trim().trim_matches(|c| c == '"' || c == '\'') == EXTRA_RESOURCES_KIND)
            .unwrap_or(false)
    })
}

/// True when a go-templating step renders its own `ExtraResources` request.
pub fn has_templated_requirements(comp: &Composition) -> bool {
    comp.pipeline.iter().any(|step| {
        let Some(input) = step.input.as_ref() else { return false };
        let av = input.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        api_group(av) == GO_TEMPLATING_INPUT_GROUP
            && extract_path(input, "inline.template").and_then(|t| t.as_str()).map_or(false, template_declares_extra_resources)
    })
}

/// Requirements the render asked for through `ExtraResources` result documents.
/// Only templated compositions emit them.
pub fn dynamic_requirements(output: &RenderOutput, templated: bool) -> Result<BTreeMap<String, Requirements>> {
    let mut out = BTreeMap::new();
    if !templated {
        return Ok(out);
    }
    for (i, doc) in output.results.iter().filter(|r| r.kind() == EXTRA_RESOURCES_KIND).enumerate() {
        let Some(reqs) = doc.pointer("/requirements") else { continue };
        let parsed = Requirements::from_json(reqs).context("cannot parse ExtraResources requirements")?;
        if !parsed.is_empty() {
            out.insert(format!("extra-resources-{}", i), parsed);
        }
    }
    Ok(out)
}
