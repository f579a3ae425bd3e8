//! The function-pipeline render collaborator.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use xpdiff_core::{Composition, Function, Resource};

/// Marker document emitted by templating functions to request extra resources.
pub const EXTRA_RESOURCES_KIND: &str = "ExtraResources";
const RESULT_API_GROUP: &str = "render.crossplane.io";

#[derive(Debug, Clone)]
pub struct RenderInput {
    pub composite: Resource,
    pub composition: Composition,
    pub functions: Vec<Function>,
    pub extra_resources: Vec<Resource>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub composite: Option<Resource>,
    pub composed: Vec<Resource>,
    /// Function results, including any `ExtraResources` marker documents.
    pub results: Vec<Resource>,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, input: &RenderInput) -> Result<RenderOutput>;
}

/// Runs `crossplane render` on inputs written to a scratch directory.
pub struct CrossplaneRenderer {
    binary: PathBuf,
}

impl CrossplaneRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self { Self { binary: binary.into() } }
}

fn write_docs(path: &Path, docs: &[&Resource]) -> Result<()> {
    let mut body = String::new();
    for d in docs {
        body.push_str("---\n");
        body.push_str(&serde_yaml::to_string(d.as_json()).context("serializing render input")?);
    }
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

/// Split `crossplane render` output: the XR first, then results and composed resources.
pub fn parse_render_output(stdout: &str) -> Result<RenderOutput> {
    let mut out = RenderOutput::default();
    for doc in serde_yaml::Deserializer::from_str(stdout) {
        let v = serde_yaml::Value::deserialize(doc).context("parsing render output")?;
        if v.is_null() {
            continue;
        }
        let json = serde_json::to_value(v).context("converting render output to JSON")?;
        let r = Resource::from_json(json)?;
        let group = r.gvk().group;
        if out.composite.is_none() && out.composed.is_empty() && out.results.is_empty() {
            out.composite = Some(r);
        } else if group == RESULT_API_GROUP || r.kind() == EXTRA_RESOURCES_KIND {
            out.results.push(r);
        } else {
            out.composed.push(r);
        }
    }
    if out.composite.is_none() {
        return Err(anyhow!("render produced no composite resource"));
    }
    Ok(out)
}

#[async_trait]
impl Renderer for CrossplaneRenderer {
    async fn render(&self, input: &RenderInput) -> Result<RenderOutput> {
        let dir = tempfile::tempdir().context("creating render scratch directory")?;
        let xr = dir.path().join("xr.yaml");
        let comp = dir.path().join("composition.yaml");
        let fns = dir.path().join("functions.yaml");
        let extra = dir.path().join("extra-resources.yaml");
        write_docs(&xr, &[&input.composite])?;
        write_docs(&comp, &[&input.composition.raw])?;
        write_docs(&fns, &input.functions.iter().map(|f| &f.raw).collect::<Vec<_>>())?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("render").arg(&xr).arg(&comp).arg(&fns).arg("--include-function-results").arg("--include-full-xr");
        if !input.extra_resources.is_empty() {
            write_docs(&extra, &input.extra_resources.iter().collect::<Vec<_>>())?;
            cmd.arg(format!("--extra-resources={}", extra.display()));
        }
        debug!(binary = %self.binary.display(), extras = input.extra_resources.len(), "invoking render");
        let output = cmd.output().await.with_context(|| format!("running {}", self.binary.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} render exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_render_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_composite_results_and_composed() {
        let out = parse_render_output(
            "---\napiVersion: example.org/v1\nkind: XR1\nmetadata:\n  name: my-xr\n\
             ---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  generateName: my-xr-\n\
             ---\napiVersion: render.crossplane.io/v1beta1\nkind: Result\nmessage: ok\n\
             ---\napiVersion: meta.gotemplating.fn.crossplane.io/v1alpha1\nkind: ExtraResources\nrequirements: {}\n",
        )
        .unwrap();
        assert_eq!(out.composite.as_ref().and_then(|c| c.name()), Some("my-xr"));
        assert_eq!(out.composed.len(), 1);
        assert_eq!(out.results.len(), 2);
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(parse_render_output("").is_err());
    }
}
