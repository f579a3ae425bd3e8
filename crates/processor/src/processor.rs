//! The per-resource diff pipeline and its batch driver.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tracing::{debug, info};
use xpdiff_core::{Resource, ResourceKey};
use xpdiff_diff::{DiffOptions, DiffRenderer, DiffSummary, ResourceDiff};
use xpdiff_kubehub::ClusterClient;
use xpdiff_schema::SchemaValidator;

use crate::calculator::DiffCalculator;
use crate::discovery::{dynamic_requirements, has_templated_requirements, identify_static_requirements};
use crate::render::{RenderInput, RenderOutput, Renderer};
use crate::requirements::RequirementsProvider;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Namespace given to inputs that carry none.
    pub namespace: Option<String>,
    /// Upper bound on render passes per resource, including the first.
    pub max_render_passes: usize,
    pub diff_options: DiffOptions,
}

impl Default for ProcessorConfig {
    fn default() -> Self { Self { namespace: None, max_render_passes: 2, diff_options: DiffOptions::default() } }
}

/// Every per-resource failure of a batch run.
#[derive(Debug, thiserror::Error)]
#[error("{}", join_errors(.errors))]
pub struct BatchError {
    pub errors: Vec<anyhow::Error>,
}

fn join_errors(errors: &[anyhow::Error]) -> String {
    errors.iter().map(|e| format!("{:#}", e)).collect::<Vec<_>>().join("; ")
}

pub struct DiffProcessor<C: ?Sized> {
    client: Arc<C>,
    renderer: Arc<dyn Renderer>,
    config: ProcessorConfig,
    schemas: SchemaValidator,
    requirements: RequirementsProvider<C>,
    calculator: DiffCalculator<C>,
    output: DiffRenderer,
}

impl<C: ClusterClient + ?Sized> DiffProcessor<C> {
    pub fn new(client: Arc<C>, renderer: Arc<dyn Renderer>, config: ProcessorConfig) -> Self {
        Self {
            requirements: RequirementsProvider::new(client.clone()),
            calculator: DiffCalculator::new(client.clone()),
            output: DiffRenderer::new(config.diff_options.clone()),
            schemas: SchemaValidator::new(),
            client,
            renderer,
            config,
        }
    }

    pub fn requirements(&self) -> &RequirementsProvider<C> { &self.requirements }

    /// Load compositions, functions, schemas and environment configs.
    pub async fn initialize(&self) -> Result<()> {
        self.client.initialize().await.context("cannot initialize cluster client")?;
        self.schemas.initialize(&*self.client).await.context("cannot load resource definitions")?;
        self.requirements.initialize().await.context("cannot initialize requirements provider")?;
        Ok(())
    }

    async fn render(&self, xr: &Resource) -> Result<RenderOutput> {
        let composition = self.client.find_matching_composition(xr).context("cannot find matching composition")?;
        let functions = self.client.get_functions_from_pipeline(&composition).context("cannot get functions from pipeline")?;
        let declared = identify_static_requirements(&composition, xr).context("cannot identify requirements")?;
        let extra_resources = self.requirements.provide_requirements(&declared).await.context("cannot provide requirements")?;
        let templated = has_templated_requirements(&composition);
        debug!(composition = %composition.name, functions = functions.len(), extras = extra_resources.len(), templated, "rendering");

        let mut input = RenderInput { composite: xr.clone(), composition, functions, extra_resources };
        let max_passes = self.config.max_render_passes.max(1);
        let mut pass = 1;
        loop {
            let output = self.renderer.render(&input).await.context("cannot render resources")?;
            if pass >= max_passes {
                return Ok(output);
            }
            let wanted = dynamic_requirements(&output, templated).context("cannot identify dynamic requirements")?;
            if wanted.is_empty() {
                return Ok(output);
            }
            let fetched = self
                .requirements
                .provide_requirements(&wanted)
                .await
                .context("cannot provide dynamic requirements")?;
            let known: FxHashSet<ResourceKey> = input.extra_resources.iter().map(|r| r.key()).collect();
            let fresh: Vec<Resource> = fetched.into_iter().filter(|r| !known.contains(&r.key())).collect();
            if fresh.is_empty() {
                debug!(pass, "requirements reached a fixed point");
                return Ok(output);
            }
            debug!(pass, added = fresh.len(), "rendering again with dynamic requirements");
            input.extra_resources.extend(fresh);
            pass += 1;
        }
    }

    /// Run the full pipeline for one XR and return its diffs keyed by `apiVersion/kind/name`.
    pub async fn diff_single_resource(&self, xr: &Resource) -> Result<BTreeMap<String, ResourceDiff>> {
        let started = Instant::now();
        counter!("diff_resources_total", 1u64);
        self.requirements.clear_cache();

        let mut xr = xr.clone();
        if let (None, Some(ns)) = (xr.namespace(), self.config.namespace.as_deref()) {
            xr.set_namespace(ns);
        }

        let output = self.render(&xr).await?;
        let composite = output.composite.clone().unwrap_or_else(|| xr.clone());
        self.schemas
            .validate_resources(&composite, &output.composed)
            .context("cannot validate resources")?;
        let diffs = self.calculator.calculate_diffs(&xr, &output).await.context("cannot calculate diffs")?;

        histogram!("diff_process_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(resource = %xr.display_name(), diffs = diffs.len(), "processed resource");
        Ok(diffs)
    }

    /// Diff one XR and write its rendered diffs.
    pub async fn process_resource<W: Write + ?Sized>(&self, w: &mut W, xr: &Resource) -> Result<DiffSummary> {
        let diffs = self
            .diff_single_resource(xr)
            .await
            .with_context(|| format!("cannot process resource {}", xr.display_name()));
        let diffs = match diffs {
            Ok(d) => d,
            Err(e) => {
                counter!("diff_errors_total", 1u64);
                return Err(e);
            }
        };
        self.output.render_diffs(w, diffs.values()).context("cannot render diffs")
    }

    /// Diff every XR, write the combined output once, then report every failure together.
    pub async fn process_all<W: Write + ?Sized>(&self, w: &mut W, resources: &[Resource]) -> Result<DiffSummary> {
        let mut all = BTreeMap::new();
        let mut errors = Vec::new();
        for xr in resources {
            match self.diff_single_resource(xr).await {
                Ok(diffs) => all.extend(diffs),
                Err(e) => {
                    counter!("diff_errors_total", 1u64);
                    errors.push(e.context(format!("cannot process resource {}", xr.display_name())));
                }
            }
        }
        let summary = self.output.render_diffs(w, all.values()).context("cannot render diffs")?;
        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(BatchError { errors }.into())
        }
    }
}
