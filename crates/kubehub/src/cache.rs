//! Composition and function caches, filled once by `initialize`.

use std::sync::RwLock;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use xpdiff_core::{Composition, Function, Gvk, Resource};

use crate::{ClusterError, ClusterResult};

#[derive(Default)]
struct Inner {
    compositions: FxHashMap<(String, String), Composition>,
    functions: FxHashMap<String, Function>,
    loaded: bool,
}

/// Owned by one cluster client instance; never process-global.
#[derive(Default)]
pub struct PipelineCache {
    inner: RwLock<Inner>,
}

impl PipelineCache {
    pub fn new() -> Self { Self::default() }

    /// Build fresh maps from raw objects and swap them in. On error the previous state is kept.
    pub fn load(&self, compositions: Vec<Resource>, functions: Vec<Resource>) -> ClusterResult<()> {
        let mut parsed = Vec::with_capacity(compositions.len());
        for raw in &compositions {
            let c = Composition::from_resource(raw)
                .map_err(|source| ClusterError::Decode { what: "composition".into(), source })?;
            parsed.push(c);
        }
        // Last one wins for duplicate composite types; name order makes "last" deterministic.
        parsed.sort_by(|a, b| a.name.cmp(&b.name));
        let mut comps: FxHashMap<(String, String), Composition> = FxHashMap::default();
        for c in parsed {
            let key = (c.composite_type.api_version(), c.composite_type.kind.clone());
            if let Some(prev) = comps.get(&key) {
                warn!(composite = %c.composite_type, replaced = %prev.name, by = %c.name, "multiple compositions target the same composite type");
            }
            comps.insert(key, c);
        }

        let mut fns: FxHashMap<String, Function> = FxHashMap::default();
        for raw in &functions {
            let f = Function::from_resource(raw).map_err(|source| ClusterError::Decode { what: "function".into(), source })?;
            fns.insert(f.name.clone(), f);
        }

        debug!(compositions = comps.len(), functions = fns.len(), "pipeline cache loaded");
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *inner = Inner { compositions: comps, functions: fns, loaded: true };
        Ok(())
    }

    pub fn find_matching_composition(&self, xr: &Resource) -> ClusterResult<Composition> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        if !inner.loaded {
            return Err(ClusterError::NotInitialized);
        }
        let key = (xr.api_version().to_string(), xr.kind().to_string());
        inner
            .compositions
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NoComposition(Gvk::from_api_version(xr.api_version(), xr.kind())))
    }

    pub fn get_functions_from_pipeline(&self, composition: &Composition) -> ClusterResult<Vec<Function>> {
        if !composition.is_pipeline() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        if !inner.loaded {
            return Err(ClusterError::NotInitialized);
        }
        let mut out = Vec::with_capacity(composition.pipeline.len());
        for step in &composition.pipeline {
            let f = inner.functions.get(&step.function_ref).ok_or_else(|| ClusterError::FunctionNotFound {
                function: step.function_ref.clone(),
                step: step.step.clone(),
            })?;
            out.push(f.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn composition(name: &str, api_version: &str, kind: &str, steps: &[(&str, &str)]) -> Resource {
        let pipeline: Vec<_> = steps.iter().map(|(s, f)| json!({ "step": s, "functionRef": { "name": f } })).collect();
        Resource::from_json(json!({
            "apiVersion": "apiextensions.crossplane.io/v1",
            "kind": "Composition",
            "metadata": { "name": name },
            "spec": {
                "compositeTypeRef": { "apiVersion": api_version, "kind": kind },
                "mode": "Pipeline",
                "pipeline": pipeline
            }
        }))
        .unwrap()
    }

    fn function(name: &str) -> Resource {
        Resource::from_json(json!({
            "apiVersion": "pkg.crossplane.io/v1",
            "kind": "Function",
            "metadata": { "name": name },
            "spec": { "package": format!("xpkg.upbound.io/{}:v0.1.0", name) }
        }))
        .unwrap()
    }

    #[test]
    fn lookup_before_load_is_not_initialized() {
        let cache = PipelineCache::new();
        let xr = Resource::new("example.org/v1", "XR1");
        assert!(matches!(cache.find_matching_composition(&xr), Err(ClusterError::NotInitialized)));
    }

    #[test]
    fn missing_composition_names_the_composite_type() {
        let cache = PipelineCache::new();
        cache.load(vec![composition("c", "example.org/v1", "XR2", &[])], vec![]).unwrap();
        let err = cache.find_matching_composition(&Resource::new("example.org/v1", "XR1")).unwrap_err();
        assert!(err.to_string().contains("no composition found for example.org/v1, Kind=XR1"), "{}", err);
    }

    #[test]
    fn missing_function_names_function_and_step() {
        let cache = PipelineCache::new();
        let comp = composition("c", "example.org/v1", "XR1", &[("step-b", "function-b")]);
        cache.load(vec![comp.clone()], vec![function("function-a")]).unwrap();
        let parsed = cache.find_matching_composition(&Resource::new("example.org/v1", "XR1")).unwrap();
        let err = cache.get_functions_from_pipeline(&parsed).unwrap_err().to_string();
        assert!(err.contains("function-b") && err.contains("step-b"), "{}", err);
    }

    #[test]
    fn non_pipeline_composition_has_no_functions() {
        let cache = PipelineCache::new();
        let mut raw = composition("c", "example.org/v1", "XR1", &[("s", "missing")]).into_json();
        raw["spec"]["mode"] = json!("Resources");
        let c = Composition::from_resource(&Resource::from_json(raw).unwrap()).unwrap();
        assert!(cache.get_functions_from_pipeline(&c).unwrap().is_empty());
    }

    #[test]
    fn duplicate_compositions_resolve_to_last_by_name() {
        let cache = PipelineCache::new();
        cache
            .load(
                vec![composition("zz", "example.org/v1", "XR1", &[]), composition("aa", "example.org/v1", "XR1", &[])],
                vec![],
            )
            .unwrap();
        let c = cache.find_matching_composition(&Resource::new("example.org/v1", "XR1")).unwrap();
        assert_eq!(c.name, "zz");
    }

    #[test]
    fn failed_load_keeps_previous_state() {
        let cache = PipelineCache::new();
        cache.load(vec![composition("c", "example.org/v1", "XR1", &[])], vec![]).unwrap();
        let broken = Resource::from_json(json!({ "apiVersion": "apiextensions.crossplane.io/v1", "kind": "Composition", "metadata": { "name": "b" } })).unwrap();
        assert!(cache.load(vec![broken], vec![]).is_err());
        assert!(cache.find_matching_composition(&Resource::new("example.org/v1", "XR1")).is_ok());
    }
}
