//! In-memory cluster double for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use xpdiff_core::{Composition, Function, Gvk, Resource};

use crate::{
    ClusterError, ClusterResult, CompositionSource, DefinitionSource, DryRunApplier, PipelineCache, ResourceGetter,
    ResourceLister,
};

/// Holds objects in memory and counts calls. Failures are injected per operation.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<Vec<Resource>>,
    compositions: Mutex<Vec<Resource>>,
    functions: Mutex<Vec<Resource>>,
    crds: Mutex<Vec<Resource>>,
    environment_configs: Mutex<Vec<Resource>>,
    /// Applied on top of the desired object by `dry_run_apply`, keyed by `Kind/name`.
    dry_run_overlays: Mutex<BTreeMap<String, serde_json::Value>>,
    cache: PipelineCache,
    pub fail_get: Mutex<Option<String>>,
    pub fail_list: Mutex<Option<String>>,
    pub fail_dry_run: Mutex<Option<String>>,
    pub get_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub dry_run_calls: AtomicUsize,
}

fn injected(op: &str, msg: &str) -> ClusterError {
    ClusterError::Decode { what: op.to_string(), source: anyhow::anyhow!(msg.to_string()) }
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    pub fn with_objects(objects: Vec<Resource>) -> Self {
        let f = Self::new();
        *f.objects.lock().unwrap() = objects;
        f
    }

    pub fn add_object(&self, r: Resource) { self.objects.lock().unwrap().push(r); }
    pub fn add_composition(&self, r: Resource) { self.compositions.lock().unwrap().push(r); }
    pub fn add_function(&self, r: Resource) { self.functions.lock().unwrap().push(r); }
    pub fn add_crd(&self, r: Resource) { self.crds.lock().unwrap().push(r); }
    pub fn add_environment_config(&self, r: Resource) { self.environment_configs.lock().unwrap().push(r); }

    pub fn set_dry_run_overlay(&self, kind: &str, name: &str, overlay: serde_json::Value) {
        self.dry_run_overlays.lock().unwrap().insert(format!("{}/{}", kind, name), overlay);
    }

    pub fn fail_gets(&self, msg: &str) { *self.fail_get.lock().unwrap() = Some(msg.to_string()); }
    pub fn fail_lists(&self, msg: &str) { *self.fail_list.lock().unwrap() = Some(msg.to_string()); }
    pub fn fail_dry_runs(&self, msg: &str) { *self.fail_dry_run.lock().unwrap() = Some(msg.to_string()); }

    pub fn gets(&self) -> usize { self.get_calls.load(Ordering::SeqCst) }
    pub fn lists(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }
    pub fn dry_runs(&self) -> usize { self.dry_run_calls.load(Ordering::SeqCst) }

    fn matches(r: &Resource, gvk: &Gvk, namespace: Option<&str>) -> bool {
        r.api_version() == gvk.api_version() && r.kind() == gvk.kind && namespace.map_or(true, |ns| r.namespace() == Some(ns))
    }
}

fn merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(b), serde_json::Value::Object(o)) => {
            for (k, v) in o {
                merge(b.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (b, o) => *b = o.clone(),
    }
}

#[async_trait]
impl ResourceGetter for FakeCluster {
    async fn get_resource(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> ClusterResult<Resource> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail_get.lock().unwrap().as_deref() {
            return Err(injected("get", msg));
        }
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|r| Self::matches(r, gvk, namespace) && r.name() == Some(name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound { gvk: gvk.clone(), name: name.to_string() })
    }
}

#[async_trait]
impl ResourceLister for FakeCluster {
    async fn get_resources_by_label(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<Resource>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail_list.lock().unwrap().as_deref() {
            return Err(injected("list", msg));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|r| Self::matches(r, gvk, namespace))
            .filter(|r| selector.iter().all(|(k, v)| r.label(k) == Some(v.as_str())))
            .cloned()
            .collect())
    }

    async fn list_resources(&self, gvk: &Gvk, namespace: Option<&str>) -> ClusterResult<Vec<Resource>> {
        self.get_resources_by_label(gvk, namespace, &BTreeMap::new()).await
    }
}

#[async_trait]
impl DryRunApplier for FakeCluster {
    async fn dry_run_apply(&self, resource: &Resource) -> ClusterResult<Resource> {
        self.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail_dry_run.lock().unwrap().as_deref() {
            return Err(injected("dry-run", msg));
        }
        let mut v = resource.as_json().clone();
        let key = format!("{}/{}", resource.kind(), resource.name().unwrap_or(""));
        if let Some(overlay) = self.dry_run_overlays.lock().unwrap().get(&key) {
            merge(&mut v, overlay);
        }
        Resource::from_json(v).map_err(|source| ClusterError::Decode { what: "dry-run result".into(), source })
    }
}

#[async_trait]
impl CompositionSource for FakeCluster {
    async fn initialize(&self) -> ClusterResult<()> {
        if let Some(msg) = self.fail_list.lock().unwrap().as_deref() {
            return Err(injected("list compositions", msg));
        }
        let comps = self.compositions.lock().unwrap().clone();
        let fns = self.functions.lock().unwrap().clone();
        self.cache.load(comps, fns)
    }

    fn find_matching_composition(&self, xr: &Resource) -> ClusterResult<Composition> {
        self.cache.find_matching_composition(xr)
    }

    fn get_functions_from_pipeline(&self, composition: &Composition) -> ClusterResult<Vec<Function>> {
        self.cache.get_functions_from_pipeline(composition)
    }
}

#[async_trait]
impl DefinitionSource for FakeCluster {
    async fn get_crds(&self) -> ClusterResult<Vec<Resource>> {
        Ok(self.crds.lock().unwrap().clone())
    }

    async fn get_environment_configs(&self) -> ClusterResult<Vec<Resource>> {
        Ok(self.environment_configs.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterClient;
    use serde_json::json;

    fn cm(name: &str, labels: serde_json::Value) -> Resource {
        Resource::from_json(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "labels": labels } })).unwrap()
    }

    fn assert_client<C: ClusterClient>(_: &C) {}

    #[tokio::test]
    async fn batched_lookup_rejects_count_mismatch_without_calls() {
        let fake = FakeCluster::with_objects(vec![cm("a", json!({ "x": "1" }))]);
        assert_client(&fake);
        let gvks = vec![Gvk::new("", "v1", "ConfigMap"), Gvk::new("", "v1", "Secret")];
        let sels = vec![BTreeMap::from([("x".to_string(), "1".to_string())])];
        let err = fake.get_all_resources_by_labels(&gvks, &sels).await.unwrap_err();
        assert!(matches!(err, ClusterError::CountMismatch { gvks: 2, selectors: 1 }));
        assert_eq!(fake.lists(), 0);
    }

    #[tokio::test]
    async fn batched_lookup_concatenates_matches() {
        let fake = FakeCluster::with_objects(vec![cm("a", json!({ "x": "1" })), cm("b", json!({ "x": "2" }))]);
        let gvks = vec![Gvk::new("", "v1", "ConfigMap"), Gvk::new("", "v1", "ConfigMap")];
        let sels = vec![
            BTreeMap::from([("x".to_string(), "1".to_string())]),
            BTreeMap::from([("x".to_string(), "2".to_string())]),
        ];
        let got = fake.get_all_resources_by_labels(&gvks, &sels).await.unwrap();
        let names: Vec<_> = got.iter().filter_map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(fake.lists(), 2);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let fake = FakeCluster::new();
        let err = fake.get_resource(&Gvk::new("", "v1", "ConfigMap"), None, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
