//! kube-rs backed implementation of the cluster capability traits.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};
use xpdiff_core::{
    composition::{COMPOSITION_API_VERSION, COMPOSITION_KIND, FUNCTION_API_VERSION, FUNCTION_KIND},
    requirements::label_selector,
    Composition, Function, Gvk, Resource,
};

use crate::{
    ClusterError, ClusterResult, CompositionSource, DefinitionSource, DryRunApplier, PipelineCache, ResourceGetter,
    ResourceLister,
};

pub const DEFAULT_FIELD_MANAGER: &str = "crossplane-diff";

const ENVIRONMENT_CONFIG_API_VERSION: &str = "apiextensions.crossplane.io/v1beta1";
const ENVIRONMENT_CONFIG_KIND: &str = "EnvironmentConfig";

pub async fn get_kube_client() -> anyhow::Result<Client> {
    Client::try_default().await.context("creating Kubernetes client from default config")
}

pub struct KubeClusterClient {
    client: Client,
    discovery: Discovery,
    field_manager: String,
    cache: PipelineCache,
}

impl KubeClusterClient {
    /// Connect with the default kubeconfig and snapshot API discovery.
    pub async fn connect(field_manager: &str) -> anyhow::Result<Self> {
        let client = get_kube_client().await?;
        Self::with_client(client, field_manager).await
    }

    pub async fn with_client(client: Client, field_manager: &str) -> anyhow::Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        Ok(Self { client, discovery, field_manager: field_manager.to_string(), cache: PipelineCache::new() })
    }

    fn api_for(&self, gvk: &Gvk, namespace: Option<&str>) -> ClusterResult<Api<DynamicObject>> {
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = self.discovery.resolve_gvk(&kgvk).ok_or_else(|| ClusterError::UnknownResource(gvk.clone()))?;
        let api = match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }

    async fn list_with(&self, gvk: &Gvk, namespace: Option<&str>, lp: &ListParams) -> ClusterResult<Vec<Resource>> {
        counter!("cluster_list_total", 1u64);
        let api = self.api_for(gvk, namespace)?;
        let list = api.list(lp).await.map_err(|e| ClusterError::kube(format!("list {}", gvk), e))?;
        list.items.into_iter().map(|o| to_resource(o, gvk)).collect()
    }
}

/// Convert a dynamic object, restoring apiVersion/kind that list responses may omit.
fn to_resource(obj: DynamicObject, gvk: &Gvk) -> ClusterResult<Resource> {
    let mut v = serde_json::to_value(&obj).map_err(|e| ClusterError::Decode { what: format!("{}", gvk), source: e.into() })?;
    if let Some(root) = v.as_object_mut() {
        root.entry("apiVersion").or_insert_with(|| Json::String(gvk.api_version()));
        root.entry("kind").or_insert_with(|| Json::String(gvk.kind.clone()));
    }
    Resource::from_json(v).map_err(|source| ClusterError::Decode { what: format!("{}", gvk), source })
}

/// Drop server-owned fields an apply patch must not carry.
fn apply_payload(resource: &Resource) -> Json {
    let mut v = resource.as_json().clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("creationTimestamp");
    }
    if let Some(root) = v.as_object_mut() {
        root.remove("status");
    }
    v
}

#[async_trait]
impl ResourceGetter for KubeClusterClient {
    async fn get_resource(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> ClusterResult<Resource> {
        counter!("cluster_get_total", 1u64);
        let api = self.api_for(gvk, namespace)?;
        match api.get_opt(name).await {
            Ok(Some(obj)) => to_resource(obj, gvk),
            Ok(None) => Err(ClusterError::NotFound { gvk: gvk.clone(), name: name.to_string() }),
            Err(e) => Err(ClusterError::kube(format!("get {} {}", gvk, name), e)),
        }
    }
}

#[async_trait]
impl ResourceLister for KubeClusterClient {
    async fn get_resources_by_label(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<Resource>> {
        let sel = label_selector(selector);
        debug!(gvk = %gvk, selector = %sel, "listing by label");
        self.list_with(gvk, namespace, &ListParams::default().labels(&sel)).await
    }

    async fn list_resources(&self, gvk: &Gvk, namespace: Option<&str>) -> ClusterResult<Vec<Resource>> {
        self.list_with(gvk, namespace, &ListParams::default()).await
    }
}

#[async_trait]
impl DryRunApplier for KubeClusterClient {
    async fn dry_run_apply(&self, resource: &Resource) -> ClusterResult<Resource> {
        counter!("cluster_dry_run_total", 1u64);
        let gvk = resource.gvk();
        let name = resource.name().ok_or_else(|| ClusterError::Decode {
            what: format!("{} for dry-run apply", gvk),
            source: anyhow!("resource has no metadata.name"),
        })?;
        let api = self.api_for(&gvk, resource.namespace())?;
        let pp = PatchParams::apply(&self.field_manager).dry_run().force();
        let obj = api
            .patch(name, &pp, &Patch::Apply(&apply_payload(resource)))
            .await
            .map_err(|e| ClusterError::kube(format!("dry-run apply {}/{}", gvk.kind, name), e))?;
        to_resource(obj, &gvk)
    }
}

#[async_trait]
impl CompositionSource for KubeClusterClient {
    async fn initialize(&self) -> ClusterResult<()> {
        let comp_gvk = Gvk::from_api_version(COMPOSITION_API_VERSION, COMPOSITION_KIND);
        let fn_gvk = Gvk::from_api_version(FUNCTION_API_VERSION, FUNCTION_KIND);
        let compositions = self.list_resources(&comp_gvk, None).await?;
        let functions = self.list_resources(&fn_gvk, None).await?;
        info!(compositions = compositions.len(), functions = functions.len(), "cluster client initialized");
        self.cache.load(compositions, functions)
    }

    fn find_matching_composition(&self, xr: &Resource) -> ClusterResult<Composition> {
        self.cache.find_matching_composition(xr)
    }

    fn get_functions_from_pipeline(&self, composition: &Composition) -> ClusterResult<Vec<Function>> {
        self.cache.get_functions_from_pipeline(composition)
    }
}

#[async_trait]
impl DefinitionSource for KubeClusterClient {
    async fn get_crds(&self) -> ClusterResult<Vec<Resource>> {
        counter!("cluster_list_total", 1u64);
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::kube("list CustomResourceDefinitions", e))?;
        let mut out = Vec::with_capacity(crds.items.len());
        for crd in crds {
            let mut v = serde_json::to_value(&crd)
                .map_err(|e| ClusterError::Decode { what: "CustomResourceDefinition".into(), source: e.into() })?;
            if let Some(root) = v.as_object_mut() {
                root.insert("apiVersion".into(), Json::String("apiextensions.k8s.io/v1".into()));
                root.insert("kind".into(), Json::String("CustomResourceDefinition".into()));
            }
            out.push(Resource::from_json(v).map_err(|source| ClusterError::Decode { what: "CustomResourceDefinition".into(), source })?);
        }
        Ok(out)
    }

    async fn get_environment_configs(&self) -> ClusterResult<Vec<Resource>> {
        let gvk = Gvk::from_api_version(ENVIRONMENT_CONFIG_API_VERSION, ENVIRONMENT_CONFIG_KIND);
        match self.list_resources(&gvk, None).await {
            Err(ClusterError::UnknownResource(_)) => {
                debug!("EnvironmentConfig API not served; continuing without environment configs");
                Ok(Vec::new())
            }
            other => other,
        }
    }
}
