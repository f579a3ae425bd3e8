//! xpdiff kubehub: cluster access facade.
//!
//! Reads go through small capability traits so that callers (and their test
//! doubles) only depend on what they use. `KubeClusterClient` implements all of
//! them on top of kube-rs; `testing::FakeCluster` is an in-memory stand-in.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use xpdiff_core::{Composition, Function, Gvk, Resource};

mod cache;
mod kube_client;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::PipelineCache;
pub use kube_client::{get_kube_client, KubeClusterClient, DEFAULT_FIELD_MANAGER};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{gvk} {name:?} not found")]
    NotFound { gvk: Gvk, name: String },
    #[error("no composition found for {0}")]
    NoComposition(Gvk),
    #[error("function {function:?} referenced in pipeline step {step:?} not found")]
    FunctionNotFound { function: String, step: String },
    #[error("number of GVKs ({gvks}) does not match number of selectors ({selectors})")]
    CountMismatch { gvks: usize, selectors: usize },
    #[error("cannot {op}")]
    Kube {
        op: String,
        #[source]
        source: kube::Error,
    },
    #[error("cannot resolve API resource for {0}")]
    UnknownResource(Gvk),
    #[error("cannot decode {what}")]
    Decode {
        what: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("cluster client is not initialized")]
    NotInitialized,
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound { .. }) }

    pub(crate) fn kube(op: impl Into<String>, source: kube::Error) -> Self {
        ClusterError::Kube { op: op.into(), source }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Point lookups.
#[async_trait]
pub trait ResourceGetter: Send + Sync {
    /// Fetch one object; absence is `ClusterError::NotFound`.
    async fn get_resource(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> ClusterResult<Resource>;
}

/// List and label-selector lookups.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn get_resources_by_label(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<Resource>>;

    async fn list_resources(&self, gvk: &Gvk, namespace: Option<&str>) -> ClusterResult<Vec<Resource>>;

    /// Batched label lookup. `gvks` and `selectors` pair up by position; a length
    /// mismatch fails before any request is made.
    async fn get_all_resources_by_labels(
        &self,
        gvks: &[Gvk],
        selectors: &[BTreeMap<String, String>],
    ) -> ClusterResult<Vec<Resource>> {
        if gvks.len() != selectors.len() {
            return Err(ClusterError::CountMismatch { gvks: gvks.len(), selectors: selectors.len() });
        }
        let mut out = Vec::new();
        for (gvk, sel) in gvks.iter().zip(selectors) {
            out.extend(self.get_resources_by_label(gvk, None, sel).await?);
        }
        Ok(out)
    }
}

/// Non-persisting server-side apply.
#[async_trait]
pub trait DryRunApplier: Send + Sync {
    /// Returns what the live object would become if `resource` were applied.
    async fn dry_run_apply(&self, resource: &Resource) -> ClusterResult<Resource>;
}

/// Composition and function metadata, cached once per run.
#[async_trait]
pub trait CompositionSource: Send + Sync {
    /// Load every composition and function; replaces the cache only on success.
    async fn initialize(&self) -> ClusterResult<()>;
    fn find_matching_composition(&self, xr: &Resource) -> ClusterResult<Composition>;
    /// Empty for compositions that are not in pipeline mode.
    fn get_functions_from_pipeline(&self, composition: &Composition) -> ClusterResult<Vec<Function>>;
}

/// Definitions and configuration objects consulted before rendering.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn get_crds(&self) -> ClusterResult<Vec<Resource>>;
    async fn get_environment_configs(&self) -> ClusterResult<Vec<Resource>>;
}

/// Everything the diff pipeline needs from a cluster.
pub trait ClusterClient: ResourceGetter + ResourceLister + DryRunApplier + CompositionSource + DefinitionSource {}

impl<T> ClusterClient for T where T: ResourceGetter + ResourceLister + DryRunApplier + CompositionSource + DefinitionSource {}
