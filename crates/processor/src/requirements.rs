//! Resolves pipeline requirements to concrete cluster resources, with a per-run cache.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use xpdiff_core::{Requirements, Resource, ResourceKey, ResourceMatch, ResourceSelector};
use xpdiff_kubehub::ClusterClient;

pub struct RequirementsProvider<C: ?Sized> {
    client: Arc<C>,
    /// Environment configs, kept across `clear_cache`.
    environment: RwLock<Vec<Resource>>,
    cache: RwLock<FxHashMap<ResourceKey, Resource>>,
    /// Name lookups the cluster answered with not-found.
    missing: RwLock<FxHashSet<ResourceKey>>,
}

impl<C: ClusterClient + ?Sized> RequirementsProvider<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            environment: RwLock::new(Vec::new()),
            cache: RwLock::new(FxHashMap::default()),
            missing: RwLock::new(FxHashSet::default()),
        }
    }

    /// Load every environment config and seed the cache with them.
    pub async fn initialize(&self) -> Result<()> {
        let envs = self.client.get_environment_configs().await.context("cannot list environment configs")?;
        *self.environment.write().unwrap_or_else(|p| p.into_inner()) = envs;
        self.clear_cache();
        debug!(cached = self.cached(), "requirements cache seeded");
        Ok(())
    }

    /// Drop everything fetched so far; environment configs stay cached.
    pub fn clear_cache(&self) {
        let envs = self.environment.read().unwrap_or_else(|p| p.into_inner());
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.clear();
        for e in envs.iter() {
            cache.insert(e.key(), e.clone());
        }
        self.missing.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn cached(&self) -> usize { self.cache.read().unwrap_or_else(|p| p.into_inner()).len() }

    fn lookup(&self, key: &ResourceKey) -> Option<Resource> {
        self.cache.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    fn remember(&self, r: &Resource) {
        self.missing.write().unwrap_or_else(|p| p.into_inner()).remove(&r.key());
        self.cache.write().unwrap_or_else(|p| p.into_inner()).insert(r.key(), r.clone());
    }

    fn known_missing(&self, key: &ResourceKey) -> bool {
        self.missing.read().unwrap_or_else(|p| p.into_inner()).contains(key)
    }

    async fn resolve(&self, sel: &ResourceSelector) -> Result<Vec<Resource>> {
        let gvk = sel.gvk();
        let ns = sel.namespace.as_deref();
        match &sel.matcher {
            ResourceMatch::Name(name) => {
                let key = ResourceKey::new(&sel.api_version, &sel.kind, name);
                if let Some(hit) = self.lookup(&key) {
                    counter!("requirements_cache_hits_total", 1u64);
                    debug!(resource = %key, "requirement served from cache");
                    return Ok(vec![hit]);
                }
                if self.known_missing(&key) {
                    counter!("requirements_cache_hits_total", 1u64);
                    debug!(resource = %key, "required resource known to be absent");
                    return Ok(Vec::new());
                }
                counter!("requirements_cache_misses_total", 1u64);
                match self.client.get_resource(&gvk, ns, name).await {
                    Ok(r) => {
                        self.remember(&r);
                        Ok(vec![r])
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(resource = %key, "required resource does not exist");
                        self.missing.write().unwrap_or_else(|p| p.into_inner()).insert(key);
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e).with_context(|| format!("cannot get required resource {}", sel)),
                }
            }
            ResourceMatch::Labels(labels) => {
                let found = self
                    .client
                    .get_resources_by_label(&gvk, ns, labels)
                    .await
                    .with_context(|| format!("cannot list required resources {}", sel))?;
                for r in &found {
                    self.remember(r);
                }
                Ok(found)
            }
        }
    }

    /// Fetch every resource named by `requirements`, deduplicated by identity.
    ///
    /// Fails without partial results if any lookup fails.
    pub async fn provide_requirements(&self, requirements: &BTreeMap<String, Requirements>) -> Result<Vec<Resource>> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        for (step, reqs) in requirements {
            for (name, sel) in &reqs.resources {
                let found = self
                    .resolve(sel)
                    .await
                    .with_context(|| format!("cannot resolve requirement {} of step {}", name, step))?;
                for r in found {
                    if seen.insert(r.key()) {
                        out.push(r);
                    }
                }
            }
        }
        debug!(resources = out.len(), "requirements resolved");
        Ok(out)
    }
}
