//! Per-resource diffs for one rendered composite.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use tracing::debug;
use xpdiff_core::{Resource, ResourceKey};
use xpdiff_diff::{generate_diff, ResourceDiff};
use xpdiff_kubehub::ClusterClient;

use crate::render::RenderOutput;
use crate::resource_manager::{ensure_uid, update_owner_refs, ResourceManager};

pub struct DiffCalculator<C: ?Sized> {
    client: Arc<C>,
    manager: ResourceManager<C>,
}

impl<C: ClusterClient + ?Sized> DiffCalculator<C> {
    pub fn new(client: Arc<C>) -> Self {
        let manager = ResourceManager::new(client.clone());
        Self { client, manager }
    }

    pub fn resource_manager(&self) -> &ResourceManager<C> { &self.manager }

    /// Diff one desired resource against its live counterpart.
    ///
    /// Existing objects are compared with the dry-run result of applying `desired`,
    /// so server-side defaults do not show up as changes.
    pub async fn calculate_diff(&self, composite: Option<&Resource>, desired: &Resource) -> Result<ResourceDiff> {
        let current = self.manager.fetch_current_object(composite, desired).await?;
        let mut desired = desired.clone();
        if let Some(cur) = &current {
            if desired.name().is_none() {
                if let Some(n) = cur.name() {
                    desired.set_name(n);
                }
            }
        }
        update_owner_refs(composite, &mut desired);

        let wanted = match &current {
            Some(_) => self
                .client
                .dry_run_apply(&desired)
                .await
                .with_context(|| format!("cannot dry-run apply {}/{}", desired.kind(), desired.display_name()))?,
            None => desired,
        };
        generate_diff(current.as_ref(), Some(&wanted))
    }

    /// Diffs for the XR, each composed resource, and every live child the render no longer produces.
    pub async fn calculate_diffs(&self, xr: &Resource, output: &RenderOutput) -> Result<BTreeMap<String, ResourceDiff>> {
        let mut diffs = BTreeMap::new();
        let desired_xr = output.composite.as_ref().unwrap_or(xr);

        let xr_diff = self
            .calculate_diff(None, desired_xr)
            .await
            .with_context(|| format!("cannot calculate diff for {}/{}", desired_xr.kind(), desired_xr.display_name()))?;
        let live_xr = xr_diff.current.is_some();
        let mut parent = xr_diff.current.clone().unwrap_or_else(|| desired_xr.clone());
        ensure_uid(&mut parent);
        diffs.insert(xr_diff.key(), xr_diff);

        let mut matched: FxHashSet<ResourceKey> = FxHashSet::default();
        for composed in &output.composed {
            let d = self
                .calculate_diff(Some(&parent), composed)
                .await
                .with_context(|| format!("cannot calculate diff for {}/{}", composed.kind(), composed.display_name()))?;
            if let Some(cur) = &d.current {
                matched.insert(cur.key());
            }
            diffs.insert(d.key(), d);
        }

        if live_xr {
            let children = self
                .manager
                .find_existing_children(&parent)
                .await
                .context("cannot find existing composed resources")?;
            for child in children.iter().filter(|c| !matched.contains(&c.key())) {
                debug!(resource = %child.key(), "live resource no longer rendered");
                let d = generate_diff(Some(child), None)?;
                diffs.insert(d.key(), d);
            }
        }
        Ok(diffs)
    }
}
