//! Finding the live counterparts of rendered resources.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};
use uuid::Uuid;
use xpdiff_core::{Gvk, Resource, ANNOTATION_COMPOSITION_RESOURCE_NAME, LABEL_COMPOSITE};
use xpdiff_kubehub::ClusterClient;

pub struct ResourceManager<C: ?Sized> {
    client: Arc<C>,
}

impl<C: ClusterClient + ?Sized> ResourceManager<C> {
    pub fn new(client: Arc<C>) -> Self { Self { client } }

    /// The live object `desired` corresponds to, or `None` when it would be created.
    ///
    /// `composite` is the owning XR; pass `None` when `desired` is the XR itself.
    pub async fn fetch_current_object(&self, composite: Option<&Resource>, desired: &Resource) -> Result<Option<Resource>> {
        let gvk = desired.gvk();
        if let Some(name) = desired.name() {
            return match self.client.get_resource(&gvk, desired.namespace(), name).await {
                Ok(r) => Ok(Some(r)),
                Err(e) if e.is_not_found() => {
                    debug!(resource = %desired.key(), "no live object; treating as new");
                    Ok(None)
                }
                Err(e) => Err(e).with_context(|| format!("cannot get current object {}/{}", desired.kind(), name)),
            };
        }

        let (Some(prefix), Some(xr)) = (desired.generate_name(), composite) else {
            return Ok(None);
        };
        let Some(xr_name) = xr.name() else { return Ok(None) };
        let Some(template) = desired.annotation(ANNOTATION_COMPOSITION_RESOURCE_NAME) else {
            debug!(resource = %desired.display_name(), "generateName resource without composition resource name; treating as new");
            return Ok(None);
        };

        let selector = BTreeMap::from([(LABEL_COMPOSITE.to_string(), xr_name.to_string())]);
        let candidates = match self.client.get_resources_by_label(&gvk, desired.namespace(), &selector).await {
            Ok(c) => c,
            Err(e) => {
                counter!("resource_lookup_degraded_total", 1u64);
                warn!(resource = %desired.display_name(), composite = xr_name, error = %e, "label lookup failed; treating resource as new");
                return Ok(None);
            }
        };

        let mut matches: Vec<Resource> = candidates
            .into_iter()
            .filter(|c| c.annotation(ANNOTATION_COMPOSITION_RESOURCE_NAME) == Some(template))
            .filter(|c| c.name().map_or(false, |n| n.starts_with(prefix)))
            .collect();
        match matches.len() {
            0 => {
                debug!(resource = %desired.display_name(), template, "no live object with matching prefix; treating as new");
                Ok(None)
            }
            1 => Ok(matches.pop()),
            n => {
                warn!(resource = %desired.display_name(), template, candidates = n, "ambiguous live objects; treating resource as new");
                Ok(None)
            }
        }
    }

    /// Live composed resources of `composite`, found through its resource refs and the composite label.
    pub async fn find_existing_children(&self, composite: &Resource) -> Result<Vec<Resource>> {
        let Some(xr_name) = composite.name() else { return Ok(Vec::new()) };
        let refs = composite
            .pointer("/spec/resourceRefs")
            .or_else(|| composite.pointer("/spec/crossplane/resourceRefs"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut kinds: Vec<Gvk> = Vec::new();
        for r in &refs {
            let av = r.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
            let kind = r.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if av.is_empty() || kind.is_empty() {
                continue;
            }
            let gvk = Gvk::from_api_version(av, kind);
            if let Some(name) = r.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
                let ns = r.get("namespace").and_then(|v| v.as_str()).or(composite.namespace());
                match self.client.get_resource(&gvk, ns, name).await {
                    Ok(child) => {
                        if seen.insert(child.key()) {
                            out.push(child);
                        }
                    }
                    Err(e) if e.is_not_found() => debug!(kind, name, "referenced resource is gone"),
                    Err(e) => return Err(e).with_context(|| format!("cannot get composed resource {}/{}", kind, name)),
                }
            }
            if !kinds.contains(&gvk) {
                kinds.push(gvk);
            }
        }

        let selector = BTreeMap::from([(LABEL_COMPOSITE.to_string(), xr_name.to_string())]);
        for gvk in &kinds {
            let listed = self
                .client
                .get_resources_by_label(gvk, None, &selector)
                .await
                .with_context(|| format!("cannot list composed resources of kind {}", gvk.kind))?;
            for child in listed {
                if seen.insert(child.key()) {
                    out.push(child);
                }
            }
        }
        debug!(composite = xr_name, children = out.len(), "found existing children");
        Ok(out)
    }
}

/// Give a composite that does not exist yet a stable stand-in UID, so every
/// composed resource of one render points at the same owner.
pub fn ensure_uid(parent: &mut Resource) {
    if parent.uid().map_or(false, |u| !u.is_empty()) {
        return;
    }
    let id = format!("{}/{}/{}/{}", parent.api_version(), parent.kind(), parent.namespace().unwrap_or(""), parent.display_name());
    let uid = Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).to_string();
    parent.set_uid(&uid);
}

/// Stamp `parent`'s UID into the owner references of `child` that point at it.
///
/// References to other owners that lack a UID get a random one, never the parent's.
pub fn update_owner_refs(parent: Option<&Resource>, child: &mut Resource) {
    let mut refs = child.owner_references();
    if refs.is_empty() {
        return;
    }
    let parent_uid = parent.and_then(|p| p.uid()).unwrap_or("");
    for r in refs.iter_mut() {
        let points_at_parent = parent.map_or(false, |p| {
            r.api_version == p.api_version()
                && r.kind == p.kind()
                && Some(r.name.as_str()) == p.name()
                && (r.uid.is_empty() || r.uid == parent_uid)
        });
        if points_at_parent && !parent_uid.is_empty() {
            r.uid = parent_uid.to_string();
        } else if r.uid.is_empty() {
            let mut uid = Uuid::new_v4().to_string();
            while uid == parent_uid {
                uid = Uuid::new_v4().to_string();
            }
            r.uid = uid;
        }
    }
    child.set_owner_references(&refs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xpdiff_core::OwnerReference;

    fn parent() -> Resource {
        Resource::from_json(json!({
            "apiVersion": "example.org/v1",
            "kind": "XR1",
            "metadata": { "name": "my-xr", "uid": "parent-uid" }
        }))
        .unwrap()
    }

    fn owner(kind: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference { api_version: "example.org/v1".into(), kind: kind.into(), name: name.into(), uid: uid.into(), ..Default::default() }
    }

    #[test]
    fn owner_refs_get_parent_uid_and_others_get_random() {
        let mut child = Resource::new("v1", "ConfigMap");
        child.set_owner_references(&[owner("XR1", "my-xr", ""), owner("Other", "x", "")]);
        update_owner_refs(Some(&parent()), &mut child);
        let refs = child.owner_references();
        assert_eq!(refs[0].uid, "parent-uid");
        assert!(!refs[1].uid.is_empty());
        assert_ne!(refs[1].uid, "parent-uid");
    }

    #[test]
    fn existing_uids_on_other_owners_are_kept() {
        let mut child = Resource::new("v1", "ConfigMap");
        child.set_owner_references(&[owner("Other", "x", "keep-me")]);
        update_owner_refs(Some(&parent()), &mut child);
        assert_eq!(child.owner_references()[0].uid, "keep-me");
    }

    #[test]
    fn new_composite_gets_one_uid_for_all_children() {
        let mut xr = Resource::from_json(json!({ "apiVersion": "example.org/v1", "kind": "XR1", "metadata": { "name": "my-xr" } })).unwrap();
        ensure_uid(&mut xr);
        let uid = xr.uid().unwrap().to_string();
        assert!(!uid.is_empty());

        let mut again = xr.clone();
        ensure_uid(&mut again);
        assert_eq!(again.uid(), Some(uid.as_str()));

        let mut a = Resource::new("v1", "ConfigMap");
        let mut b = Resource::new("v1", "Secret");
        a.set_owner_references(&[owner("XR1", "my-xr", "")]);
        b.set_owner_references(&[owner("XR1", "my-xr", "")]);
        update_owner_refs(Some(&xr), &mut a);
        update_owner_refs(Some(&xr), &mut b);
        assert_eq!(a.owner_references()[0].uid, uid);
        assert_eq!(b.owner_references()[0].uid, uid);
    }

    #[test]
    fn live_uid_is_left_alone() {
        let mut xr = parent();
        ensure_uid(&mut xr);
        assert_eq!(xr.uid(), Some("parent-uid"));
    }

    #[test]
    fn without_parent_missing_uids_are_filled() {
        let mut child = Resource::new("v1", "ConfigMap");
        child.set_owner_references(&[owner("XR1", "my-xr", "")]);
        update_owner_refs(None, &mut child);
        assert!(!child.owner_references()[0].uid.is_empty());
    }
}
