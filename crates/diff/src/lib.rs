//! xpdiff diff: normalization, canonical serialization and per-resource line diffs.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use similar::{ChangeTag, TextDiff};
use xpdiff_core::{Gvk, Resource, ANNOTATION_COMPOSITION_RESOURCE_NAME};

mod renderer;

pub use renderer::{DiffOptions, DiffRenderer};

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Remove server-populated fields so they never show up as changes.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
        meta.remove("selfLink");
        if let Some(annos) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            annos.remove(LAST_APPLIED_ANNOTATION);
        }
        for key in ["annotations", "labels"] {
            if meta.get(key).and_then(|m| m.as_object()).map_or(false, |m| m.is_empty()) {
                meta.remove(key);
            }
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn to_sorted_yaml(v: &Json) -> serde_yaml::Value {
    match v {
        Json::Null => serde_yaml::Value::Null,
        Json::Bool(b) => serde_yaml::Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_yaml::Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                serde_yaml::Value::Number(u.into())
            } else {
                serde_yaml::Value::Number(n.as_f64().unwrap_or_default().into())
            }
        }
        Json::String(s) => serde_yaml::Value::String(s.clone()),
        Json::Array(a) => serde_yaml::Value::Sequence(a.iter().map(to_sorted_yaml).collect()),
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = serde_yaml::Mapping::new();
            for k in keys {
                out.insert(serde_yaml::Value::String(k.clone()), to_sorted_yaml(&m[k]));
            }
            serde_yaml::Value::Mapping(out)
        }
    }
}

/// YAML with keys sorted at every level, so field order never produces a diff.
pub fn canonical_yaml(v: &Json) -> Result<String> {
    serde_yaml::to_string(&to_sorted_yaml(v)).context("serializing resource to YAML")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffType {
    Added,
    Removed,
    Modified,
    Equal,
}

impl DiffType {
    /// Three-character header prefix; `Equal` diffs are never printed.
    pub fn symbol(&self) -> &'static str {
        match self {
            DiffType::Added => "+++",
            DiffType::Removed => "---",
            DiffType::Modified => "~~~",
            DiffType::Equal => "===",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineOp {
    Equal,
    Insert,
    Delete,
}

/// A run of consecutive lines sharing one operation. `text` keeps its newlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiff {
    pub op: LineOp,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub gvk: Gvk,
    /// Display name (`prefix(generated)` for unnamed resources).
    pub name: String,
    pub diff_type: DiffType,
    pub line_diffs: Vec<LineDiff>,
    pub current: Option<Resource>,
    pub desired: Option<Resource>,
}

impl ResourceDiff {
    /// `apiVersion/kind/name`; unique within one run.
    ///
    /// Resources still waiting for a server-generated name share their prefix, so
    /// their composition resource name is appended.
    pub fn key(&self) -> String {
        let base = format!("{}/{}/{}", self.gvk.api_version(), self.gvk.kind, self.name);
        match self.template() {
            Some(t) => format!("{}#{}", base, t),
            None => base,
        }
    }

    /// Composition resource name of a desired object that has no name yet.
    fn template(&self) -> Option<&str> {
        let desired = self.desired.as_ref()?;
        if desired.name().is_some() || self.current.is_some() {
            return None;
        }
        desired.annotation(ANNOTATION_COMPOSITION_RESOURCE_NAME)
    }

    /// `Kind/name`, the ordering key for rendered output. Unnamed resources also
    /// show their composition resource name, e.g. `Bucket/my-xr-(generated) [bucket-a]`.
    pub fn display_name(&self) -> String {
        match self.template() {
            Some(t) => format!("{}/{} [{}]", self.gvk.kind, self.name, t),
            None => format!("{}/{}", self.gvk.kind, self.name),
        }
    }

    pub fn has_changes(&self) -> bool { self.diff_type != DiffType::Equal }
}

/// Count of non-equal diffs by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

impl DiffSummary {
    pub fn record(&mut self, t: DiffType) {
        match t {
            DiffType::Added => self.added += 1,
            DiffType::Modified => self.modified += 1,
            DiffType::Removed => self.removed += 1,
            DiffType::Equal => {}
        }
    }

    pub fn total(&self) -> usize { self.added + self.modified + self.removed }
}

/// Group similar's per-line changes into spans.
pub fn line_diffs(old: &str, new: &str) -> Vec<LineDiff> {
    let diff = TextDiff::from_lines(old, new);
    let mut out: Vec<LineDiff> = Vec::new();
    for change in diff.iter_all_changes() {
        let op = match change.tag() {
            ChangeTag::Equal => LineOp::Equal,
            ChangeTag::Insert => LineOp::Insert,
            ChangeTag::Delete => LineOp::Delete,
        };
        let mut line = change.value().to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        match out.last_mut() {
            Some(last) if last.op == op => last.text.push_str(&line),
            _ => out.push(LineDiff { op, text: line }),
        }
    }
    out
}

/// Compare the live object (if any) with the desired one (if any).
///
/// Both sides are normalized and canonicalized first; `Equal` means the texts match.
pub fn generate_diff(current: Option<&Resource>, desired: Option<&Resource>) -> Result<ResourceDiff> {
    let reference = desired.or(current).ok_or_else(|| anyhow!("cannot diff: neither current nor desired resource given"))?;
    let gvk = reference.gvk();
    let name = match (desired, current) {
        (Some(d), Some(c)) if d.name().is_none() => c.display_name(),
        _ => reference.display_name(),
    };

    let render = |r: Option<&Resource>| -> Result<String> {
        match r {
            Some(r) => canonical_yaml(&strip_noisy(r.as_json().clone())),
            None => Ok(String::new()),
        }
    };
    let old = render(current)?;
    let new = render(desired)?;

    let diff_type = match (current, desired) {
        (None, Some(_)) => DiffType::Added,
        (Some(_), None) => DiffType::Removed,
        _ if old == new => DiffType::Equal,
        _ => DiffType::Modified,
    };

    Ok(ResourceDiff {
        gvk,
        name,
        diff_type,
        line_diffs: line_diffs(&old, &new),
        current: current.cloned(),
        desired: desired.cloned(),
    })
}
