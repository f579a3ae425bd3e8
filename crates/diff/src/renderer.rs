//! Human-readable rendering of a diff set.

use std::io::Write;

use anyhow::{Context, Result};
use nu_ansi_term::Color;

use crate::{DiffSummary, DiffType, LineOp, ResourceDiff};

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub use_colors: bool,
    /// Show only `context_lines` of unchanged text around each change.
    pub compact: bool,
    pub context_lines: usize,
    pub add_prefix: String,
    pub delete_prefix: String,
    pub context_prefix: String,
    pub chunk_separator: String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            use_colors: true,
            compact: false,
            context_lines: 3,
            add_prefix: "+ ".into(),
            delete_prefix: "- ".into(),
            context_prefix: "  ".into(),
            chunk_separator: "...".into(),
        }
    }
}

pub struct DiffRenderer {
    opts: DiffOptions,
}

impl DiffRenderer {
    pub fn new(opts: DiffOptions) -> Self { Self { opts } }

    fn paint(&self, color: Color, s: &str) -> String {
        if self.opts.use_colors { color.paint(s).to_string() } else { s.to_string() }
    }

    fn line(&self, op: LineOp, text: &str) -> String {
        match op {
            LineOp::Insert => self.paint(Color::Green, &format!("{}{}", self.opts.add_prefix, text)),
            LineOp::Delete => self.paint(Color::Red, &format!("{}{}", self.opts.delete_prefix, text)),
            LineOp::Equal => format!("{}{}", self.opts.context_prefix, text),
        }
    }

    /// Body of one resource diff, one output line per input line, without the header.
    pub fn format_body(&self, diff: &ResourceDiff) -> String {
        let lines: Vec<(LineOp, &str)> = diff
            .line_diffs
            .iter()
            .flat_map(|span| span.text.lines().map(move |l| (span.op, l)))
            .collect();

        let keep: Vec<bool> = if self.opts.compact && diff.diff_type == DiffType::Modified {
            let n = self.opts.context_lines;
            let mut keep = vec![false; lines.len()];
            for (i, (op, _)) in lines.iter().enumerate() {
                if *op != LineOp::Equal {
                    let lo = i.saturating_sub(n);
                    let hi = (i + n).min(lines.len().saturating_sub(1));
                    for k in keep.iter_mut().take(hi + 1).skip(lo) {
                        *k = true;
                    }
                }
            }
            keep
        } else {
            vec![true; lines.len()]
        };

        let mut out = String::new();
        let mut skipped = false;
        for (i, (op, text)) in lines.iter().enumerate() {
            if !keep[i] {
                skipped = true;
                continue;
            }
            if skipped {
                out.push_str(&self.opts.chunk_separator);
                out.push('\n');
                skipped = false;
            }
            out.push_str(&self.line(*op, text));
            out.push('\n');
        }
        if skipped {
            out.push_str(&self.opts.chunk_separator);
            out.push('\n');
        }
        out
    }

    /// Write every non-equal diff, sorted by `Kind/name`, then a summary line.
    ///
    /// Writes nothing at all when every diff is `Equal`.
    pub fn render_diffs<'a, W, I>(&self, w: &mut W, diffs: I) -> Result<DiffSummary>
    where
        W: Write + ?Sized,
        I: IntoIterator<Item = &'a ResourceDiff>,
    {
        let mut sorted: Vec<&ResourceDiff> = diffs.into_iter().filter(|d| d.has_changes()).collect();
        sorted.sort_by(|a, b| a.display_name().cmp(&b.display_name()).then_with(|| a.key().cmp(&b.key())));

        let mut summary = DiffSummary::default();
        for d in sorted {
            let color = match d.diff_type {
                DiffType::Added => Color::Green,
                DiffType::Removed => Color::Red,
                _ => Color::Yellow,
            };
            let header = self.paint(color, &format!("{} {}", d.diff_type.symbol(), d.display_name()));
            write!(w, "{}\n{}\n", header, self.format_body(d)).context("writing diff output")?;
            summary.record(d.diff_type);
        }

        if summary.total() > 0 {
            let mut parts = Vec::new();
            if summary.added > 0 {
                parts.push(format!("{} added", summary.added));
            }
            if summary.modified > 0 {
                parts.push(format!("{} modified", summary.modified));
            }
            if summary.removed > 0 {
                parts.push(format!("{} removed", summary.removed));
            }
            writeln!(w, "Summary: {}", parts.join(", ")).context("writing diff summary")?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{generate_diff, line_diffs};
    use serde_json::json;
    use std::collections::HashMap;
    use xpdiff_core::{Gvk, Resource};

    fn plain() -> DiffRenderer { DiffRenderer::new(DiffOptions { use_colors: false, ..Default::default() }) }

    fn diff(kind: &str, name: &str, t: DiffType) -> ResourceDiff {
        ResourceDiff {
            gvk: Gvk::new("example.org", "v1", kind),
            name: name.into(),
            diff_type: t,
            line_diffs: line_diffs("a: 1\n", "a: 2\n"),
            current: None,
            desired: None,
        }
    }

    #[test]
    fn output_is_sorted_by_kind_and_name() {
        let mut map = HashMap::new();
        for d in [
            diff("Zeta", "a", DiffType::Added),
            diff("Alpha", "b", DiffType::Modified),
            diff("Alpha", "a", DiffType::Removed),
            diff("Mid", "x", DiffType::Modified),
        ] {
            map.insert(d.key(), d);
        }
        let mut out = Vec::new();
        plain().render_diffs(&mut out, map.values()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let headers: Vec<&str> = text.lines().filter(|l| l.starts_with("+++") || l.starts_with("---") || l.starts_with("~~~")).collect();
        assert_eq!(headers, vec!["--- Alpha/a", "~~~ Alpha/b", "~~~ Mid/x", "+++ Zeta/a"]);
        assert!(text.ends_with("Summary: 1 added, 2 modified, 1 removed\n"), "{}", text);
    }

    #[test]
    fn equal_only_sets_render_nothing() {
        let d = diff("Alpha", "a", DiffType::Equal);
        let mut out = Vec::new();
        let summary = plain().render_diffs(&mut out, [&d]).unwrap();
        assert!(out.is_empty());
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn added_resources_show_every_line_as_insert() {
        let r = Resource::from_json(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" } })).unwrap();
        let d = generate_diff(None, Some(&r)).unwrap();
        let mut out = Vec::new();
        plain().render_diffs(&mut out, [&d]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("+++ ConfigMap/c\n+ apiVersion: v1\n+ kind: ConfigMap\n+ metadata:\n+   name: c\n"), "{}", text);
        assert!(text.ends_with("Summary: 1 added\n"));
    }

    #[test]
    fn compact_mode_elides_distant_context() {
        let old: String = (0..20).map(|i| format!("k{}: {}\n", i, i)).collect();
        let new = old.replace("k10: 10", "k10: ten");
        let d = ResourceDiff {
            gvk: Gvk::new("", "v1", "ConfigMap"),
            name: "c".into(),
            diff_type: DiffType::Modified,
            line_diffs: line_diffs(&old, &new),
            current: None,
            desired: None,
        };
        let r = DiffRenderer::new(DiffOptions { use_colors: false, compact: true, context_lines: 1, ..Default::default() });
        let body = r.format_body(&d);
        assert_eq!(body, "...\n  k9: 9\n- k10: 10\n+ k10: ten\n  k11: 11\n...\n");
    }

    #[test]
    fn colors_wrap_changed_lines() {
        let r = DiffRenderer::new(DiffOptions::default());
        let body = r.format_body(&diff("A", "a", DiffType::Modified));
        assert!(body.contains("\u{1b}[32m+ a: 2"), "{:?}", body);
        assert!(body.contains("\u{1b}[31m- a: 1"), "{:?}", body);
    }
}
