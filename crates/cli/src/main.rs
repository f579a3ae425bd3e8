use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use tracing::{debug, info};
use xpdiff_core::Resource;
use xpdiff_diff::DiffOptions;
use xpdiff_kubehub::{KubeClusterClient, DEFAULT_FIELD_MANAGER};
use xpdiff_processor::{CrossplaneRenderer, DiffProcessor, ProcessorConfig};

#[derive(Parser, Debug)]
#[command(name = "xpdiff", version, about = "Show what applying composite resources would change in the cluster")]
struct Cli {
    /// YAML files with one or more XRs; `-` reads stdin
    #[arg(value_name = "FILES")]
    files: Vec<PathBuf>,

    /// Namespace for inputs that do not set one
    #[arg(short = 'n', long = "namespace", env = "XPDIFF_NAMESPACE")]
    namespace: Option<String>,

    /// Overall deadline in seconds
    #[arg(long = "timeout", env = "XPDIFF_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    #[arg(long = "no-color", env = "XPDIFF_NO_COLOR", action = ArgAction::SetTrue)]
    no_color: bool,

    /// Only show context lines around changes
    #[arg(long = "compact", action = ArgAction::SetTrue)]
    compact: bool,

    #[arg(long = "context-lines", default_value_t = 3)]
    context_lines: usize,

    /// Render passes per resource when pipelines request more resources
    #[arg(long = "max-render-passes", default_value_t = 2)]
    max_render_passes: usize,

    #[arg(long = "crossplane-bin", env = "XPDIFF_CROSSPLANE_BIN", default_value = "crossplane")]
    crossplane_bin: PathBuf,

    #[arg(long = "field-manager", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,
}

impl Cli {
    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            namespace: self.namespace.clone(),
            max_render_passes: self.max_render_passes,
            diff_options: DiffOptions {
                use_colors: !self.no_color,
                compact: self.compact,
                context_lines: self.context_lines,
                ..Default::default()
            },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("XPDIFF_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("XPDIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid XPDIFF_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse every YAML document in `text`; empty documents are skipped.
fn parse_documents(text: &str, source: &str) -> Result<Vec<Resource>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let v = serde_yaml::Value::deserialize(doc).with_context(|| format!("cannot parse document {} of {}", i + 1, source))?;
        if v.is_null() {
            continue;
        }
        let json = serde_json::to_value(v).with_context(|| format!("cannot convert document {} of {}", i + 1, source))?;
        let r = Resource::from_json(json).with_context(|| format!("document {} of {}", i + 1, source))?;
        if r.api_version().is_empty() || r.kind().is_empty() || r.name().is_none() {
            return Err(anyhow!("document {} of {} needs apiVersion, kind and metadata.name", i + 1, source));
        }
        out.push(r);
    }
    Ok(out)
}

fn load_file(path: &Path) -> Result<Vec<Resource>> {
    let (text, source) = if path == Path::new("-") {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("cannot read stdin")?;
        (s, "stdin".to_string())
    } else {
        let s = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
        (s, path.display().to_string())
    };
    parse_documents(&text, &source)
}

async fn run(cli: &Cli) -> Result<()> {
    let files = if cli.files.is_empty() { vec![PathBuf::from("-")] } else { cli.files.clone() };
    let mut resources = Vec::new();
    for f in &files {
        resources.extend(load_file(f)?);
    }
    if resources.is_empty() {
        return Err(anyhow!("no resources to diff"));
    }
    info!(resources = resources.len(), "loaded input");

    let client = Arc::new(KubeClusterClient::connect(&cli.field_manager).await.context("cannot connect to cluster")?);
    let renderer = Arc::new(CrossplaneRenderer::new(&cli.crossplane_bin));
    let processor = DiffProcessor::new(client, renderer, cli.processor_config());
    processor.initialize().await.context("cannot initialize diff processor")?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = processor.process_all(&mut out, &resources).await?;
    out.flush().context("cannot flush output")?;
    debug!(added = summary.added, modified = summary.modified, removed = summary.removed, "done");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let deadline = Duration::from_secs(cli.timeout);
    let result = match tokio::time::timeout(deadline, run(&cli)).await {
        Ok(r) => r,
        Err(_) => Err(anyhow!("timed out after {}s", cli.timeout)),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xpdiff: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_input_skips_empty_documents() {
        let text = "---\napiVersion: example.org/v1\nkind: XR1\nmetadata:\n  name: a\n---\n---\napiVersion: example.org/v1\nkind: XR1\nmetadata:\n  name: b\n";
        let docs = parse_documents(text, "test").unwrap();
        let names: Vec<_> = docs.iter().filter_map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn documents_without_a_name_are_rejected() {
        let err = parse_documents("apiVersion: v1\nkind: ConfigMap\n", "x.yaml").unwrap_err();
        assert!(err.to_string().contains("document 1 of x.yaml"), "{}", err);
    }

    #[test]
    fn flags_map_onto_processor_config() {
        let cli = Cli::try_parse_from(["xpdiff", "-n", "team-a", "--no-color", "--compact", "--context-lines", "1", "xr.yaml"]).unwrap();
        let cfg = cli.processor_config();
        assert_eq!(cfg.namespace.as_deref(), Some("team-a"));
        assert!(!cfg.diff_options.use_colors);
        assert!(cfg.diff_options.compact);
        assert_eq!(cfg.diff_options.context_lines, 1);
        assert_eq!(cfg.max_render_passes, 2);
        assert_eq!(cli.field_manager, "crossplane-diff");
        assert_eq!(cli.files, vec![PathBuf::from("xr.yaml")]);
    }
}
