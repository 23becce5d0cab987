//! Pipeline supervisor entry point.
//!
//! Runs one call graph to completion in a run directory. Restarting with the
//! same run directory resumes the run from its on-disk state.

use anyhow::Context;
use clap::Parser;
use stagerun::config::{RetryFile, RuntimeConfig};
use stagerun::jobinfo::ProfileMode;
use stagerun::node::CallGraph;
use stagerun::observability::{init_logging, LogFormat};
use stagerun::signals::SignalRegistry;
use stagerun::supervisor::{job_manager, Supervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Runs a pipeline.
#[derive(Parser, Debug)]
#[command(name = "stagerun", version, about = "Runs a split/chunk/join stage pipeline")]
struct Cli {
    /// JSON call graph.
    graph: PathBuf,

    /// Run directory holding metadata and the journal.
    run_dir: PathBuf,

    /// JSON runtime configuration.
    #[arg(long, env = "STAGERUN_CONFIG")]
    config: Option<PathBuf>,

    /// JSON retry policy merged into the configuration.
    #[arg(long, env = "STAGERUN_RETRY_FILE")]
    retry_file: Option<PathBuf>,

    /// Log line format, overriding the configuration.
    #[arg(long, env = "STAGERUN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Log filter used when `RUST_LOG` is unset, overriding the configuration.
    #[arg(long, env = "STAGERUN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Serve the state query interface on this address.
    #[arg(long)]
    ui_bind: Option<String>,

    /// Enforce memory and thread quotas on every job.
    #[arg(long)]
    monitor: bool,

    /// Profiler to attach to every job (cpu, mem, perf or a configured name).
    #[arg(long)]
    profile: Option<ProfileMode>,
}

fn load_config(cli: &Cli) -> anyhow::Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(path) = &cli.retry_file {
        config.apply_retry_file(&RetryFile::from_file(path)?);
    }
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
    if cli.monitor {
        config.monitor.enforce = true;
    }
    if let Some(mode) = &cli.profile {
        config.monitor.profile_mode = mode.clone();
    }
    if let Some(bind) = &cli.ui_bind {
        config.ui.enabled = true;
        config.ui.bind.clone_from(bind);
    }
    Ok(config)
}

fn load_graph(path: &Path) -> anyhow::Result<CallGraph> {
    let bytes = std::fs::read(path).with_context(|| format!("reading call graph {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing call graph {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(config.log_format, &config.log_level)?;

    let graph = load_graph(&cli.graph)?;
    let signals = Arc::new(SignalRegistry::default());
    let jm = job_manager(&config, &signals);
    let ui = config.ui.clone();
    let mut supervisor = Supervisor::new(&graph, &cli.run_dir, jm, config, Arc::clone(&signals))?;
    info!(run_id = %supervisor.run_id(), run = %graph.name, "starting run");

    #[cfg(feature = "ui")]
    let server = if ui.enabled {
        Some(stagerun::ui::UiServer::start(&ui, supervisor.snapshots().clone()).await?)
    } else {
        None
    };
    #[cfg(not(feature = "ui"))]
    if ui.enabled {
        tracing::warn!("built without the ui feature; state interface disabled");
    }

    let code = tokio::select! {
        outcome = supervisor.run() => {
            for failure in &outcome.failures {
                eprintln!(
                    "[error] {} failed:\n{}\n\nFull error: {}",
                    failure.fqname,
                    failure.message.trim_end(),
                    failure.error_path.display()
                );
            }
            signals.shutdown(outcome.exit_reason()).await
        }
        signal = SignalRegistry::wait_for_signal() => {
            let reason = signal.context("installing signal handlers")?;
            error!(reason = %reason, "stopping run");
            signals.shutdown(reason).await
        }
    };

    #[cfg(feature = "ui")]
    if let Some(server) = server {
        server.stop().await;
    }
    std::process::exit(code);
}
