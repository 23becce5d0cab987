//! Job monitor entry point.
//!
//! Job managers launch one monitor per job:
//! `stagerun-monitor <stage command...> <split|main|join> <metadata_path> <files_path> <journal_prefix>`.
//! The monitor supervises the worker, reports the outcome through the
//! metadata store and exits with the outcome's exit code.

use anyhow::Context;
use clap::Parser;
use stagerun::metadata::MetadataFile;
use stagerun::monitor::{Monitor, MonitorArgs, MonitorConfig};
use stagerun::observability::{init_logging, LogFormat};
use stagerun::signals::SignalRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Supervises one stage job.
#[derive(Parser, Debug)]
#[command(name = "stagerun-monitor", version, about = "Supervises one stage job")]
struct Cli {
    /// JSON monitor configuration.
    #[arg(long, env = "STAGERUN_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log line format.
    #[arg(long, default_value = "pretty", env = "STAGERUN_LOG_FORMAT")]
    log_format: LogFormat,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "STAGERUN_LOG_LEVEL")]
    log_level: String,

    /// Worker command, then mode, metadata path, files path and journal prefix.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    job: Vec<String>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MonitorConfig> {
    let Some(path) = path else {
        return Ok(MonitorConfig::default());
    };
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading monitor config {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing monitor config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    let config = load_config(cli.config.as_ref())?;
    let args = MonitorArgs::parse(&cli.job)?;
    let metadata = args.metadata()?;
    let signals = Arc::new(SignalRegistry::default());
    let monitor = Monitor::new(args, config, Arc::clone(&signals))?;

    let code = tokio::select! {
        outcome = monitor.run() => {
            info!(outcome = ?outcome, "job monitor finished");
            outcome.exit_code()
        }
        signal = SignalRegistry::wait_for_signal() => {
            let reason = signal.context("installing signal handlers")?;
            error!(reason = %reason, "job monitor stopping");
            let code = signals.shutdown(reason).await;
            if let Err(e) = metadata.write_raw(MetadataFile::Errors, &format!("Job monitor {reason}")) {
                error!(error = %e, "could not record the interruption");
            }
            metadata.update_journal(MetadataFile::Errors);
            code
        }
    };
    std::process::exit(code);
}
