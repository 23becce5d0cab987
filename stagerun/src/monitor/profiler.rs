//! Profiler subprocess attached to a running worker.

use crate::jobinfo::ProfileMode;
use crate::sys::{self, Signal};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Placeholder replaced with the worker pid.
pub const PID_PLACEHOLDER: &str = "__PID__";
/// Placeholder replaced with the profile output path.
pub const OUTPUT_PLACEHOLDER: &str = "__OUTPUT__";

/// Command templates keyed by profile mode.
#[must_use]
pub fn default_profilers() -> BTreeMap<String, Vec<String>> {
    let argv = |parts: &[&str]| parts.iter().map(ToString::to_string).collect::<Vec<_>>();
    BTreeMap::from([
        (
            "perf".to_string(),
            argv(&["perf", "record", "-g", "-F", "200", "-p", PID_PLACEHOLDER, "-o", OUTPUT_PLACEHOLDER]),
        ),
        (
            "cpu".to_string(),
            argv(&["py-spy", "record", "--pid", PID_PLACEHOLDER, "--output", OUTPUT_PLACEHOLDER]),
        ),
        (
            "mem".to_string(),
            argv(&["heaptrack", "-p", PID_PLACEHOLDER, "-o", OUTPUT_PLACEHOLDER]),
        ),
    ])
}

/// A started profiler.
#[derive(Debug)]
pub struct Profiler {
    child: Child,
    pid: Option<u32>,
}

impl Profiler {
    /// Starts the profiler for `mode` against `worker_pid`, if one is configured.
    ///
    /// The profile is written to `_profile.<mode>` under `files_dir`.
    pub fn start(
        mode: &ProfileMode,
        templates: &BTreeMap<String, Vec<String>>,
        worker_pid: u32,
        files_dir: &Path,
    ) -> Option<Self> {
        if !mode.is_enabled() {
            return None;
        }
        let Some(template) = templates.get(mode.key()) else {
            warn!(mode = mode.key(), "no profiler configured for profile mode");
            return None;
        };
        let output = files_dir.join(format!("_profile.{}", mode.key()));
        let argv: Vec<String> = template
            .iter()
            .map(|arg| {
                arg.replace(PID_PLACEHOLDER, &worker_pid.to_string())
                    .replace(OUTPUT_PLACEHOLDER, &output.display().to_string())
            })
            .collect();
        let (program, args) = argv.split_first()?;
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                let pid = child.id();
                debug!(mode = mode.key(), pid, "profiler started");
                Some(Self { child, pid })
            }
            Err(e) => {
                warn!(mode = mode.key(), error = %e, "could not start profiler");
                None
            }
        }
    }

    /// Pid of the profiler, excluded from the worker's usage.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Interrupts the profiler so it flushes, killing it after `grace`.
    pub async fn stop(mut self, grace: Duration) {
        if let Some(pid) = self.pid {
            if let Err(e) = sys::send_signal(pid, Signal::Interrupt) {
                debug!(pid, error = %e, "profiler already gone");
            }
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}
