// src/core/executor.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Structured result of one external command execution. The engine never
/// interprets tool-specific exit codes beyond "did it time out".
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub timed_out: bool,
}

/// Shell-quoted rendering of an argument vector, recorded in module state for
/// operator audit.
pub fn format_command(command: &[String]) -> String {
    command
        .iter()
        .map(|item| {
            let plain = item
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
            if plain && !item.is_empty() {
                item.clone()
            } else {
                format!("'{}'", item.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs external scanning tools behind a shared counting admission gate.
///
/// The gate bounds how many subprocesses execute at any instant across all
/// hosts and modules, independently of host-level parallelism. It is passed
/// in explicitly so its lifetime (one per engagement invocation) stays
/// visible and tests can substitute a gate of capacity 1.
#[derive(Debug, Clone)]
pub struct Executor {
    gate: Arc<Semaphore>,
}

impl Executor {
    pub fn new(max_procs: usize) -> Self {
        Self { gate: Arc::new(Semaphore::new(max_procs)) }
    }

    /// Executes `command`, streaming stdout/stderr to the given capture files,
    /// killing the subprocess once `timeout_s` elapses.
    ///
    /// The admission permit is held from just before spawn until the process
    /// has exited, and is released on every path including timeout (permit is
    /// a guard, dropped on scope exit).
    pub async fn run(
        &self,
        command: &[String],
        stdout_path: &Path,
        stderr_path: &Path,
        timeout_s: u64,
    ) -> Result<CommandOutcome> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| eyre!("Empty command vector"))?;
        for path in [stdout_path, stderr_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("Cannot create {}", parent.display()))?;
            }
        }

        let _permit = self
            .gate
            .acquire()
            .await
            .wrap_err("Subprocess admission gate closed")?;

        let stdout_file = fs::File::create(stdout_path)
            .wrap_err_with(|| format!("Cannot create {}", stdout_path.display()))?;
        let stderr_file = fs::File::create(stderr_path)
            .wrap_err_with(|| format!("Cannot create {}", stderr_path.display()))?;

        debug!(command = %format_command(command), timeout_s, "Spawning external command.");
        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {program}"))?;

        let mut timed_out = false;
        let mut exit_code = None;
        match timeout(Duration::from_secs(timeout_s), child.wait()).await {
            Ok(status) => {
                exit_code = status
                    .wrap_err_with(|| format!("Failed waiting on {program}"))?
                    .code();
            }
            Err(_) => {
                warn!(command = %format_command(command), timeout_s, "Command exceeded its budget, killing.");
                timed_out = true;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        let duration = start.elapsed();
        info!(
            command = %format_command(command),
            exit_code = ?exit_code,
            timed_out,
            duration_s = duration.as_secs_f64(),
            "External command finished."
        );
        Ok(CommandOutcome {
            command: command.to_vec(),
            exit_code,
            duration,
            stdout_path: stdout_path.to_path_buf(),
            stderr_path: stderr_path.to_path_buf(),
            timed_out,
        })
    }
}

/// Static PATH-availability map for every tool the engine may drive, probed
/// once per engagement and consulted by each stage's skip decision.
#[derive(Debug, Clone, Default)]
pub struct ToolInventory {
    tools: BTreeMap<String, Option<PathBuf>>,
}

/// Everything the engine may invoke, scanners and subdomain enumerators alike.
pub const PROBED_TOOLS: &[&str] = &[
    "nmap", "sslscan", "ffuf", "nuclei", "subfinder", "assetfinder", "amass", "dnsx", "massdns",
];

impl ToolInventory {
    pub fn detect() -> Self {
        let tools = PROBED_TOOLS
            .iter()
            .map(|name| (name.to_string(), which::which(name).ok()))
            .collect();
        Self { tools }
    }

    /// Inventory with a fixed available set; the seam the pipeline tests use
    /// to simulate missing tools.
    pub fn from_available(names: &[&str]) -> Self {
        let tools = PROBED_TOOLS
            .iter()
            .map(|name| {
                let path = names
                    .contains(name)
                    .then(|| PathBuf::from(format!("/usr/bin/{name}")));
                (name.to_string(), path)
            })
            .collect();
        Self { tools }
    }

    pub fn available(&self, name: &str) -> bool {
        matches!(self.tools.get(name), Some(Some(_)))
    }

    /// One `name: path-or-missing` line per tool, for `_meta/tool_versions.txt`.
    pub fn render(&self) -> String {
        self.tools
            .iter()
            .map(|(name, path)| match path {
                Some(path) => format!("{name}: {}", path.display()),
                None => format!("{name}: missing"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
