// src/core/state.rs

use std::fs;
use std::path::Path;

use chrono::Utc;
use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::models::{HostState, ModuleState, ModuleStatus};

/// UTC timestamp in the fixed `%Y-%m-%dT%H:%M:%SZ` form used across all
/// persisted state and artifacts.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Writes a value as pretty-printed JSON via a temp file and rename, so a
/// crash mid-write never leaves a truncated state record behind.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Cannot create directory {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, body).wrap_err_with(|| format!("Cannot write {}", tmp.display()))?;
    fs::rename(&tmp, path).wrap_err_with(|| format!("Cannot rename into {}", path.display()))?;
    Ok(())
}

impl HostState {
    pub fn new(engagement_name: &str, host: &str) -> Self {
        Self {
            engagement_name: engagement_name.to_string(),
            host: host.to_string(),
            modules: Default::default(),
        }
    }

    /// Loads persisted state, falling back to a fresh record when the file
    /// does not exist yet. An unreadable or corrupt file is a resource error;
    /// silently starting over would discard resume evidence.
    pub fn load(path: &Path, engagement_name: &str, host: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(engagement_name, host));
        }
        let body = fs::read_to_string(path)
            .wrap_err_with(|| format!("Cannot read state file {}", path.display()))?;
        let state: HostState = serde_json::from_str(&body)
            .wrap_err_with(|| format!("Corrupt state file {}", path.display()))?;
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Returns the module record for `name`, initializing an implicit
    /// `PENDING` record on first touch.
    pub fn module_mut(&mut self, name: &str) -> &mut ModuleState {
        self.modules.entry(name.to_string()).or_default()
    }

    pub fn module_status(&self, name: &str) -> ModuleStatus {
        self.modules
            .get(name)
            .map(|module| module.status)
            .unwrap_or_default()
    }

    /// Crash-recovery rule: a persisted `RUNNING` marker is never trusted as
    /// "still in progress" across process boundaries. Rewrites it to
    /// `INTERRUPTED` and persists before any further decision is made.
    ///
    /// Returns whether a reconcile actually happened.
    pub fn reconcile_interrupted(&mut self, name: &str, path: &Path) -> Result<bool> {
        let host = self.host.clone();
        let module = self.module_mut(name);
        if module.status != ModuleStatus::Running {
            return Ok(false);
        }
        warn!(host = %host, module = name, "Found stale RUNNING marker, rewriting to INTERRUPTED.");
        let exit_code = module.exit_code;
        mark_finished(
            module,
            ModuleStatus::Interrupted,
            exit_code,
            Some("Previous run interrupted"),
        );
        self.save(path)?;
        Ok(true)
    }
}

/// Transition into `RUNNING`, recording the audit command and capture paths.
/// The caller persists the state before spawning the subprocess.
pub fn mark_running(module: &mut ModuleState, command: &str, stdout_path: &Path, stderr_path: &Path) {
    debug!(command, "Module entering RUNNING.");
    module.status = ModuleStatus::Running;
    module.started_at = Some(now_iso());
    module.command = Some(command.to_string());
    module.stdout_path = Some(stdout_path.display().to_string());
    module.stderr_path = Some(stderr_path.display().to_string());
}

/// Terminal transition: records the exit code and, for failure kinds, a
/// human-readable error. `finished_at` is always set.
pub fn mark_finished(
    module: &mut ModuleState,
    status: ModuleStatus,
    exit_code: Option<i32>,
    error: Option<&str>,
) {
    module.status = status;
    module.exit_code = exit_code;
    module.finished_at = Some(now_iso());
    module.error = error.map(str::to_string);
}
