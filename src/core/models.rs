// src/core/models.rs

use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::Display;

// --- Module Lifecycle ---

/// Canonical names of the pipeline modules. The string form of each variant
/// is the key used in the persisted `modules` map, so renaming a variant is a
/// state-format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum)]
#[strum(serialize_all = "snake_case")]
pub enum ModuleKind {
    #[value(name = "domain_recon")]
    DomainRecon,
    Nmap,
    Sslscan,
    Ffuf,
    Nuclei,
}

/// Lifecycle status of one (host, module) pair.
///
/// `Pending` is implicit: a module with no persisted record is pending.
/// `Running` is only ever observed across a process boundary after a crash or
/// kill, and is rewritten to `Interrupted` on the next load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    #[default]
    Pending,
    Running,
    Ok,
    Skipped,
    SkippedMissingTool,
    Timeout,
    Interrupted,
}

impl ModuleStatus {
    /// A terminal status never transitions further within one invocation.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ModuleStatus::Pending | ModuleStatus::Running)
    }
}

/// One resumable lifecycle record for a (host, module) pair.
///
/// The `command` field holds the exact external invocation for operator audit,
/// recorded before the subprocess is spawned so a hard kill still leaves an
/// honest `RUNNING` marker behind.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModuleState {
    pub status: ModuleStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_code: Option<i32>,
    pub command: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// Per-host (or per-domain) state: the unit of resumability.
///
/// Loaded at the start of every module execution, mutated, saved back. The
/// load-mutate-save cycle is the sole persistence contract; no in-memory copy
/// outlives a process run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostState {
    pub engagement_name: String,
    pub host: String,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleState>,
}

// --- Scan Artifacts ---

/// Service metadata for one open TCP port, as reported by nmap.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tunnel: String,
}

/// Discovered open ports with service metadata; the nmap stage's terminal
/// artifact and the input for every downstream stage.
pub type ServiceMap = BTreeMap<u16, ServiceInfo>;

/// Derived facts for one domain after the recon stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainReconResult {
    pub fqdn: String,
    pub wildcard_detected: bool,
    pub resolved: BTreeMap<String, Vec<String>>,
    pub derived_ips: Vec<String>,
}

// --- Engagement-Level Reporting ---

/// A non-fatal problem surfaced in the engagement error log instead of being
/// thrown past the host-pipeline boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementError {
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

impl EngagementError {
    pub fn new(module: &str, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            host: None,
            message: message.into(),
            items: Vec::new(),
        }
    }

    pub fn for_host(module: &str, host: &str, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            host: Some(host.to_string()),
            message: message.into(),
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }
}

// --- Operator Choices ---

/// Scan profile: each step up strictly widens the nuclei severity set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Safe,
    Standard,
    Aggressive,
}

impl Profile {
    /// Comma-separated severity list handed to nuclei's `-severity` flag.
    pub fn severity_filter(&self) -> &'static str {
        match self {
            Profile::Safe => "critical,high,medium",
            Profile::Standard => "critical,high,medium,low",
            Profile::Aggressive => "critical,high,medium,low,info",
        }
    }
}

/// Which subdomain enumeration chains the domain recon stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, ValueEnum, Default)]
#[strum(serialize_all = "lowercase")]
pub enum SubdomainMode {
    #[default]
    Passive,
    Active,
    Both,
}

impl SubdomainMode {
    pub fn wants_passive(&self) -> bool {
        matches!(self, SubdomainMode::Passive | SubdomainMode::Both)
    }

    pub fn wants_active(&self) -> bool {
        matches!(self, SubdomainMode::Active | SubdomainMode::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_status_round_trips_screaming_snake() {
        let json = serde_json::to_string(&ModuleStatus::SkippedMissingTool).unwrap();
        assert_eq!(json, "\"SKIPPED_MISSING_TOOL\"");
        let back: ModuleStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ModuleStatus::SkippedMissingTool);
    }

    #[test]
    fn terminal_statuses_exclude_pending_and_running() {
        assert!(!ModuleStatus::Pending.is_terminal());
        assert!(!ModuleStatus::Running.is_terminal());
        assert!(ModuleStatus::Ok.is_terminal());
        assert!(ModuleStatus::Timeout.is_terminal());
        assert!(ModuleStatus::Interrupted.is_terminal());
    }

    #[test]
    fn profile_severity_sets_strictly_widen() {
        let safe = Profile::Safe.severity_filter();
        let standard = Profile::Standard.severity_filter();
        let aggressive = Profile::Aggressive.severity_filter();
        assert!(standard.starts_with(safe));
        assert!(aggressive.starts_with(standard));
    }

    #[test]
    fn module_kind_display_matches_state_keys() {
        assert_eq!(ModuleKind::DomainRecon.to_string(), "domain_recon");
        assert_eq!(ModuleKind::Sslscan.to_string(), "sslscan");
    }
}
