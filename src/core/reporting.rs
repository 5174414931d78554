// src/core/reporting.rs

//! Engagement-level summary rendering. Stateless with respect to the core:
//! it only reads the per-host terminal artifacts and the collected error
//! list, and it always produces output even when individual stages failed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::models::{EngagementError, Profile, ServiceMap};
use crate::core::state::{now_iso, write_json};

/// The operator inputs echoed into the summary for audit.
#[derive(Debug, Clone, Serialize)]
pub struct RunInputs {
    pub input: String,
    pub fqdn: String,
}

#[derive(Debug, Serialize)]
struct HostSummary {
    host: String,
    open_ports: Vec<u16>,
    tls_ports: Vec<u16>,
    nuclei_findings: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct EngagementSummary<'a> {
    engagement_name: &'a str,
    generated_at: String,
    profile: Profile,
    inputs: &'a RunInputs,
    scan_derived: bool,
    scope_allow_cidrs: &'a [String],
    hosts: Vec<HostSummary>,
    errors: &'a [EngagementError],
}

#[derive(Debug, Deserialize, Default)]
struct TlsSummaryFile {
    #[serde(default)]
    ports: Vec<u16>,
}

fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    fs::read_to_string(path)
        .ok()
        .and_then(|body| serde_json::from_str(&body).ok())
        .unwrap_or_default()
}

fn summarize_host(output_dir: &Path, host: &str) -> HostSummary {
    let host_dir = output_dir.join(host);
    let services: ServiceMap = read_json_or_default(&host_dir.join("services.json"));
    let tls: TlsSummaryFile = read_json_or_default(&host_dir.join("tls").join("tls_summary.json"));
    let findings: BTreeMap<String, Vec<serde_json::Value>> =
        read_json_or_default(&host_dir.join("nuclei").join("findings.json"));

    HostSummary {
        host: host.to_string(),
        open_ports: services.keys().copied().collect(),
        tls_ports: tls.ports,
        nuclei_findings: findings
            .into_iter()
            .map(|(severity, items)| (severity, items.len()))
            .collect(),
    }
}

const CSV_SEVERITIES: &[&str] = &["critical", "high", "medium", "low", "info"];

fn render_csv(hosts: &[HostSummary]) -> String {
    let mut lines = vec![
        "host,open_ports,tls_ports,nuclei_critical,nuclei_high,nuclei_medium,nuclei_low,nuclei_info"
            .to_string(),
    ];
    for entry in hosts {
        let join_ports = |ports: &[u16]| {
            ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(";")
        };
        let counts = CSV_SEVERITIES
            .iter()
            .map(|severity| {
                entry
                    .nuclei_findings
                    .get(*severity)
                    .copied()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!(
            "{},{},{},{}",
            entry.host,
            join_ports(&entry.open_ports),
            join_ports(&entry.tls_ports),
            counts
        ));
    }
    lines.join("\n")
}

fn render_markdown(summary: &EngagementSummary<'_>) -> String {
    let mut lines = vec![
        format!("# Engagement Summary: {}", summary.engagement_name),
        String::new(),
        format!("Generated: {}", summary.generated_at),
        format!("Profile: {}", summary.profile),
        format!("Scan Derived: {}", summary.scan_derived),
        format!(
            "Scope Allow CIDRs: {}",
            if summary.scope_allow_cidrs.is_empty() {
                "None".to_string()
            } else {
                summary.scope_allow_cidrs.join(", ")
            }
        ),
        String::new(),
        "## Hosts".to_string(),
    ];
    for entry in &summary.hosts {
        lines.push(format!(
            "- {} | Open Ports: {:?} | TLS Ports: {:?}",
            entry.host, entry.open_ports, entry.tls_ports
        ));
    }
    if !summary.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors/Skips".to_string());
        for error in summary.errors {
            match &error.host {
                Some(host) => lines.push(format!("- {} [{}]: {}", error.module, host, error.message)),
                None => lines.push(format!("- {}: {}", error.module, error.message)),
            }
        }
    }
    lines.join("\n")
}

/// Renders the engagement summary in JSON, CSV, and Markdown under
/// `<engagement>/summary/`, plus the aggregated error list.
#[allow(clippy::too_many_arguments)]
pub fn build_summary(
    output_dir: &Path,
    engagement_name: &str,
    profile: Profile,
    inputs: &RunInputs,
    scan_derived: bool,
    scope_allow_cidrs: &[String],
    hosts: &[String],
    errors: &[EngagementError],
) -> Result<()> {
    let summary_dir = output_dir.join("summary");
    fs::create_dir_all(&summary_dir)?;

    let summary = EngagementSummary {
        engagement_name,
        generated_at: now_iso(),
        profile,
        inputs,
        scan_derived,
        scope_allow_cidrs,
        hosts: hosts
            .iter()
            .map(|host| summarize_host(output_dir, host))
            .collect(),
        errors,
    };

    write_json(&summary_dir.join("summary.json"), &summary)?;
    write_json(&summary_dir.join("errors.json"), &errors)?;
    fs::write(summary_dir.join("summary.csv"), render_csv(&summary.hosts))?;
    fs::write(summary_dir.join("summary.md"), render_markdown(&summary))?;
    info!(hosts = summary.hosts.len(), errors = errors.len(), "Summary written.");
    Ok(())
}
