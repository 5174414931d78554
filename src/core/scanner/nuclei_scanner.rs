// src/core/scanner/nuclei_scanner.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::executor::{Executor, format_command};
use crate::core::models::{HostState, ModuleKind, ModuleStatus, Profile};
use crate::core::state::{mark_finished, mark_running, write_json};

const SEVERITY_BUCKETS: &[&str] = &["critical", "high", "medium", "low", "info"];

/// One nuclei finding distilled from a line of JSONL output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub template_id: Option<String>,
    pub name: Option<String>,
    pub matched_at: Option<String>,
}

pub type FindingsRollup = BTreeMap<String, Vec<Finding>>;

/// Rolls nuclei's line-delimited JSON results into severity buckets. All five
/// standard buckets are always present; unparseable lines are dropped.
pub fn rollup_findings(results_path: &Path) -> Result<FindingsRollup> {
    let mut findings: FindingsRollup = SEVERITY_BUCKETS
        .iter()
        .map(|bucket| (bucket.to_string(), Vec::new()))
        .collect();
    if !results_path.exists() {
        return Ok(findings);
    }
    for line in fs::read_to_string(results_path)?.lines() {
        let Ok(data) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let severity = data
            .get("severity")
            .and_then(Value::as_str)
            .unwrap_or("info")
            .to_string();
        let as_string =
            |value: &Value| value.as_str().map(str::to_string);
        findings.entry(severity).or_default().push(Finding {
            template_id: data.get("template-id").and_then(|v| as_string(v)),
            name: data
                .get("info")
                .and_then(|info| info.get("name"))
                .and_then(|v| as_string(v)),
            matched_at: data.get("matched-at").and_then(|v| as_string(v)),
        });
    }
    Ok(findings)
}

/// Runs nuclei against the derived URL list with the profile's severity
/// filter, then buckets the JSONL results into `nuclei/findings.json`.
pub async fn run_nuclei(
    host_dir: &Path,
    host: &str,
    urls: &[String],
    profile: Profile,
    executor: &Executor,
    timeout_s: u64,
    resume: bool,
) -> Result<()> {
    let state_path = host_dir.join("state.json");
    let mut state = HostState::load(&state_path, host, host)?;
    let module_name = ModuleKind::Nuclei.to_string();
    state.reconcile_interrupted(&module_name, &state_path)?;

    if resume && state.module_status(&module_name) == ModuleStatus::Ok {
        info!(host, "nuclei already OK, resuming from disk.");
        return Ok(());
    }

    let nuclei_dir = host_dir.join("nuclei");
    fs::create_dir_all(&nuclei_dir)?;
    let urls_path = host_dir.join("web").join("urls.txt");
    if let Some(parent) = urls_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&urls_path, urls.join("\n"))?;

    let results_path = nuclei_dir.join("results.jsonl");
    let stdout_path = nuclei_dir.join("stdout.log");
    let stderr_path = nuclei_dir.join("stderr.log");
    let command: Vec<String> = vec![
        "nuclei".into(),
        "-l".into(),
        urls_path.display().to_string(),
        "-jsonl".into(),
        "-o".into(),
        results_path.display().to_string(),
        "-rate-limit".into(),
        "10".into(),
        "-severity".into(),
        profile.severity_filter().into(),
    ];
    mark_running(
        state.module_mut(&module_name),
        &format_command(&command),
        &stdout_path,
        &stderr_path,
    );
    state.save(&state_path)?;

    debug!(host, profile = %profile, "Running nuclei.");
    executor.run(&command, &stdout_path, &stderr_path, timeout_s).await?;

    let findings = rollup_findings(&results_path)?;
    write_json(&nuclei_dir.join("findings.json"), &findings)?;
    mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, Some(0), None);
    state.save(&state_path)?;
    info!(
        host,
        findings = findings.values().map(Vec::len).sum::<usize>(),
        "nuclei stage finished."
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn buckets_findings_by_severity_and_drops_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let lines = [
            r#"{"template-id":"tls-version","severity":"low","info":{"name":"TLS Version"},"matched-at":"https://h:443"}"#,
            r#"{"template-id":"exposed-panel","severity":"high","info":{"name":"Panel"},"matched-at":"http://h:80/admin"}"#,
            "not json at all",
            r#"{"template-id":"no-severity","info":{"name":"Fallback"}}"#,
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        let findings = rollup_findings(&path).unwrap();
        assert_eq!(findings["high"].len(), 1);
        assert_eq!(findings["low"].len(), 1);
        // Missing severity falls back to info.
        assert_eq!(findings["info"].len(), 1);
        assert_eq!(findings["critical"].len(), 0);
        assert_eq!(
            findings["high"][0].template_id.as_deref(),
            Some("exposed-panel")
        );
    }

    #[test]
    fn missing_results_file_yields_empty_buckets() {
        let findings = rollup_findings(Path::new("/nonexistent/results.jsonl")).unwrap();
        assert_eq!(findings.len(), SEVERITY_BUCKETS.len());
        assert!(findings.values().all(Vec::is_empty));
    }
}
