// src/core/scanner/mod.rs

//! The per-host scan pipeline: nmap → sslscan → ffuf → nuclei, each stage a
//! resumable module consulting the state machine and the tool inventory
//! before doing anything.

pub mod domain_recon;
pub mod ffuf_scanner;
pub mod nmap_scanner;
pub mod nuclei_scanner;
pub mod ssl_scanner;

use std::fs;
use std::path::Path;

use color_eyre::eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::core::models::{EngagementError, HostState, ModuleKind, ModuleStatus, ServiceMap};
use crate::core::orchestrator::Engagement;
use crate::core::state::mark_finished;

/// Reads the persisted `services.json` artifact, if a prior run produced one.
/// Lets an `--only` restriction on a downstream module reuse nmap's evidence
/// without re-running it.
fn load_persisted_services(host_dir: &Path) -> Result<ServiceMap> {
    let path = host_dir.join("services.json");
    if !path.exists() {
        return Ok(ServiceMap::new());
    }
    let body = fs::read_to_string(&path)
        .wrap_err_with(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&body).wrap_err_with(|| format!("Corrupt {}", path.display()))
}

/// Records an operator skip or a missing tool for `kind`: distinct statuses,
/// both non-fatal, both surfaced in the engagement error log.
fn record_skip(
    engagement: &Engagement,
    state: &mut HostState,
    state_path: &Path,
    kind: ModuleKind,
    host: &str,
    tool_missing: bool,
) -> Result<()> {
    let status = if tool_missing {
        ModuleStatus::SkippedMissingTool
    } else {
        ModuleStatus::Skipped
    };
    let module_name = kind.to_string();
    let reason = if tool_missing {
        format!("{module_name} missing from PATH")
    } else {
        format!("{module_name} skipped by operator")
    };
    mark_finished(state.module_mut(&module_name), status, None, Some(&reason));
    state.save(state_path)?;
    engagement
        .errors
        .push(EngagementError::for_host(&module_name, host, status.to_string()));
    Ok(())
}

/// Drives the fixed module sequence for one host. Modules execute strictly
/// sequentially; each persists its terminal state before the next starts.
/// Errors escaping a stage are caught at the host-pipeline boundary by the
/// orchestrator, never aborting sibling hosts.
pub async fn run_host_pipeline(engagement: &Engagement, host: &str) -> Result<()> {
    let host_dir = engagement.output_dir.join(host);
    fs::create_dir_all(&host_dir)
        .wrap_err_with(|| format!("Cannot create {}", host_dir.display()))?;
    let state_path = host_dir.join("state.json");
    let mut state = HostState::load(&state_path, &engagement.name, host)?;
    state.save(&state_path)?;

    // An `only` restriction makes every other stage return immediately
    // without side effects.
    let gated = |kind: ModuleKind| engagement.only.is_some_and(|only| only != kind);

    // --- nmap ---
    let services: ServiceMap = if gated(ModuleKind::Nmap) {
        load_persisted_services(&host_dir)?
    } else if engagement.skip_nmap || !engagement.tools.available("nmap") {
        // The explicit operator opt-out wins over tool detection.
        record_skip(
            engagement,
            &mut state,
            &state_path,
            ModuleKind::Nmap,
            host,
            !engagement.skip_nmap && !engagement.tools.available("nmap"),
        )?;
        // Without port discovery the rest of the pipeline has nothing to do.
        return Ok(());
    } else {
        nmap_scanner::run_nmap(
            &host_dir,
            host,
            &engagement.executor,
            engagement.timeouts.nmap,
            engagement.resume,
        )
        .await?
    };

    if services.is_empty() {
        // Host down, no open ports, or nmap timed out: a normal terminal
        // outcome for the whole host, downstream modules stay PENDING.
        debug!(host, "Empty service map, stopping pipeline for host.");
        return Ok(());
    }

    // --- sslscan ---
    if !gated(ModuleKind::Sslscan) {
        if !engagement.skip_ssl && engagement.tools.available("sslscan") {
            ssl_scanner::run_sslscan(
                &host_dir,
                host,
                &services,
                &engagement.executor,
                engagement.timeouts.sslscan,
                engagement.resume,
            )
            .await?;
        } else {
            let mut state = HostState::load(&state_path, &engagement.name, host)?;
            record_skip(
                engagement,
                &mut state,
                &state_path,
                ModuleKind::Sslscan,
                host,
                !engagement.skip_ssl && !engagement.tools.available("sslscan"),
            )?;
        }
    }

    let urls = nmap_scanner::derive_web_urls(host, &services);

    // --- ffuf ---
    if !gated(ModuleKind::Ffuf) {
        if !engagement.skip_ffuf && engagement.tools.available("ffuf") {
            ffuf_scanner::run_ffuf(
                &host_dir,
                host,
                &urls,
                &engagement.executor,
                engagement.timeouts.ffuf,
                engagement.resume,
            )
            .await?;
        } else {
            let mut state = HostState::load(&state_path, &engagement.name, host)?;
            record_skip(
                engagement,
                &mut state,
                &state_path,
                ModuleKind::Ffuf,
                host,
                !engagement.skip_ffuf && !engagement.tools.available("ffuf"),
            )?;
        }
    }

    // --- nuclei ---
    if !gated(ModuleKind::Nuclei) {
        if !engagement.skip_nuclei && engagement.tools.available("nuclei") {
            nuclei_scanner::run_nuclei(
                &host_dir,
                host,
                &urls,
                engagement.profile,
                &engagement.executor,
                engagement.timeouts.nuclei,
                engagement.resume,
            )
            .await?;
        } else {
            let mut state = HostState::load(&state_path, &engagement.name, host)?;
            record_skip(
                engagement,
                &mut state,
                &state_path,
                ModuleKind::Nuclei,
                host,
                !engagement.skip_nuclei && !engagement.tools.available("nuclei"),
            )?;
        }
    }

    info!(host, "Host pipeline finished.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{Executor, ToolInventory};
    use crate::core::models::Profile;
    use crate::core::orchestrator::{ErrorLog, Timeouts};
    use tempfile::tempdir;

    fn test_engagement(output_dir: &Path, tools: ToolInventory) -> Engagement {
        Engagement {
            name: "acme".to_string(),
            output_dir: output_dir.to_path_buf(),
            profile: Profile::Safe,
            resume: true,
            only: None,
            skip_nmap: false,
            skip_ssl: false,
            skip_ffuf: false,
            skip_nuclei: false,
            timeouts: Timeouts::default(),
            tools,
            executor: Executor::new(2),
            errors: ErrorLog::default(),
        }
    }

    #[tokio::test]
    async fn missing_nmap_marks_module_and_stops_pipeline() {
        let dir = tempdir().unwrap();
        let engagement = test_engagement(dir.path(), ToolInventory::from_available(&[]));
        run_host_pipeline(&engagement, "192.0.2.10").await.unwrap();

        let state_path = dir.path().join("192.0.2.10").join("state.json");
        let state = HostState::load(&state_path, "acme", "192.0.2.10").unwrap();
        assert_eq!(state.module_status("nmap"), ModuleStatus::SkippedMissingTool);
        // Downstream modules were never touched.
        assert_eq!(state.module_status("sslscan"), ModuleStatus::Pending);
        assert_eq!(state.module_status("ffuf"), ModuleStatus::Pending);
        assert_eq!(state.module_status("nuclei"), ModuleStatus::Pending);

        let errors = engagement.errors.snapshot();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].module, "nmap");
        assert_eq!(errors[0].host.as_deref(), Some("192.0.2.10"));
    }

    #[tokio::test]
    async fn operator_skip_wins_over_missing_tool() {
        let dir = tempdir().unwrap();
        let mut engagement = test_engagement(dir.path(), ToolInventory::from_available(&[]));
        engagement.skip_nmap = true;
        run_host_pipeline(&engagement, "192.0.2.10").await.unwrap();

        let state_path = dir.path().join("192.0.2.10").join("state.json");
        let state = HostState::load(&state_path, "acme", "192.0.2.10").unwrap();
        assert_eq!(state.module_status("nmap"), ModuleStatus::Skipped);

        let errors = engagement.errors.snapshot();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "SKIPPED");
    }

    #[tokio::test]
    async fn resumed_ok_nmap_with_empty_services_short_circuits_downstream() {
        let dir = tempdir().unwrap();
        let host = "192.0.2.10";
        let host_dir = dir.path().join(host);
        fs::create_dir_all(host_dir.join("nmap")).unwrap();

        // Durable evidence: OK status plus terminal artifacts, zero ports.
        let mut state = HostState::new("acme", host);
        mark_finished(state.module_mut("nmap"), ModuleStatus::Ok, Some(0), None);
        state.save(&host_dir.join("state.json")).unwrap();
        fs::write(host_dir.join("nmap").join("followup.xml"), "<nmaprun></nmaprun>").unwrap();
        fs::write(host_dir.join("services.json"), "{}").unwrap();

        let engagement = test_engagement(
            dir.path(),
            ToolInventory::from_available(&["nmap", "sslscan", "ffuf", "nuclei"]),
        );
        run_host_pipeline(&engagement, host).await.unwrap();

        let state = HostState::load(&host_dir.join("state.json"), "acme", host).unwrap();
        assert_eq!(state.module_status("nmap"), ModuleStatus::Ok);
        assert_eq!(state.module_status("sslscan"), ModuleStatus::Pending);
        assert_eq!(state.module_status("ffuf"), ModuleStatus::Pending);
        assert_eq!(state.module_status("nuclei"), ModuleStatus::Pending);
        assert!(engagement.errors.snapshot().is_empty());
    }

    #[tokio::test]
    async fn only_restriction_gates_other_stages_without_side_effects() {
        let dir = tempdir().unwrap();
        let host = "192.0.2.10";
        let mut engagement = test_engagement(dir.path(), ToolInventory::from_available(&[]));
        engagement.only = Some(ModuleKind::Nuclei);
        // No persisted services: nothing to do, but also no skip records.
        run_host_pipeline(&engagement, host).await.unwrap();

        let state_path = dir.path().join(host).join("state.json");
        let state = HostState::load(&state_path, "acme", host).unwrap();
        assert_eq!(state.module_status("nmap"), ModuleStatus::Pending);
        assert_eq!(state.module_status("nuclei"), ModuleStatus::Pending);
        assert!(engagement.errors.snapshot().is_empty());
    }

    #[test]
    fn persisted_services_round_trip() {
        let dir = tempdir().unwrap();
        let host_dir = dir.path().join("192.0.2.10");
        fs::create_dir_all(&host_dir).unwrap();
        fs::write(
            host_dir.join("services.json"),
            r#"{"80":{"name":"http","product":"Apache","version":"2.4","tunnel":""}}"#,
        )
        .unwrap();
        let services = load_persisted_services(&host_dir).unwrap();
        assert_eq!(services[&80].name, "http");
    }
}
