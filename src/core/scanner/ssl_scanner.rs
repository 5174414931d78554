// src/core/scanner/ssl_scanner.rs

use std::fs;
use std::path::Path;

use color_eyre::eyre::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::executor::{Executor, format_command};
use crate::core::models::{HostState, ModuleKind, ModuleStatus, ServiceMap};
use crate::core::state::{mark_finished, mark_running, write_json};

/// Well-known TLS ports. Ports outside this set are still picked up when the
/// service name or tunnel metadata indicates TLS; ambiguous services on other
/// ports can be missed, a known heuristic limit.
const TLS_PORTS: &[u16] = &[443, 464, 465, 587, 636, 990, 993, 995, 8443];

#[derive(Debug, Serialize)]
struct TlsSummary {
    ports: Vec<u16>,
}

/// Selects the ports worth handing to sslscan: the well-known TLS set unioned
/// with anything whose service name or tunnel says ssl/https.
pub fn tls_ports_from_services(services: &ServiceMap) -> Vec<u16> {
    let mut ports: Vec<u16> = services
        .iter()
        .filter(|(port, meta)| {
            let name = meta.name.to_lowercase();
            let tunnel = meta.tunnel.to_lowercase();
            TLS_PORTS.contains(port)
                || name.contains("ssl")
                || name.contains("https")
                || tunnel == "ssl"
        })
        .map(|(port, _)| *port)
        .collect();
    ports.sort_unstable();
    ports
}

/// Runs sslscan once per TLS-flagged port. The stage's completion artifact is
/// the sorted scanned-port list; individual per-port command failures do not
/// fail the stage.
pub async fn run_sslscan(
    host_dir: &Path,
    host: &str,
    services: &ServiceMap,
    executor: &Executor,
    timeout_s: u64,
    resume: bool,
) -> Result<Vec<u16>> {
    let state_path = host_dir.join("state.json");
    let mut state = HostState::load(&state_path, host, host)?;
    let module_name = ModuleKind::Sslscan.to_string();
    state.reconcile_interrupted(&module_name, &state_path)?;

    let tls_dir = host_dir.join("tls");
    fs::create_dir_all(&tls_dir)?;

    let ports = tls_ports_from_services(services);
    if resume && state.module_status(&module_name) == ModuleStatus::Ok {
        info!(host, "sslscan already OK, resuming from disk.");
        return Ok(ports);
    }

    let stdout_path = tls_dir.join("stdout.log");
    let stderr_path = tls_dir.join("stderr.log");
    let audit: Vec<String> = vec!["sslscan".into(), "--no-colour".into(), host.into()];
    mark_running(
        state.module_mut(&module_name),
        &format_command(&audit),
        &stdout_path,
        &stderr_path,
    );
    state.save(&state_path)?;

    for port in &ports {
        debug!(host, port, "Scanning TLS port.");
        let command: Vec<String> =
            vec!["sslscan".into(), "--no-colour".into(), format!("{host}:{port}")];
        executor
            .run(
                &command,
                &tls_dir.join(format!("sslscan_{port}.txt")),
                &tls_dir.join(format!("sslscan_{port}_err.txt")),
                timeout_s,
            )
            .await?;
    }

    write_json(&tls_dir.join("tls_summary.json"), &TlsSummary { ports: ports.clone() })?;
    mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, Some(0), None);
    state.save(&state_path)?;
    info!(host, ports = ports.len(), "sslscan stage finished.");
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ServiceInfo;

    #[test]
    fn unions_well_known_ports_with_service_heuristics() {
        let mut services = ServiceMap::new();
        services.insert(443, ServiceInfo { name: "https".into(), ..Default::default() });
        services.insert(
            4443,
            ServiceInfo { name: "unknown".into(), tunnel: "ssl".into(), ..Default::default() },
        );
        services.insert(993, ServiceInfo { name: "imaps".into(), ..Default::default() });
        services.insert(80, ServiceInfo { name: "http".into(), ..Default::default() });

        assert_eq!(tls_ports_from_services(&services), vec![443, 993, 4443]);
    }

    #[test]
    fn no_tls_candidates_yields_empty_list() {
        let mut services = ServiceMap::new();
        services.insert(22, ServiceInfo { name: "ssh".into(), ..Default::default() });
        assert!(tls_ports_from_services(&services).is_empty());
    }
}
