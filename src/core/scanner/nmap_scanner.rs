// src/core/scanner/nmap_scanner.rs

use std::fs;
use std::path::Path;

use color_eyre::eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::core::executor::{Executor, format_command};
use crate::core::models::{HostState, ModuleKind, ModuleStatus, ServiceInfo, ServiceMap};
use crate::core::state::{mark_finished, mark_running, write_json};

/// Parses open TCP ports with service metadata out of an nmap XML report.
/// A missing file yields an empty map; malformed XML is an error.
pub fn parse_nmap_xml_ports(path: &Path) -> Result<ServiceMap> {
    let mut services = ServiceMap::new();
    if !path.exists() {
        return Ok(services);
    }
    let body = fs::read_to_string(path)
        .wrap_err_with(|| format!("Cannot read nmap XML {}", path.display()))?;
    let doc = roxmltree::Document::parse(&body)
        .wrap_err_with(|| format!("Malformed nmap XML {}", path.display()))?;

    for host in doc.descendants().filter(|n| n.has_tag_name("host")) {
        let down = host
            .children()
            .find(|n| n.has_tag_name("status"))
            .is_some_and(|status| status.attribute("state") == Some("down"));
        if down {
            continue;
        }
        let Some(ports) = host.children().find(|n| n.has_tag_name("ports")) else {
            continue;
        };
        for port in ports.children().filter(|n| n.has_tag_name("port")) {
            if port.attribute("protocol") != Some("tcp") {
                continue;
            }
            let open = port
                .children()
                .find(|n| n.has_tag_name("state"))
                .is_some_and(|state| state.attribute("state") == Some("open"));
            if !open {
                continue;
            }
            let Some(port_id) = port.attribute("portid").and_then(|v| v.parse::<u16>().ok())
            else {
                continue;
            };
            let service = port.children().find(|n| n.has_tag_name("service"));
            let attr = |name: &str| {
                service
                    .and_then(|s| s.attribute(name))
                    .unwrap_or_default()
                    .to_string()
            };
            services.insert(
                port_id,
                ServiceInfo {
                    name: attr("name"),
                    product: attr("product"),
                    version: attr("version"),
                    tunnel: attr("tunnel"),
                },
            );
        }
    }
    Ok(services)
}

/// True when the nmap report marks the host as down.
pub fn host_is_down(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let body = fs::read_to_string(path)
        .wrap_err_with(|| format!("Cannot read nmap XML {}", path.display()))?;
    let doc = roxmltree::Document::parse(&body)
        .wrap_err_with(|| format!("Malformed nmap XML {}", path.display()))?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("status"))
        .any(|status| status.attribute("state") == Some("down")))
}

/// Derives ffuf/nuclei scan URLs from discovered services. Scheme is inferred
/// from the service name, falling back to the tunnel metadata; non-web
/// services contribute nothing.
pub fn derive_web_urls(host: &str, services: &ServiceMap) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for (port, meta) in services {
        let name = meta.name.to_lowercase();
        let tunnel = meta.tunnel.to_lowercase();
        let scheme = if name.contains("http") {
            if name.contains("https") || tunnel == "ssl" { "https" } else { "http" }
        } else if name == "ssl" || tunnel == "ssl" {
            "https"
        } else {
            continue;
        };
        urls.push(format!("{scheme}://{host}:{port}/"));
    }
    urls.sort();
    urls.dedup();
    urls
}

/// Runs the nmap module for one host: a fast service triage scan, then a
/// heavier follow-up against exactly the discovered open ports. The follow-up
/// result supersedes the triage result and `services.json` is the stage's
/// terminal artifact.
pub async fn run_nmap(
    host_dir: &Path,
    host: &str,
    executor: &Executor,
    timeout_s: u64,
    resume: bool,
) -> Result<ServiceMap> {
    let state_path = host_dir.join("state.json");
    let mut state = HostState::load(&state_path, host, host)?;
    let module_name = ModuleKind::Nmap.to_string();
    state.reconcile_interrupted(&module_name, &state_path)?;

    let nmap_dir = host_dir.join("nmap");
    let triage_xml = nmap_dir.join("triage.xml");
    let followup_xml = nmap_dir.join("followup.xml");

    if resume && state.module_status(&module_name) == ModuleStatus::Ok && followup_xml.exists() {
        info!(host, "nmap already OK with artifact present, resuming from disk.");
        return parse_nmap_xml_ports(&followup_xml);
    }

    fs::create_dir_all(&nmap_dir)?;
    let stdout_path = nmap_dir.join("stdout.log");
    let stderr_path = nmap_dir.join("stderr.log");

    let command: Vec<String> = ["nmap", "-sV", "-T3", "-oX"]
        .iter()
        .map(|s| s.to_string())
        .chain([triage_xml.display().to_string(), host.to_string()])
        .collect();
    mark_running(
        state.module_mut(&module_name),
        &format_command(&command),
        &stdout_path,
        &stderr_path,
    );
    state.save(&state_path)?;

    let result = executor.run(&command, &stdout_path, &stderr_path, timeout_s).await?;
    if result.timed_out {
        warn!(host, "nmap triage timed out; host yields no services.");
        mark_finished(
            state.module_mut(&module_name),
            ModuleStatus::Timeout,
            result.exit_code,
            Some("nmap triage timeout"),
        );
        state.save(&state_path)?;
        return Ok(ServiceMap::new());
    }

    let triage_ports = parse_nmap_xml_ports(&triage_xml)?;
    if host_is_down(&triage_xml)? {
        info!(host, "Host reported down; recording empty service map.");
        let module = state.module_mut(&module_name);
        module.artifacts.insert("host_state".into(), "down".into());
        mark_finished(module, ModuleStatus::Ok, result.exit_code, None);
        write_json(&host_dir.join("services.json"), &ServiceMap::new())?;
        state.save(&state_path)?;
        return Ok(ServiceMap::new());
    }
    if triage_ports.is_empty() {
        info!(host, "No open ports found; recording empty service map.");
        mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, result.exit_code, None);
        write_json(&host_dir.join("services.json"), &ServiceMap::new())?;
        state.save(&state_path)?;
        return Ok(ServiceMap::new());
    }

    let ports_list = triage_ports
        .keys()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    debug!(host, ports = %ports_list, "Running follow-up scan against discovered ports.");
    let followup_cmd: Vec<String> = ["nmap", "-sV", "-sC", "-T3", "-p"]
        .iter()
        .map(|s| s.to_string())
        .chain([
            ports_list,
            "-oX".to_string(),
            followup_xml.display().to_string(),
            host.to_string(),
        ])
        .collect();
    let result = executor
        .run(&followup_cmd, &stdout_path, &stderr_path, timeout_s)
        .await?;
    if result.timed_out {
        mark_finished(
            state.module_mut(&module_name),
            ModuleStatus::Timeout,
            result.exit_code,
            Some("nmap followup timeout"),
        );
    } else {
        mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, result.exit_code, None);
    }
    state.save(&state_path)?;

    let services = parse_nmap_xml_ports(&followup_xml)?;
    let ports_txt = services
        .keys()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(nmap_dir.join("ports.txt"), ports_txt)?;
    write_json(&host_dir.join("services.json"), &services)?;
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_XML: &str = r#"
<nmaprun>
  <host>
    <status state="up"/>
    <ports>
      <port protocol="tcp" portid="80">
        <state state="open" />
        <service name="http" product="Apache" version="2.4" />
      </port>
      <port protocol="tcp" portid="443">
        <state state="open" />
        <service name="https" tunnel="ssl" />
      </port>
      <port protocol="tcp" portid="8080">
        <state state="closed" />
        <service name="http-proxy" />
      </port>
      <port protocol="udp" portid="53">
        <state state="open" />
        <service name="domain" />
      </port>
    </ports>
  </host>
</nmaprun>
"#;

    #[test]
    fn parses_open_tcp_ports_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nmap.xml");
        fs::write(&path, SAMPLE_XML).unwrap();
        let services = parse_nmap_xml_ports(&path).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[&80].name, "http");
        assert_eq!(services[&80].product, "Apache");
        assert_eq!(services[&443].tunnel, "ssl");
        assert!(!services.contains_key(&8080));
        assert!(!services.contains_key(&53));
    }

    #[test]
    fn missing_xml_yields_empty_map() {
        let services = parse_nmap_xml_ports(Path::new("/nonexistent/triage.xml")).unwrap();
        assert!(services.is_empty());
    }

    #[test]
    fn detects_host_down() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("down.xml");
        fs::write(&path, r#"<nmaprun><host><status state="down"/></host></nmaprun>"#).unwrap();
        assert!(host_is_down(&path).unwrap());

        let up = dir.path().join("up.xml");
        fs::write(&up, SAMPLE_XML).unwrap();
        assert!(!host_is_down(&up).unwrap());
    }

    #[test]
    fn derives_web_urls_from_service_metadata() {
        let mut services = ServiceMap::new();
        services.insert(80, ServiceInfo { name: "http".into(), ..Default::default() });
        services.insert(
            443,
            ServiceInfo { name: "https".into(), tunnel: "ssl".into(), ..Default::default() },
        );
        services.insert(
            8443,
            ServiceInfo { name: "http-alt".into(), tunnel: "ssl".into(), ..Default::default() },
        );
        services.insert(22, ServiceInfo { name: "ssh".into(), ..Default::default() });

        let urls = derive_web_urls("192.0.2.10", &services);
        assert_eq!(
            urls,
            vec![
                "http://192.0.2.10:80/",
                "https://192.0.2.10:443/",
                "https://192.0.2.10:8443/",
            ]
        );
    }
}
