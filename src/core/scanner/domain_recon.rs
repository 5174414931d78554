// src/core/scanner/domain_recon.rs

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr, bail};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::executor::{Executor, ToolInventory};
use crate::core::models::{DomainReconResult, HostState, ModuleKind, ModuleStatus, SubdomainMode};
use crate::core::state::{mark_finished, mark_running, write_json};

/// Number of random-label probes behind the wildcard heuristic.
const WILDCARD_PROBES: usize = 3;

/// Record types collected into `dns_records.json`.
const RECORD_TYPES: &[RecordType] = &[
    RecordType::A,
    RecordType::AAAA,
    RecordType::CNAME,
    RecordType::MX,
    RecordType::TXT,
    RecordType::NS,
    RecordType::SOA,
    RecordType::CAA,
];

/// Everything the domain recon stage needs from the operator.
#[derive(Debug, Clone)]
pub struct DomainReconConfig {
    pub fqdn: String,
    pub mode: SubdomainMode,
    pub dns_servers: Option<Vec<String>>,
    pub wordlist: Option<PathBuf>,
    pub timeout_s: u64,
    pub resume: bool,
}

/// Random lowercase-alphanumeric label for wildcard probing.
pub fn random_label(length: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Wildcard-DNS heuristic: the domain is flagged wildcard only when *all*
/// probes against random non-existent labels resolve. A single non-resolving
/// probe is enough to call it non-wildcard, biasing against discarding real
/// subdomains.
pub async fn detect_wildcard<F, Fut>(resolve: F, fqdn: &str, attempts: usize) -> bool
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Vec<String>>,
{
    let base = fqdn.trim_matches('.');
    let mut hits = 0;
    for _ in 0..attempts {
        let name = format!("{}.{}", random_label(12), base);
        if !resolve(name).await.is_empty() {
            hits += 1;
        }
    }
    hits == attempts
}

/// Resolver honoring operator-supplied DNS servers, falling back to the
/// system default configuration.
pub fn build_resolver(dns_servers: Option<&[String]>) -> TokioAsyncResolver {
    match dns_servers {
        Some(servers) if !servers.is_empty() => {
            let mut config = ResolverConfig::new();
            for server in servers {
                match server.parse::<IpAddr>() {
                    Ok(ip) => config.add_name_server(NameServerConfig::new(
                        SocketAddr::new(ip, 53),
                        Protocol::Udp,
                    )),
                    Err(_) => warn!(server, "Ignoring unparseable DNS server."),
                }
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        _ => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
    }
}

/// Resolves one hostname to its sorted, deduplicated IP set; resolution
/// failure is an empty set, not an error.
pub async fn resolve_host(resolver: &TokioAsyncResolver, name: &str) -> Vec<String> {
    match resolver.lookup_ip(name).await {
        Ok(lookup) => {
            let mut ips: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
            ips.sort();
            ips.dedup();
            ips
        }
        Err(error) => {
            debug!(name, %error, "Hostname did not resolve.");
            Vec::new()
        }
    }
}

/// Collects the raw record map for the apex domain. Per-type lookup failures
/// are skipped; an unresolvable type simply contributes no entry.
pub async fn collect_dns_records(
    resolver: &TokioAsyncResolver,
    fqdn: &str,
) -> BTreeMap<String, Vec<String>> {
    let mut records = BTreeMap::new();
    for rtype in RECORD_TYPES {
        match resolver.lookup(fqdn, *rtype).await {
            Ok(lookup) => {
                let values: Vec<String> = lookup.iter().map(|r| r.to_string()).collect();
                if !values.is_empty() {
                    records.insert(rtype.to_string(), values);
                }
            }
            Err(error) => {
                debug!(fqdn, rtype = %rtype, %error, "Record lookup failed, skipping type.");
            }
        }
    }
    records
}

// --- Subdomain Enumerator Chains ---

/// One external subdomain discovery tool. Chains are tried in fixed priority
/// order and only the first available tool is invoked; outputs are never
/// merged across tools.
pub trait SubdomainEnumerator {
    /// Binary name looked up in the tool inventory.
    fn tool(&self) -> &'static str;
    /// Argument vector printing one subdomain per stdout line.
    fn command(&self, fqdn: &str) -> Vec<String>;
}

struct Subfinder;
struct Assetfinder;
struct Amass;
struct Dnsx {
    wordlist: PathBuf,
    dns_servers: Option<Vec<String>>,
}
struct Massdns {
    wordlist: PathBuf,
    dns_servers: Option<Vec<String>>,
}

impl SubdomainEnumerator for Subfinder {
    fn tool(&self) -> &'static str {
        "subfinder"
    }
    fn command(&self, fqdn: &str) -> Vec<String> {
        vec!["subfinder".into(), "-d".into(), fqdn.into(), "-silent".into()]
    }
}

impl SubdomainEnumerator for Assetfinder {
    fn tool(&self) -> &'static str {
        "assetfinder"
    }
    fn command(&self, fqdn: &str) -> Vec<String> {
        vec!["assetfinder".into(), "--subs-only".into(), fqdn.into()]
    }
}

impl SubdomainEnumerator for Amass {
    fn tool(&self) -> &'static str {
        "amass"
    }
    fn command(&self, fqdn: &str) -> Vec<String> {
        vec!["amass".into(), "enum".into(), "-passive".into(), "-d".into(), fqdn.into()]
    }
}

impl SubdomainEnumerator for Dnsx {
    fn tool(&self) -> &'static str {
        "dnsx"
    }
    fn command(&self, fqdn: &str) -> Vec<String> {
        let mut command: Vec<String> = vec![
            "dnsx".into(),
            "-d".into(),
            fqdn.into(),
            "-w".into(),
            self.wordlist.display().to_string(),
            "-silent".into(),
        ];
        if let Some(servers) = &self.dns_servers {
            command.push("-r".into());
            command.push(servers.join(","));
        }
        command
    }
}

impl SubdomainEnumerator for Massdns {
    fn tool(&self) -> &'static str {
        "massdns"
    }
    fn command(&self, _fqdn: &str) -> Vec<String> {
        let resolvers = self
            .dns_servers
            .as_ref()
            .map(|servers| servers.join(","))
            .unwrap_or_else(|| "/etc/resolv.conf".to_string());
        vec![
            "massdns".into(),
            "-r".into(),
            resolvers,
            "-t".into(),
            "A".into(),
            "-o".into(),
            "S".into(),
            self.wordlist.display().to_string(),
        ]
    }
}

fn passive_chain() -> Vec<Box<dyn SubdomainEnumerator + Send + Sync>> {
    vec![Box::new(Subfinder), Box::new(Assetfinder), Box::new(Amass)]
}

fn active_chain(
    wordlist: PathBuf,
    dns_servers: Option<Vec<String>>,
) -> Vec<Box<dyn SubdomainEnumerator + Send + Sync>> {
    vec![
        Box::new(Dnsx { wordlist: wordlist.clone(), dns_servers: dns_servers.clone() }),
        Box::new(Massdns { wordlist, dns_servers }),
    ]
}

/// First enumerator in priority order whose underlying tool is on the PATH.
fn select_enumerator<'a>(
    chain: &'a [Box<dyn SubdomainEnumerator + Send + Sync>],
    tools: &ToolInventory,
) -> Option<&'a (dyn SubdomainEnumerator + Send + Sync)> {
    chain
        .iter()
        .find(|enumerator| tools.available(enumerator.tool()))
        .map(Box::as_ref)
}

/// Runs the first available enumerator of `chain`, capturing its stdout as
/// the subdomain list. With no available tool the chain silently contributes
/// zero subdomains.
async fn run_enumerator_chain(
    chain: &[Box<dyn SubdomainEnumerator + Send + Sync>],
    fqdn: &str,
    domain_dir: &Path,
    executor: &Executor,
    tools: &ToolInventory,
    timeout_s: u64,
) -> Result<Vec<String>> {
    let Some(enumerator) = select_enumerator(chain, tools) else {
        debug!(fqdn, "No subdomain tool available for this chain.");
        return Ok(Vec::new());
    };
    info!(fqdn, tool = enumerator.tool(), "Running subdomain enumeration.");
    let stdout_path = domain_dir.join("stdout.log");
    let stderr_path = domain_dir.join("stderr.log");
    executor
        .run(&enumerator.command(fqdn), &stdout_path, &stderr_path, timeout_s)
        .await?;
    Ok(read_lines(&stdout_path))
}

fn read_lines(path: &Path) -> Vec<String> {
    let Ok(body) = fs::read_to_string(path) else {
        return Vec::new();
    };
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs the whole domain recon module for one domain: wildcard probe, record
/// collection, subdomain discovery, resolution, derived-IP rollup. Reuses the
/// generic module state machine under the `domain_recon` key, keyed by domain
/// name rather than host.
pub async fn run_domain_recon(
    base_dir: &Path,
    config: &DomainReconConfig,
    executor: &Executor,
    tools: &ToolInventory,
) -> Result<DomainReconResult> {
    let fqdn = config.fqdn.as_str();
    let domain_dir = base_dir.join("domain").join(fqdn);
    fs::create_dir_all(&domain_dir)
        .wrap_err_with(|| format!("Cannot create {}", domain_dir.display()))?;
    let state_path = domain_dir.join("state.json");
    let mut state = HostState::load(&state_path, fqdn, fqdn)?;
    let module_name = ModuleKind::DomainRecon.to_string();
    state.reconcile_interrupted(&module_name, &state_path)?;

    let derived_path = domain_dir.join("derived_targets.txt");
    if config.resume
        && state.module_status(&module_name) == ModuleStatus::Ok
        && derived_path.exists()
    {
        info!(fqdn, "domain_recon already OK with artifact present, resuming from disk.");
        return load_persisted_result(&domain_dir, fqdn);
    }

    let active_wordlist = if config.mode.wants_active() {
        match &config.wordlist {
            Some(wordlist) => Some(wordlist.clone()),
            None => bail!("--wordlist-subdomains is required for active mode"),
        }
    } else {
        None
    };

    let stdout_path = domain_dir.join("stdout.log");
    let stderr_path = domain_dir.join("stderr.log");
    mark_running(state.module_mut(&module_name), "domain_recon", &stdout_path, &stderr_path);
    state.save(&state_path)?;

    let resolver = build_resolver(config.dns_servers.as_deref());
    let wildcard_detected = detect_wildcard(
        |name| {
            let resolver = resolver.clone();
            async move { resolve_host(&resolver, &name).await }
        },
        fqdn,
        WILDCARD_PROBES,
    )
    .await;
    if wildcard_detected {
        warn!(fqdn, "Wildcard DNS detected; derived subdomains may be noise.");
    }

    let dns_records = collect_dns_records(&resolver, fqdn).await;
    write_json(&domain_dir.join("dns_records.json"), &dns_records)?;

    let mut subdomains: Vec<String> = Vec::new();
    if config.mode.wants_passive() {
        subdomains.extend(
            run_enumerator_chain(
                &passive_chain(),
                fqdn,
                &domain_dir,
                executor,
                tools,
                config.timeout_s,
            )
            .await?,
        );
    }
    if let Some(wordlist) = active_wordlist {
        subdomains.extend(
            run_enumerator_chain(
                &active_chain(wordlist, config.dns_servers.clone()),
                fqdn,
                &domain_dir,
                executor,
                tools,
                config.timeout_s,
            )
            .await?,
        );
    }
    subdomains.sort();
    subdomains.dedup();
    fs::write(domain_dir.join("subdomains.txt"), subdomains.join("\n"))?;

    let mut resolved: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &subdomains {
        resolved.insert(name.clone(), resolve_host(&resolver, name).await);
    }
    write_json(&domain_dir.join("resolved.json"), &resolved)?;

    let mut derived_ips: Vec<String> = resolved.values().flatten().cloned().collect();
    derived_ips.sort();
    derived_ips.dedup();
    fs::write(&derived_path, derived_ips.join("\n"))?;

    mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, Some(0), None);
    state.save(&state_path)?;

    let result = DomainReconResult {
        fqdn: fqdn.to_string(),
        wildcard_detected,
        resolved,
        derived_ips,
    };
    write_json(&domain_dir.join("recon_summary.json"), &result)?;
    info!(
        fqdn,
        subdomains = subdomains.len(),
        derived_ips = result.derived_ips.len(),
        wildcard_detected,
        "domain_recon finished."
    );
    Ok(result)
}

/// Resume path: the persisted artifacts stand as-is, no internal
/// re-validation.
fn load_persisted_result(domain_dir: &Path, fqdn: &str) -> Result<DomainReconResult> {
    let derived_ips = read_lines(&domain_dir.join("derived_targets.txt"));
    let resolved: BTreeMap<String, Vec<String>> =
        match fs::read_to_string(domain_dir.join("resolved.json")) {
            Ok(body) => serde_json::from_str(&body).wrap_err("Corrupt resolved.json")?,
            Err(_) => BTreeMap::new(),
        };
    let wildcard_detected = fs::read_to_string(domain_dir.join("recon_summary.json"))
        .ok()
        .and_then(|body| serde_json::from_str::<DomainReconResult>(&body).ok())
        .map(|summary| summary.wildcard_detected)
        .unwrap_or(false);
    Ok(DomainReconResult {
        fqdn: fqdn.to_string(),
        wildcard_detected,
        resolved,
        derived_ips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn random_label_uses_lowercase_alnum_alphabet() {
        let label = random_label(12);
        assert_eq!(label.len(), 12);
        assert!(label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn wildcard_requires_all_probes_to_resolve() {
        let always = |_name: String| async { vec!["203.0.113.10".to_string()] };
        assert!(detect_wildcard(always, "example.com", 2).await);
    }

    #[tokio::test]
    async fn one_non_resolving_probe_forces_non_wildcard() {
        let calls = Mutex::new(0usize);
        let flaky = |_name: String| {
            let mut count = calls.lock().unwrap();
            *count += 1;
            let first = *count == 1;
            async move {
                if first { Vec::new() } else { vec!["203.0.113.10".to_string()] }
            }
        };
        assert!(!detect_wildcard(flaky, "example.com", 2).await);
    }

    #[test]
    fn passive_chain_prefers_subfinder_then_falls_back() {
        let chain = passive_chain();
        let tools = ToolInventory::from_available(&["subfinder", "amass"]);
        assert_eq!(select_enumerator(&chain, &tools).unwrap().tool(), "subfinder");

        let tools = ToolInventory::from_available(&["amass"]);
        assert_eq!(select_enumerator(&chain, &tools).unwrap().tool(), "amass");

        let tools = ToolInventory::from_available(&[]);
        assert!(select_enumerator(&chain, &tools).is_none());
    }

    #[test]
    fn dnsx_command_carries_wordlist_and_resolvers() {
        let chain = active_chain(
            PathBuf::from("/tmp/words.txt"),
            Some(vec!["198.51.100.53".to_string(), "198.51.100.54".to_string()]),
        );
        let command = chain[0].command("example.com");
        assert_eq!(command[0], "dnsx");
        assert!(command.contains(&"/tmp/words.txt".to_string()));
        let r_index = command.iter().position(|item| item == "-r").unwrap();
        assert_eq!(command[r_index + 1], "198.51.100.53,198.51.100.54");
    }

    #[test]
    fn massdns_defaults_to_system_resolv_conf() {
        let chain = active_chain(PathBuf::from("/tmp/words.txt"), None);
        let command = chain[1].command("example.com");
        assert_eq!(command[0], "massdns");
        assert!(command.contains(&"/etc/resolv.conf".to_string()));
    }
}
