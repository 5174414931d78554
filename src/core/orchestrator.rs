// src/core/orchestrator.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use color_eyre::eyre::{Result, WrapErr, bail};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::core::executor::{Executor, ToolInventory};
use crate::core::models::{EngagementError, ModuleKind, Profile};
use crate::core::reporting::{RunInputs, build_summary};
use crate::core::scanner::domain_recon::{DomainReconConfig, run_domain_recon};
use crate::core::scanner::run_host_pipeline;
use crate::core::scope::{ScopePolicy, dedupe_sorted, parse_targets_file};
use crate::core::state::write_json;

lazy_static! {
    static ref VALID_ENGAGEMENT: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Normalizes and validates the operator-supplied engagement name. Spaces
/// become underscores; anything else outside `[A-Za-z0-9_-]` is a
/// configuration error.
pub fn normalize_engagement_name(name: &str) -> Result<String> {
    let normalized = name.trim().replace(' ', "_");
    if normalized.is_empty() {
        bail!("Engagement name cannot be empty");
    }
    if !VALID_ENGAGEMENT.is_match(&normalized) {
        bail!("Engagement name must match [A-Za-z0-9_-]");
    }
    Ok(normalized)
}

/// Creates the directory and proves it is writable by writing and removing a
/// probe file. Failures here are fatal resource errors.
pub fn ensure_writable_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .wrap_err_with(|| format!("Cannot create output directory {}", path.display()))?;
    let probe = path.join(".write_test");
    fs::write(&probe, "ok")
        .wrap_err_with(|| format!("Output directory not writable: {}", path.display()))?;
    fs::remove_file(&probe).ok();
    Ok(())
}

/// Shared, append-only collection of non-fatal problems, aggregated into the
/// final summary instead of aborting the engagement.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    inner: Arc<Mutex<Vec<EngagementError>>>,
}

impl ErrorLog {
    pub fn push(&self, error: EngagementError) {
        self.inner.lock().expect("engagement error log poisoned").push(error);
    }

    pub fn snapshot(&self) -> Vec<EngagementError> {
        self.inner.lock().expect("engagement error log poisoned").clone()
    }
}

/// Per-module wall-clock budgets, seconds.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub nmap: u64,
    pub sslscan: u64,
    pub ffuf: u64,
    pub nuclei: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { nmap: 900, sslscan: 300, ffuf: 300, nuclei: 900 }
    }
}

/// Everything one engagement run shares across host pipelines: output layout,
/// operator choices, the probed tool inventory, the subprocess admission
/// gate, and the error log. Constructed once per invocation.
#[derive(Debug, Clone)]
pub struct Engagement {
    pub name: String,
    pub output_dir: PathBuf,
    pub profile: Profile,
    pub resume: bool,
    pub only: Option<ModuleKind>,
    pub skip_nmap: bool,
    pub skip_ssl: bool,
    pub skip_ffuf: bool,
    pub skip_nuclei: bool,
    pub timeouts: Timeouts,
    pub tools: ToolInventory,
    pub executor: Executor,
    pub errors: ErrorLog,
}

/// Bounded fan-out over the final target set: at most `max_hosts` pipelines
/// run at once, each strictly sequential within itself. A failing pipeline is
/// recorded against its host in the error log and never takes siblings down.
pub async fn fan_out_hosts<F, Fut>(
    hosts: &[String],
    max_hosts: usize,
    errors: &ErrorLog,
    run: F,
) -> Result<()>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let host_gate = Arc::new(Semaphore::new(max_hosts));
    let mut pipelines = JoinSet::new();
    for host in hosts {
        let permit = host_gate
            .clone()
            .acquire_owned()
            .await
            .wrap_err("Host admission gate closed")?;
        let host = host.clone();
        let pipeline = run(host.clone());
        pipelines.spawn(async move {
            let _permit = permit;
            let outcome = pipeline.await;
            (host, outcome)
        });
    }
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((host, Err(pipeline_error))) => {
                error!(host = %host, error = %pipeline_error, "Host pipeline failed.");
                errors.push(EngagementError::for_host("host", &host, pipeline_error.to_string()));
            }
            Err(join_error) => {
                error!(error = %join_error, "Host pipeline task aborted.");
                errors.push(EngagementError::new("host", join_error.to_string()));
            }
        }
    }
    Ok(())
}

/// Entry point of the engine: resolves targets, runs domain recon, fans the
/// final target set out across bounded host pipelines, and always leaves a
/// summary behind.
pub async fn orchestrate(args: Cli) -> Result<()> {
    let engagement_name = normalize_engagement_name(&args.engagement_name)?;
    let output_dir = args.output.join(&engagement_name);
    ensure_writable_dir(&output_dir)?;
    let output_dir = fs::canonicalize(&output_dir)
        .wrap_err_with(|| format!("Cannot resolve {}", output_dir.display()))?;

    let errors = ErrorLog::default();
    let meta_dir = output_dir.join("_meta");
    fs::create_dir_all(&meta_dir)?;

    let tools = ToolInventory::detect();
    fs::write(meta_dir.join("tool_versions.txt"), tools.render())?;

    if args.input.is_none() && args.fqdn.is_none() {
        bail!("--input or --fqdn must be provided");
    }

    // The admission gate for every external command in this run.
    let executor = Executor::new(args.max_procs);

    let mut targets: Vec<String> = Vec::new();
    if let Some(input) = &args.input {
        let parsed = parse_targets_file(input, args.allow_cidr_expand, args.cidr_cap)?;
        fs::write(meta_dir.join("targets_resolved.txt"), parsed.targets.join("\n"))?;
        if !parsed.skipped.is_empty() {
            warn!(skipped = parsed.skipped.len(), "Some target lines were skipped.");
            errors.push(
                EngagementError::new("input", "Skipped invalid targets")
                    .with_items(parsed.skipped.clone()),
            );
        }
        targets = parsed.targets;
    }

    let mut derived_targets: Vec<String> = Vec::new();
    if let Some(fqdn) = &args.fqdn {
        let recon_gated = args.only.is_some_and(|only| only != ModuleKind::DomainRecon);
        if !recon_gated {
            let config = DomainReconConfig {
                fqdn: fqdn.clone(),
                mode: args.subdomain_mode,
                dns_servers: args.dns_servers.clone(),
                wordlist: args.wordlist_subdomains.clone(),
                timeout_s: args.timeout_nmap,
                resume: args.resume(),
            };
            let result = run_domain_recon(&output_dir, &config, &executor, &tools).await?;
            derived_targets = result.derived_ips;
        }
    }

    let mut final_targets = targets;
    if args.scan_derived && !derived_targets.is_empty() {
        let policy = ScopePolicy::from_options(
            args.scope_allow_cidrs.as_deref().unwrap_or(&[]),
            args.scope_allow_regex.as_deref(),
            args.scope_deny_regex.as_deref(),
        )?;
        let decision = policy.apply(&derived_targets);
        if !decision.out_of_scope.is_empty() {
            warn!(
                excluded = decision.out_of_scope.len(),
                "Derived targets excluded by scope policy."
            );
            errors.push(
                EngagementError::new("domain_recon", "Derived targets out of scope")
                    .with_items(decision.out_of_scope),
            );
        }
        final_targets.extend(decision.in_scope);
    }
    let final_targets = dedupe_sorted(final_targets);
    fs::write(meta_dir.join("final_targets.txt"), final_targets.join("\n"))?;

    let inputs = RunInputs {
        input: args
            .input
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        fqdn: args.fqdn.clone().unwrap_or_default(),
    };
    write_json(
        &meta_dir.join("run.json"),
        &serde_json::json!({
            "engagement_name": engagement_name,
            "profile": args.profile,
            "inputs": &inputs,
            "scan_derived": args.scan_derived,
        }),
    )?;

    if args.dry_run {
        info!(targets = final_targets.len(), "Dry run requested, stopping before any scan.");
        return Ok(());
    }

    let engagement = Arc::new(Engagement {
        name: engagement_name.clone(),
        output_dir: output_dir.clone(),
        profile: args.profile,
        resume: args.resume(),
        only: args.only,
        skip_nmap: args.skip_nmap,
        skip_ssl: args.skip_ssl,
        skip_ffuf: args.skip_ffuf,
        skip_nuclei: args.skip_nuclei,
        timeouts: Timeouts {
            nmap: args.timeout_nmap,
            sslscan: args.timeout_sslscan,
            ffuf: args.timeout_ffuf,
            nuclei: args.timeout_nuclei,
        },
        tools,
        executor,
        errors: errors.clone(),
    });

    info!(
        engagement = %engagement_name,
        targets = final_targets.len(),
        max_hosts = args.max_hosts,
        max_procs = args.max_procs,
        "Starting host pipelines."
    );

    let runner = {
        let engagement = Arc::clone(&engagement);
        move |host: String| {
            let engagement = Arc::clone(&engagement);
            async move { run_host_pipeline(&engagement, &host).await }
        }
    };
    fan_out_hosts(&final_targets, args.max_hosts, &errors, runner).await?;

    build_summary(
        &output_dir,
        &engagement_name,
        args.profile,
        &inputs,
        args.scan_derived,
        args.scope_allow_cidrs.as_deref().unwrap_or(&[]),
        &final_targets,
        &errors.snapshot(),
    )?;
    info!(engagement = %engagement_name, "Engagement finished.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engagement_names_are_normalized() {
        assert_eq!(normalize_engagement_name("Acme Test").unwrap(), "Acme_Test");
        assert_eq!(normalize_engagement_name("  q1-2026  ").unwrap(), "q1-2026");
    }

    #[test]
    fn bad_engagement_names_are_config_errors() {
        assert!(normalize_engagement_name("bad/name").is_err());
        assert!(normalize_engagement_name("").is_err());
        assert!(normalize_engagement_name("   ").is_err());
    }

    #[test]
    fn error_log_is_shared_across_clones() {
        let log = ErrorLog::default();
        let clone = log.clone();
        clone.push(EngagementError::new("input", "Skipped invalid targets"));
        assert_eq!(log.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_bounds_concurrent_pipelines_and_isolates_failures() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        use color_eyre::eyre::eyre;

        let hosts: Vec<String> = (1..=4).map(|n| format!("192.0.2.{n}")).collect();
        let errors = ErrorLog::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runner = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |host: String| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if host == "192.0.2.3" {
                        return Err(eyre!("scan blew up"));
                    }
                    Ok(())
                }
            }
        };
        fan_out_hosts(&hosts, 1, &errors, runner).await.unwrap();

        // With one permit the pipeline bodies never overlap.
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // The failing host is recorded without taking siblings down.
        let recorded = errors.snapshot();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].module, "host");
        assert_eq!(recorded[0].host.as_deref(), Some("192.0.2.3"));
        assert!(recorded[0].message.contains("scan blew up"));
    }
}
