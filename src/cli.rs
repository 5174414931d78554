// src/cli.rs

use std::path::PathBuf;

use clap::Parser;

use crate::core::models::{ModuleKind, Profile, SubdomainMode};

/// Authorized reconnaissance orchestration: resolves a vetted target set,
/// drives external scanners per host with resumable state, and renders an
/// engagement summary.
#[derive(Debug, Parser)]
#[command(name = "ranger-rs-recon", version, about, long_about = None)]
pub struct Cli {
    /// Name of the engagement; becomes the output subdirectory.
    #[arg(long)]
    pub engagement_name: String,

    /// Targets file: one IP or CIDR per line, `#` comments allowed.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Domain to run subdomain recon against.
    #[arg(long)]
    pub fqdn: Option<String>,

    /// Output root directory.
    #[arg(long, default_value = "./output")]
    pub output: PathBuf,

    /// Scan profile controlling the nuclei severity set.
    #[arg(long, value_enum, default_value_t = Profile::Safe)]
    pub profile: Profile,

    /// Disable resume: re-run modules even when prior artifacts exist.
    #[arg(long)]
    pub no_resume: bool,

    /// Stop after target resolution and metadata, before any scan.
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum host pipelines running concurrently.
    #[arg(long, default_value_t = 5)]
    pub max_hosts: usize,

    /// Maximum external subprocesses running concurrently, engagement-wide.
    #[arg(long, default_value_t = 10)]
    pub max_procs: usize,

    /// Per-module wall-clock budgets, seconds.
    #[arg(long, default_value_t = 900)]
    pub timeout_nmap: u64,
    #[arg(long, default_value_t = 300)]
    pub timeout_sslscan: u64,
    #[arg(long, default_value_t = 300)]
    pub timeout_ffuf: u64,
    #[arg(long, default_value_t = 900)]
    pub timeout_nuclei: u64,

    /// Subdomain enumeration mode.
    #[arg(long, value_enum, default_value_t = SubdomainMode::Passive)]
    pub subdomain_mode: SubdomainMode,

    /// DNS servers for subdomain resolution, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub dns_servers: Option<Vec<String>>,

    /// Wordlist for active subdomain enumeration (required in active mode).
    #[arg(long)]
    pub wordlist_subdomains: Option<PathBuf>,

    /// Fold scope-vetted derived targets into the scan set.
    #[arg(long)]
    pub scan_derived: bool,

    /// Allow CIDRs constraining derived targets, comma-separated. Without
    /// this every derived target is out of scope.
    #[arg(long, value_delimiter = ',')]
    pub scope_allow_cidrs: Option<Vec<String>>,

    /// Regex a derived target must match to stay in scope.
    #[arg(long)]
    pub scope_allow_regex: Option<String>,

    /// Regex excluding derived targets; wins over the allow regex.
    #[arg(long)]
    pub scope_deny_regex: Option<String>,

    /// Per-module operator opt-outs.
    #[arg(long)]
    pub skip_nmap: bool,
    #[arg(long)]
    pub skip_ssl: bool,
    #[arg(long)]
    pub skip_ffuf: bool,
    #[arg(long)]
    pub skip_nuclei: bool,

    /// Restrict the run to a single module; every other stage is a no-op.
    #[arg(long, value_enum)]
    pub only: Option<ModuleKind>,

    /// Opt-in gate for CIDR expansion in the targets file.
    #[arg(long)]
    pub allow_cidr_expand: bool,

    /// Maximum usable hosts a single CIDR may expand to.
    #[arg(long, default_value_t = 4096)]
    pub cidr_cap: usize,
}

impl Cli {
    /// Resume is on unless the operator opted out.
    pub fn resume(&self) -> bool {
        !self.no_resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let cli = Cli::parse_from(["ranger-rs-recon", "--engagement-name", "acme"]);
        assert_eq!(cli.engagement_name, "acme");
        assert_eq!(cli.max_hosts, 5);
        assert_eq!(cli.max_procs, 10);
        assert_eq!(cli.cidr_cap, 4096);
        assert_eq!(cli.profile, Profile::Safe);
        assert_eq!(cli.subdomain_mode, SubdomainMode::Passive);
        assert!(cli.resume());
        assert!(!cli.allow_cidr_expand);
    }

    #[test]
    fn comma_separated_lists_split() {
        let cli = Cli::parse_from([
            "ranger-rs-recon",
            "--engagement-name",
            "acme",
            "--dns-servers",
            "198.51.100.53,198.51.100.54",
            "--scope-allow-cidrs",
            "192.0.2.0/24,198.51.100.0/24",
            "--no-resume",
            "--only",
            "nuclei",
        ]);
        assert_eq!(cli.dns_servers.as_ref().unwrap().len(), 2);
        assert_eq!(cli.scope_allow_cidrs.as_ref().unwrap().len(), 2);
        assert!(!cli.resume());
        assert_eq!(cli.only, Some(ModuleKind::Nuclei));
    }
}
