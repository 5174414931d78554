// src/core/scope.rs

use std::collections::BTreeSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use color_eyre::eyre::{Result, WrapErr, bail};
use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, info, warn};

/// Deduplicates and lexicographically sorts, for reproducible target lists.
pub fn dedupe_sorted(items: impl IntoIterator<Item = String>) -> Vec<String> {
    items.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Outcome of resolving a raw targets file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetParseResult {
    pub targets: Vec<String>,
    pub skipped: Vec<String>,
}

/// Turns a raw targets file into a deduplicated, deterministic host list.
///
/// Each non-blank, non-comment line is a literal IP, a CIDR block, or invalid.
/// CIDR lines are only expanded when the operator opted in; otherwise they are
/// recorded as skipped. A CIDR expanding past `cidr_cap` usable hosts fails
/// the whole call, a circuit breaker against accidental large-scope scans.
pub fn parse_targets_file(
    path: &Path,
    allow_cidr_expand: bool,
    cidr_cap: usize,
) -> Result<TargetParseResult> {
    if !path.exists() {
        bail!("Targets file does not exist: {}", path.display());
    }
    let body = fs::read_to_string(path)
        .wrap_err_with(|| format!("Cannot read targets file {}", path.display()))?;

    let mut targets: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains('/') {
            if !allow_cidr_expand {
                debug!(line, "CIDR expansion not enabled, skipping line.");
                skipped.push(line.to_string());
                continue;
            }
            let Ok(network) = line.parse::<IpNet>() else {
                warn!(line, "Line is neither a valid IP nor a valid CIDR.");
                skipped.push(line.to_string());
                continue;
            };
            // Usable hosts only: network and broadcast addresses are excluded.
            let hosts: Vec<IpAddr> = network.hosts().take(cidr_cap + 1).collect();
            if hosts.len() > cidr_cap {
                bail!("CIDR {} exceeds cap of {} hosts", line, cidr_cap);
            }
            targets.extend(hosts.into_iter().map(|ip| ip.to_string()));
        } else if line.parse::<IpAddr>().is_ok() {
            targets.push(line.to_string());
        } else {
            warn!(line, "Line is neither a valid IP nor a valid CIDR.");
            skipped.push(line.to_string());
        }
    }
    let targets = dedupe_sorted(targets);
    info!(targets = targets.len(), skipped = skipped.len(), "Targets file resolved.");
    Ok(TargetParseResult { targets, skipped })
}

/// Split of derived targets into scannable and excluded sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDecision {
    pub in_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
}

/// Allow/deny rules constraining which *derived* targets may be scanned.
/// Operator-supplied targets never pass through here; they are pre-vetted.
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    allow_cidrs: Vec<IpNet>,
    allow_regex: Option<Regex>,
    deny_regex: Option<Regex>,
}

impl ScopePolicy {
    /// Builds the policy from raw operator options. Malformed CIDRs or
    /// regexes are configuration errors and abort before any scanning.
    pub fn from_options(
        allow_cidrs: &[String],
        allow_regex: Option<&str>,
        deny_regex: Option<&str>,
    ) -> Result<Self> {
        let mut networks = Vec::new();
        for item in allow_cidrs {
            let network: IpNet = item
                .parse()
                .wrap_err_with(|| format!("Invalid scope allow CIDR: {item}"))?;
            networks.push(network);
        }
        let allow_regex = allow_regex
            .map(Regex::new)
            .transpose()
            .wrap_err("Invalid scope allow regex")?;
        let deny_regex = deny_regex
            .map(Regex::new)
            .transpose()
            .wrap_err("Invalid scope deny regex")?;
        Ok(Self { allow_cidrs: networks, allow_regex, deny_regex })
    }

    /// Applies the policy to derived targets.
    ///
    /// Fail-closed default: with no allow CIDRs configured every derived
    /// target is out of scope. Regex filters run only after CIDR filtering,
    /// allow before deny; deny always wins when both match. Excluded targets
    /// are returned for the error log, never silently dropped.
    pub fn apply(&self, derived: &[String]) -> ScopeDecision {
        let mut in_scope = Vec::new();
        let mut out_of_scope = Vec::new();
        for target in derived {
            if self.admits(target) {
                in_scope.push(target.clone());
            } else {
                out_of_scope.push(target.clone());
            }
        }
        ScopeDecision {
            in_scope: dedupe_sorted(in_scope),
            out_of_scope: dedupe_sorted(out_of_scope),
        }
    }

    fn admits(&self, target: &str) -> bool {
        if self.allow_cidrs.is_empty() {
            return false;
        }
        let Ok(ip) = target.parse::<IpAddr>() else {
            return false;
        };
        if !self.allow_cidrs.iter().any(|network| network.contains(&ip)) {
            return false;
        }
        if let Some(allow) = &self.allow_regex {
            if !allow.is_match(target) {
                return false;
            }
        }
        if let Some(deny) = &self.deny_regex {
            if deny.is_match(target) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn targets_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn literals_admitted_cidrs_expanded_invalid_skipped() {
        let file = targets_file("# comment\n192.0.2.1\n198.51.100.0/30\ninvalid\n");
        let result = parse_targets_file(file.path(), true, 10).unwrap();
        assert_eq!(
            result.targets,
            vec!["192.0.2.1", "198.51.100.1", "198.51.100.2"]
        );
        assert_eq!(result.skipped, vec!["invalid"]);
    }

    #[test]
    fn cidr_lines_are_skipped_without_opt_in() {
        let file = targets_file("192.0.2.1\n198.51.100.0/30\n");
        let result = parse_targets_file(file.path(), false, 10).unwrap();
        assert_eq!(result.targets, vec!["192.0.2.1"]);
        assert_eq!(result.skipped, vec!["198.51.100.0/30"]);
    }

    #[test]
    fn cidr_cap_breach_fails_whole_call() {
        let file = targets_file("198.51.100.0/29");
        let error = parse_targets_file(file.path(), true, 4).unwrap_err();
        assert!(error.to_string().contains("exceeds cap"));
    }

    #[test]
    fn missing_targets_file_is_fatal() {
        assert!(parse_targets_file(Path::new("/nonexistent/targets.txt"), false, 10).is_err());
    }

    #[test]
    fn duplicates_collapse_and_order_is_lexicographic() {
        let file = targets_file("192.0.2.9\n192.0.2.1\n192.0.2.9\n");
        let result = parse_targets_file(file.path(), false, 10).unwrap();
        assert_eq!(result.targets, vec!["192.0.2.1", "192.0.2.9"]);
    }

    #[test]
    fn no_allow_cidrs_excludes_everything() {
        let policy = ScopePolicy::from_options(&[], None, None).unwrap();
        let decision = policy.apply(&["192.0.2.1".into(), "192.0.2.2".into()]);
        assert!(decision.in_scope.is_empty());
        assert_eq!(decision.out_of_scope, vec!["192.0.2.1", "192.0.2.2"]);
    }

    #[test]
    fn cidr_filter_splits_in_and_out() {
        let policy =
            ScopePolicy::from_options(&["192.0.2.0/24".to_string()], None, None).unwrap();
        let decision = policy.apply(&["192.0.2.7".into(), "198.51.100.7".into()]);
        assert_eq!(decision.in_scope, vec!["192.0.2.7"]);
        assert_eq!(decision.out_of_scope, vec!["198.51.100.7"]);
    }

    #[test]
    fn deny_regex_wins_over_allow() {
        let policy = ScopePolicy::from_options(
            &["192.0.2.0/24".to_string()],
            Some(r"^192\.0\.2\."),
            Some(r"\.13$"),
        )
        .unwrap();
        let decision = policy.apply(&["192.0.2.12".into(), "192.0.2.13".into()]);
        assert_eq!(decision.in_scope, vec!["192.0.2.12"]);
        assert_eq!(decision.out_of_scope, vec!["192.0.2.13"]);
    }

    #[test]
    fn malformed_allow_cidr_is_config_error() {
        assert!(ScopePolicy::from_options(&["not-a-cidr".to_string()], None, None).is_err());
    }
}
