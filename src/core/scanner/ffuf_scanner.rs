// src/core/scanner/ffuf_scanner.rs

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::executor::Executor;
use crate::core::models::{HostState, ModuleKind, ModuleStatus};
use crate::core::state::{mark_finished, mark_running, write_json};

/// Default wordlist locations probed in order; content discovery degrades to
/// SKIPPED when none exists.
const WORDLIST_CANDIDATES: &[&str] = &[
    "/usr/share/wordlists/dirb/common.txt",
    "/usr/share/wordlists/dirbuster/directory-list-2.3-small.txt",
];

/// One content-discovery hit distilled from ffuf's JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfufHit {
    pub url: Option<String>,
    pub status: Option<u32>,
    pub length: Option<u64>,
    pub words: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfufOutput {
    #[serde(default)]
    results: Vec<FfufHit>,
}

/// First locally available candidate wordlist, if any.
pub fn discover_wordlist() -> Option<PathBuf> {
    WORDLIST_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn url_port(url: &str) -> Option<u16> {
    url::Url::parse(url).ok().and_then(|u| u.port_or_known_default())
}

/// Runs ffuf against every derived web URL, rolling all hits into
/// `web/ffuf_hits.json`. A missing wordlist degrades the stage to SKIPPED
/// instead of failing the host.
pub async fn run_ffuf(
    host_dir: &Path,
    host: &str,
    urls: &[String],
    executor: &Executor,
    timeout_s: u64,
    resume: bool,
) -> Result<()> {
    let state_path = host_dir.join("state.json");
    let mut state = HostState::load(&state_path, host, host)?;
    let module_name = ModuleKind::Ffuf.to_string();
    state.reconcile_interrupted(&module_name, &state_path)?;

    if resume && state.module_status(&module_name) == ModuleStatus::Ok {
        info!(host, "ffuf already OK, resuming from disk.");
        return Ok(());
    }

    let web_dir = host_dir.join("web");
    fs::create_dir_all(&web_dir)?;
    fs::write(web_dir.join("urls.txt"), urls.join("\n"))?;

    let stdout_path = web_dir.join("stdout.log");
    let stderr_path = web_dir.join("stderr.log");
    mark_running(state.module_mut(&module_name), "ffuf", &stdout_path, &stderr_path);
    state.save(&state_path)?;

    let Some(wordlist) = discover_wordlist() else {
        warn!(host, "No default wordlist found, skipping content discovery.");
        mark_finished(
            state.module_mut(&module_name),
            ModuleStatus::Skipped,
            None,
            Some("No default wordlist found"),
        );
        state.save(&state_path)?;
        return Ok(());
    };

    let mut hits: Vec<FfufHit> = Vec::new();
    for url in urls {
        let Some(port) = url_port(url) else {
            continue;
        };
        let output_path = web_dir.join(format!("ffuf_{port}.json"));
        debug!(host, url = %url, "Fuzzing URL.");
        let command: Vec<String> = vec![
            "ffuf".into(),
            "-u".into(),
            format!("{url}FUZZ"),
            "-w".into(),
            wordlist.display().to_string(),
            "-of".into(),
            "json".into(),
            "-o".into(),
            output_path.display().to_string(),
            "-t".into(),
            "5".into(),
            "-timeout".into(),
            timeout_s.to_string(),
        ];
        executor.run(&command, &stdout_path, &stderr_path, timeout_s).await?;

        if output_path.exists() {
            let body = fs::read_to_string(&output_path)?;
            match serde_json::from_str::<FfufOutput>(&body) {
                Ok(output) => hits.extend(output.results),
                Err(error) => {
                    debug!(host, %error, "Unparseable ffuf output, ignoring.");
                }
            }
        }
    }

    write_json(&web_dir.join("ffuf_hits.json"), &hits)?;
    mark_finished(state.module_mut(&module_name), ModuleStatus::Ok, Some(0), None);
    state.save(&state_path)?;
    info!(host, hits = hits.len(), "ffuf stage finished.");
    Ok(())
}
