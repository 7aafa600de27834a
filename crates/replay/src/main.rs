//! foldermerge-replay entry point.
//!
//! Loads a scenario, builds an in-memory folder with a base tree and two
//! divergent branches, runs the conflict resolver once and prints the trees
//! before and after together with the resolution report as JSON.

mod scenario;
mod signals;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use foldermerge_core::memory::TreeNode;
use foldermerge_core::model::EntryType;
use foldermerge_core::{
    CancellationToken, ConflictResolver, ResolutionReport, ResolverConfig, StatsSnapshot,
};

use crate::scenario::Scenario;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Replay a two-branch folder scenario through the conflict resolver.
#[derive(Parser, Debug)]
#[command(
    name = "foldermerge-replay",
    version,
    about = "Resolve a scripted unmerged branch against concurrent merged changes"
)]
struct Args {
    /// Path to the TOML scenario file.
    scenario: PathBuf,

    /// Path to the TOML resolver configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Give up on the resolution after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EntryView {
    kind: EntryType,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    merged_before: BTreeMap<String, EntryView>,
    unmerged_before: BTreeMap<String, EntryView>,
    resolved: BTreeMap<String, EntryView>,
    report: Option<ResolutionReport>,
    stats: StatsSnapshot,
}

fn render(tree: BTreeMap<String, TreeNode>) -> BTreeMap<String, EntryView> {
    tree.into_iter()
        .map(|(path, node)| {
            let view = EntryView {
                kind: node.entry_type,
                size: node.size,
                contents: node
                    .contents
                    .map(|c| String::from_utf8_lossy(&c).into_owned()),
            };
            (path, view)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            ResolverConfig::load_and_validate(path).context("failed to load configuration file")?
        }
        None => ResolverConfig::default(),
    };

    // Logs go to stderr so stdout carries only the JSON result.
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        scenario = %args.scenario.display(),
        log_level,
        "foldermerge-replay starting"
    );

    let scenario = Scenario::load_from_file(&args.scenario)?;
    let folder = Arc::new(scenario.build_folder()?);
    let merged_before = render(folder.merged_tree().context("failed to list merged tree")?);
    let unmerged_before = match folder.unmerged_head() {
        Some(head) => render(folder.tree(head.root).context("failed to list unmerged tree")?),
        None => BTreeMap::new(),
    };

    let resolver = ConflictResolver::new(folder.clone(), config, scenario.writers.unmerged.clone());
    let mut reports = resolver.subscribe();

    match (folder.unmerged_branch(), folder.unmerged_head()) {
        (Some(branch), Some(head)) => {
            resolver.begin_new_branch(branch);
            resolver
                .resolve(head.revision, folder.merged_head().revision)
                .context("failed to request resolution")?;
        }
        _ => info!("scenario has no unmerged revisions, nothing to resolve"),
    }

    let ctx = CancellationToken::new();
    let timeout = Duration::from_secs(args.timeout_secs);
    tokio::select! {
        result = tokio::time::timeout(timeout, resolver.wait(&ctx)) => match result {
            Ok(waited) => waited.context("waiting for resolution failed")?,
            Err(_) => {
                resolver.shutdown_and_join().await;
                bail!("resolution did not finish within {}s", args.timeout_secs);
            }
        },
        _ = signals::wait_for_interrupt() => {
            warn!("interrupted, canceling resolution");
            resolver.force_cancel();
        }
    }
    resolver.shutdown_and_join().await;

    let report = reports.try_recv().ok();
    let stats = resolver.stats();
    let output = ReplayOutput {
        merged_before,
        unmerged_before,
        resolved: render(folder.merged_tree().context("failed to list resolved tree")?),
        report,
        stats,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("failed to serialize output")?
    );

    if stats.failed > 0 {
        bail!("{} resolution attempt(s) failed", stats.failed);
    }
    Ok(())
}
