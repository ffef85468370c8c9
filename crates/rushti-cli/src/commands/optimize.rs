//! `rushti optimize` -- C10 entry point (spec §4.10). Analyzes historical
//! contention for a workflow and emits a rewritten taskfile with the driver
//! group ordered first and a recommended `max_workers`.
//!
//! SPEC_FULL.md's CLI line for this subcommand omits the taskfile itself,
//! but step 8 of the algorithm requires the original `Workflow` to rewrite
//! -- `--tasks` is added here as the natural completion of that surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rushti_optimizer::OptimizerSettings;
use rushti_stats::StatsStore;

use crate::commands::shared;
use crate::EXIT_SUCCESS;

#[derive(Args)]
pub struct OptimizeArgs {
    #[arg(long = "stats-db")]
    pub stats_db: PathBuf,
    #[arg(long)]
    pub workflow: String,
    #[arg(long)]
    pub tasks: PathBuf,
    #[arg(long)]
    pub out: PathBuf,
}

pub fn execute(args: OptimizeArgs) -> Result<u8> {
    let stats = StatsStore::open(&args.stats_db)
        .with_context(|| format!("opening stats store '{}'", args.stats_db.display()))?;
    let analysis = rushti_optimizer::analyze_contention(&stats, &args.workflow, &OptimizerSettings::default())
        .context("analyzing contention")?;

    let original = shared::load_workflow(&args.tasks)?;
    let rewritten = rushti_optimizer::write_optimized_taskfile(&original, &analysis);

    let serialized = serde_json::to_string_pretty(&rewritten).context("serializing optimized workflow")?;
    std::fs::write(&args.out, serialized).with_context(|| format!("writing '{}'", args.out.display()))?;

    tracing::info!(
        workflow = args.workflow,
        driver_key = ?analysis.driver_key,
        recommended_max_workers = ?analysis.recommended_max_workers,
        out = %args.out.display(),
        "{}",
        analysis.description
    );
    Ok(EXIT_SUCCESS)
}
