//! `rushti stats show` -- a read-only query surface over C4, no dashboard
//! rendering (spec §6).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use rushti_stats::StatsStore;

use crate::EXIT_SUCCESS;

#[derive(Subcommand)]
pub enum StatsCommand {
    /// Recent runs and worker-level aggregates for a workflow.
    Show(ShowArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    #[arg(long = "stats-db")]
    pub stats_db: PathBuf,
    #[arg(long)]
    pub workflow: String,
    #[arg(long, default_value_t = 10)]
    pub limit: u32,
}

pub fn execute(command: StatsCommand) -> Result<u8> {
    match command {
        StatsCommand::Show(args) => show(args),
    }
}

fn show(args: ShowArgs) -> Result<u8> {
    let stats = StatsStore::open(&args.stats_db)
        .with_context(|| format!("opening stats store '{}'", args.stats_db.display()))?;

    let runs = stats.list_runs(&args.workflow, args.limit)?;
    println!("runs for '{}' (most recent {}):", args.workflow, args.limit);
    for run_id in &runs {
        let status = stats.run_status(run_id)?.unwrap_or_else(|| "unknown".to_string());
        println!("  {} - {status}", run_id.as_str());
    }

    let aggregates = stats.worker_level_aggregates(&args.workflow)?;
    println!("worker-level aggregates:");
    for row in aggregates {
        println!(
            "  max_workers={} runs={} avg_wall_clock_s={:.1} avg_task_duration_s={:.1}",
            row.max_workers, row.run_count, row.avg_wall_clock_seconds, row.avg_task_duration_seconds
        );
    }

    Ok(EXIT_SUCCESS)
}
