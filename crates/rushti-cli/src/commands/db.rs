//! `rushti db vacuum|clear` -- retention maintenance wrapping C4's deletion
//! helpers (spec §6).

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Subcommand};
use rushti_stats::StatsStore;

use crate::EXIT_SUCCESS;

#[derive(Subcommand)]
pub enum DbCommand {
    /// Reclaims disk space after a retention pass (`VACUUM`).
    Vacuum(VacuumArgs),
    /// Deletes run history, either before a cutoff date, for one workflow, or entirely.
    Clear(ClearArgs),
}

#[derive(Args)]
pub struct VacuumArgs {
    #[arg(long = "stats-db")]
    pub stats_db: PathBuf,
}

#[derive(Args)]
pub struct ClearArgs {
    #[arg(long = "stats-db")]
    pub stats_db: PathBuf,
    /// Restricts deletion to one workflow's runs; combine with `--before` or omit to clear all its history.
    #[arg(long)]
    pub workflow: Option<String>,
    /// Deletes runs that started before this date (YYYY-MM-DD).
    #[arg(long)]
    pub before: Option<NaiveDate>,
}

pub fn execute(command: DbCommand) -> Result<u8> {
    match command {
        DbCommand::Vacuum(args) => vacuum(args),
        DbCommand::Clear(args) => clear(args),
    }
}

fn vacuum(args: VacuumArgs) -> Result<u8> {
    let stats = StatsStore::open(&args.stats_db)
        .with_context(|| format!("opening stats store '{}'", args.stats_db.display()))?;
    stats.vacuum().context("vacuuming stats store")?;
    tracing::info!(stats_db = %args.stats_db.display(), "vacuum complete");
    Ok(EXIT_SUCCESS)
}

fn clear(args: ClearArgs) -> Result<u8> {
    let stats = StatsStore::open(&args.stats_db)
        .with_context(|| format!("opening stats store '{}'", args.stats_db.display()))?;

    let deleted = if let Some(before) = args.before {
        let today = Utc::now().date_naive();
        let retention_days = today.signed_duration_since(before).num_days().max(0) as u32;
        stats.apply_retention(retention_days).context("applying retention")?
    } else if let Some(workflow) = &args.workflow {
        stats.clear_workflow(workflow).context("clearing workflow history")?
    } else {
        stats.clear_all().context("clearing all history")?
    };

    tracing::info!(deleted, "stats rows removed");
    Ok(EXIT_SUCCESS)
}
