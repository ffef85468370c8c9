//! The `rushti` binary. Wires every component crate together behind a
//! `clap` derive surface, grounded on `commands.py`'s subcommand set
//! (`build`/dashboard rendering dropped, out of core scope) and on
//! `Alb-O-xeno`'s/`seanchatmangpt-knhk`'s use of `clap` derive (the teacher
//! itself ships no CLI crate).

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Exit codes per spec: 0 success, 1 any failed task, 2 fatal error
/// (load/validate/scheduler), 3 resume blocked on unsafe in-progress tasks.
pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_TASK_FAILURE: u8 = 1;
pub const EXIT_FATAL: u8 = 2;
pub const EXIT_RESUME_BLOCKED: u8 = 3;

#[derive(Parser)]
#[command(name = "rushti", version, about = "Batch execution engine for analytics-server stored processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow file end to end.
    Run(commands::run::RunArgs),
    /// Resume a previously interrupted run from its checkpoint.
    Resume(commands::resume::ResumeArgs),
    /// Structurally validate a workflow file without running it.
    Validate(commands::validate::ValidateArgs),
    /// Materialize wildcard parameter expansions against the remote server.
    Expand(commands::expand::ExpandArgs),
    /// Run the contention optimizer over historical stats and emit a rewritten workflow.
    Optimize(commands::optimize::OptimizeArgs),
    /// Read-only queries over the stats store.
    Stats {
        #[command(subcommand)]
        command: commands::stats::StatsCommand,
    },
    /// Stats store retention maintenance.
    Db {
        #[command(subcommand)]
        command: commands::db::DbCommand,
    },
}

/// Shared flags for commands that connect to a remote server and load
/// settings (spec §6 precedence chain: CLI > workflow file > settings.toml
/// > built-in defaults).
#[derive(clap::Args, Clone, Debug)]
pub struct ConnectionArgs {
    /// Path to settings.toml. Defaults to the discovery order in rushti-config.
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Path to connections.toml. Defaults to config/connections.toml next to the cwd.
    #[arg(long)]
    pub connections: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Resume(args) => commands::resume::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Expand(args) => commands::expand::execute(args).await,
        Command::Optimize(args) => commands::optimize::execute(args),
        Command::Stats { command } => commands::stats::execute(command),
        Command::Db { command } => commands::db::execute(command),
    };

    let code = match code {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "rushti aborted with error");
            EXIT_FATAL
        }
    };
    ExitCode::from(code)
}
