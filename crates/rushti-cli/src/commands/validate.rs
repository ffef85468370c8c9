//! `rushti validate` -- structural checks only (spec §6): ids unique,
//! predecessors resolve, no cycles, `max_workers` >= 1. No connectivity
//! probing against the analytics server.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use rushti_dag::build_dag;

use crate::commands::shared;
use crate::{EXIT_FATAL, EXIT_SUCCESS};

#[derive(Args)]
pub struct ValidateArgs {
    #[arg(long)]
    pub tasks: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<u8> {
    let workflow = match shared::load_workflow(&args.tasks) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "taskfile failed to load");
            return Ok(EXIT_FATAL);
        }
    };

    if workflow.settings.max_workers < 1 {
        tracing::error!("max_workers must be >= 1, got {}", workflow.settings.max_workers);
        return Ok(EXIT_FATAL);
    }

    match build_dag(&workflow) {
        Ok(dag) => {
            let instances: usize = dag.ids().map(|id| dag.instances(id).len()).sum();
            tracing::info!(
                tasks = dag.task_count(),
                instances,
                max_workers = workflow.settings.max_workers,
                "workflow is structurally valid"
            );
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            tracing::error!(error = %e, "workflow failed validation");
            Ok(EXIT_FATAL)
        }
    }
}
