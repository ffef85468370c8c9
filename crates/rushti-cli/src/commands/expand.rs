//! `rushti expand` -- materializes wildcard parameter expansions against the
//! remote server and writes out a taskfile with no wildcards left (spec §6).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rushti_remote::http::HttpRemoteClient;
use rushti_remote::RemoteClient;

use crate::commands::shared;
use crate::ConnectionArgs;

#[derive(Args)]
pub struct ExpandArgs {
    #[arg(long)]
    pub tasks: PathBuf,
    #[arg(long)]
    pub out: PathBuf,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

pub async fn execute(args: ExpandArgs) -> Result<u8> {
    let mut workflow = shared::load_workflow(&args.tasks)?;
    let connections = shared::load_connections(&args.connection, &workflow)?;
    let remote: HttpRemoteClient = HttpRemoteClient::new(connections);

    let mut expanded = Vec::with_capacity(workflow.tasks.len());
    for task in std::mem::take(&mut workflow.tasks) {
        let dyn_remote: &dyn RemoteClient = &remote;
        let siblings = rushti_taskfile::expand::expand_task(dyn_remote, task)
            .await
            .context("expanding wildcard parameters")?;
        expanded.extend(siblings);
    }
    workflow.tasks = expanded;

    let serialized = serde_json::to_string_pretty(&workflow).context("serializing expanded workflow")?;
    std::fs::write(&args.out, serialized)
        .with_context(|| format!("writing '{}'", args.out.display()))?;

    tracing::info!(
        tasks = workflow.tasks.len(),
        out = %args.out.display(),
        "wildcard expansion complete"
    );
    Ok(crate::EXIT_SUCCESS)
}
