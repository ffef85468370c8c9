//! Helpers shared by every subcommand that loads a workflow and needs the
//! layered settings + connection descriptors to go with it (spec §6).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rushti_config::Settings;
use rushti_core::{ConnectionDescriptor, Workflow};

use crate::ConnectionArgs;

/// Reads and parses a workflow file, auto-detecting line vs JSON format.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading taskfile '{}'", path.display()))?;
    rushti_taskfile::parse_workflow(path, &contents)
        .with_context(|| format!("parsing taskfile '{}'", path.display()))
}

/// The name runs are grouped under in the stats/checkpoint stores:
/// `metadata.workflow` if set, else the taskfile's file stem.
pub fn workflow_name(workflow: &Workflow, taskfile_path: &Path) -> String {
    workflow.metadata.workflow.clone().unwrap_or_else(|| {
        taskfile_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string()
    })
}

pub fn instances_of(workflow: &Workflow) -> BTreeSet<String> {
    workflow.tasks.iter().map(|t| t.instance.clone()).collect()
}

/// Loads settings with the workflow's own `settings` block layered in
/// (precedence: CLI overrides applied later by the caller, workflow file
/// here, settings.toml as the base).
pub fn load_layered_settings(args: &ConnectionArgs, workflow: &Workflow) -> Result<Settings> {
    let mut settings = rushti_config::load_settings(args.settings.as_deref())
        .context("loading settings.toml")?;
    rushti_config::apply_workflow_settings(&mut settings, &workflow.settings);
    Ok(settings)
}

/// Loads `connections.toml` and drops instances the workflow never
/// references (spec §6). A missing file is not an error -- the run will
/// simply fail per-task with "unknown instance" once dispatched.
pub fn load_connections(args: &ConnectionArgs, workflow: &Workflow) -> Result<std::collections::BTreeMap<String, ConnectionDescriptor>> {
    let path = args.connections.clone().unwrap_or_else(|| PathBuf::from("config/connections.toml"));
    if !path.exists() {
        tracing::warn!(path = %path.display(), "connections.toml not found; remote calls will fail per unknown instance");
        return Ok(std::collections::BTreeMap::new());
    }
    let connections =
        rushti_config::load_connections(&path).with_context(|| format!("loading '{}'", path.display()))?;
    Ok(rushti_config::filter_for_workflow(connections, &instances_of(workflow)))
}

pub fn default_stats_path(settings: &Settings) -> PathBuf {
    if settings.stats.db_path.is_empty() {
        PathBuf::from(rushti_stats::DEFAULT_DB_PATH)
    } else {
        PathBuf::from(&settings.stats.db_path)
    }
}
