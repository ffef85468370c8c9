//! `rushti resume`, grounded on `checkpoint.py`'s resume contract (spec
//! §4.4): reload a checkpoint, reject a tampered taskfile and in-progress
//! tasks without `safe_retry` unless `--force` or `--resume-from` says
//! otherwise, then continue the same DAG with already-resolved ids
//! preloaded rather than re-dispatched.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use rushti_checkpoint::{find_checkpoint_for_taskfile, load_checkpoint, CheckpointManager};
use rushti_core::{RunId, SchedulingAlgorithm, TaskId};
use rushti_dag::{build_dag, SkipReason, Status};
use rushti_estimator::{Estimator, EstimatorSettings};
use rushti_remote::http::HttpRemoteClient;
use rushti_remote::RemoteClient;
use rushti_scheduler::SchedulerConfig;
use rushti_stats::{RunCompletion, RunRecord, StatsStore};
use tokio_util::sync::CancellationToken;

use crate::commands::shared;
use crate::{ConnectionArgs, EXIT_FATAL, EXIT_RESUME_BLOCKED, EXIT_SUCCESS, EXIT_TASK_FAILURE};

#[derive(Args)]
pub struct ResumeArgs {
    #[arg(long)]
    pub tasks: PathBuf,
    /// Overrides the checkpoint file the resume-for-taskfile lookup would find.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Forces this specific in-progress task id back to runnable even if it
    /// is not `safe_retry`.
    #[arg(long)]
    pub resume_from: Option<String>,
    /// Bypasses the taskfile-hash-mismatch and unsafe-in-progress guards.
    #[arg(long)]
    pub force: bool,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

pub async fn execute(args: ResumeArgs) -> Result<u8> {
    let workflow = shared::load_workflow(&args.tasks)?;
    let name = shared::workflow_name(&workflow, &args.tasks);
    let mut settings = shared::load_layered_settings(&args.connection, &workflow)?;
    rushti_config::apply_cli_overrides(&mut settings, &rushti_config::CliOverrides::default());

    let checkpoint_dir = PathBuf::from(&settings.checkpoint.checkpoint_dir);
    let checkpoint_path = match &args.checkpoint {
        Some(path) => path.clone(),
        None => find_checkpoint_for_taskfile(&checkpoint_dir, &args.tasks)
            .with_context(|| format!("no checkpoint found for '{}' under '{}'", args.tasks.display(), checkpoint_dir.display()))?,
    };
    let mut checkpoint = load_checkpoint(&checkpoint_path).context("loading checkpoint")?;

    let (valid, warnings) = checkpoint.validate_against_taskfile(&args.tasks, !args.force)?;
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !valid {
        tracing::error!("checkpoint taskfile-hash mismatch; re-run with --force to resume anyway");
        return Ok(EXIT_RESUME_BLOCKED);
    }

    let mut safe_retry: BTreeMap<TaskId, bool> =
        workflow.tasks.iter().map(|t| (t.id.clone(), t.safe_retry)).collect();
    if let Some(resume_from) = &args.resume_from {
        safe_retry.insert(TaskId::from(resume_from.as_str()), true);
    }

    let plan = checkpoint.resume_plan(&safe_retry);
    if !plan.requiring_decision.is_empty() && !args.force {
        tracing::error!(
            tasks = ?plan.requiring_decision,
            "in-progress tasks are not safe_retry; pass --resume-from <id> or --force to proceed"
        );
        return Ok(EXIT_RESUME_BLOCKED);
    }

    let mut dag = build_dag(&workflow).context("rebuilding dependency graph")?;
    for task_id in &checkpoint.skipped_tasks {
        dag.mark_skipped(task_id, SkipReason::PredecessorFailed);
    }
    for (task_id, result) in &checkpoint.completed_tasks {
        if checkpoint.skipped_tasks.contains(task_id) {
            continue;
        }
        dag.preload_resolved(task_id, result.success);
        if !result.success {
            propagate_skips(&mut dag, task_id);
        }
    }

    let connections = shared::load_connections(&args.connection, &workflow)?;
    let stats_path = shared::default_stats_path(&settings);
    let stats = StatsStore::open(&stats_path).context("opening stats store")?;
    let run_id = RunId::from_timestamp(Utc::now());
    let start_time = Utc::now();
    stats
        .start_run(&RunRecord {
            run_id: run_id.clone(),
            workflow: name.clone(),
            taskfile_path: args.tasks.display().to_string(),
            start_time,
            max_workers: settings.defaults.max_workers,
            retries: settings.defaults.retries,
            result_file: None,
            exclusive: settings.exclusive_mode.enabled,
            optimize: workflow.settings.optimization_algorithm.is_some(),
            taskfile_name: workflow.metadata.name.clone(),
            taskfile_description: workflow.metadata.description.clone(),
            taskfile_author: workflow.metadata.author.clone(),
        })
        .context("recording resumed run start")?;

    let mut manager = CheckpointManager::new(
        &checkpoint_dir,
        &args.tasks,
        &name,
        &checkpoint.pending_tasks.iter().cloned().collect::<Vec<_>>(),
        Duration::from_secs(settings.checkpoint.checkpoint_interval),
        settings.checkpoint.enabled,
    )
    .context("re-initializing checkpoint manager")?;
    manager.checkpoint = Some(checkpoint);

    let mut estimator = Estimator::new(EstimatorSettings {
        lookback_runs: settings.optimization.lookback_runs,
        min_samples: settings.optimization.min_samples,
        time_of_day_weighting: settings.optimization.time_of_day_weighting,
        cache_duration: Duration::from_secs(settings.optimization.cache_duration_hours as u64 * 3600),
    });

    let remote: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(connections));
    let cancel = CancellationToken::new();

    let algorithm = workflow.settings.optimization_algorithm.unwrap_or(SchedulingAlgorithm::LongestFirst);
    let config = SchedulerConfig {
        workflow: name.clone(),
        run_id: run_id.clone(),
        max_workers: settings.defaults.max_workers,
        stage_workers: workflow.settings.stage_workers.clone(),
        retries: settings.defaults.retries,
        algorithm,
    };

    let summary =
        rushti_scheduler::run(&mut dag, remote, &stats, &mut manager, &mut estimator, &config, cancel).await;

    let duration = (Utc::now() - start_time).to_std().unwrap_or_default();
    let status = if summary.cancelled {
        "Aborted"
    } else if summary.fails > 0 {
        "Failed"
    } else {
        "Success"
    };
    stats
        .finish_run(
            &run_id,
            &RunCompletion {
                end_time: Utc::now(),
                duration_seconds: duration.as_secs_f64(),
                status: status.to_string(),
                task_count: dag.task_count() as u32,
                success_count: summary.executions.saturating_sub(summary.fails),
                failure_count: summary.fails,
            },
        )
        .context("recording resumed run completion")?;
    manager.cleanup(summary.fails == 0 && !summary.cancelled);

    if summary.cancelled {
        Ok(EXIT_FATAL)
    } else if summary.fails > 0 {
        Ok(EXIT_TASK_FAILURE)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

/// Re-derives the failure-propagation walk the live scheduler performs on a
/// fresh failure (spec §4.5), applied here to ids that were already
/// terminal in the reloaded checkpoint.
fn propagate_skips(dag: &mut rushti_dag::Dag, failed_id: &TaskId) {
    let mut queue: VecDeque<TaskId> = VecDeque::new();
    queue.push_back(failed_id.clone());
    while let Some(id) = queue.pop_front() {
        let successors: Vec<TaskId> = dag.successors(&id).cloned().collect();
        for succ in successors {
            if dag.status(&succ) != Status::Pending {
                continue;
            }
            let requires_guard =
                dag.instances(&succ).first().map(|t| t.require_predecessor_success).unwrap_or(false);
            if !requires_guard {
                continue;
            }
            let predecessor_failed = dag.predecessors(&succ).any(|p| dag.id_success(p) == Some(false));
            if !predecessor_failed {
                continue;
            }
            dag.mark_skipped(&succ, SkipReason::PredecessorFailed);
            queue.push_back(succ);
        }
    }
}
