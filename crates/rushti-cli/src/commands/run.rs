use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use rushti_checkpoint::CheckpointManager;
use rushti_core::{RunId, SchedulingAlgorithm};
use rushti_dag::build_dag;
use rushti_estimator::{Estimator, EstimatorSettings};
use rushti_remote::http::HttpRemoteClient;
use rushti_remote::RemoteClient;
use rushti_scheduler::SchedulerConfig;
use rushti_stats::{RunCompletion, RunRecord, StatsStore};
use tokio_util::sync::CancellationToken;

use crate::commands::shared;
use crate::{ConnectionArgs, EXIT_FATAL, EXIT_SUCCESS, EXIT_TASK_FAILURE};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow file (line-oriented or JSON).
    #[arg(long)]
    pub tasks: PathBuf,
    #[arg(long)]
    pub max_workers: Option<u32>,
    #[arg(long)]
    pub retries: Option<u32>,
    #[arg(long, value_enum)]
    pub optimize: Option<OptimizeAlgorithmArg>,
    #[arg(long)]
    pub result_file: Option<String>,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum OptimizeAlgorithmArg {
    LongestFirst,
    ShortestFirst,
}

impl From<OptimizeAlgorithmArg> for SchedulingAlgorithm {
    fn from(value: OptimizeAlgorithmArg) -> Self {
        match value {
            OptimizeAlgorithmArg::LongestFirst => SchedulingAlgorithm::LongestFirst,
            OptimizeAlgorithmArg::ShortestFirst => SchedulingAlgorithm::ShortestFirst,
        }
    }
}

pub async fn execute(args: RunArgs) -> Result<u8> {
    let workflow = shared::load_workflow(&args.tasks)?;
    let name = shared::workflow_name(&workflow, &args.tasks);

    let mut settings = shared::load_layered_settings(&args.connection, &workflow)?;
    rushti_config::apply_cli_overrides(
        &mut settings,
        &rushti_config::CliOverrides {
            max_workers: args.max_workers,
            retries: args.retries,
            result_file: args.result_file.clone(),
            mode: None,
        },
    );

    let connections = shared::load_connections(&args.connection, &workflow)?;

    let dag = build_dag(&workflow);
    let mut dag = match dag {
        Ok(dag) => dag,
        Err(e) => {
            tracing::error!(error = %e, "workflow failed to validate");
            return Ok(EXIT_FATAL);
        }
    };

    let algorithm = args
        .optimize
        .map(SchedulingAlgorithm::from)
        .or(workflow.settings.optimization_algorithm)
        .unwrap_or_default();

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
            result_file: if settings.defaults.result_file.is_empty() {
                None
            } else {
                Some(settings.defaults.result_file.clone())
            },
            exclusive: settings.exclusive_mode.enabled,
            optimize: workflow.settings.optimization_algorithm.is_some(),
            taskfile_name: workflow.metadata.name.clone(),
            taskfile_description: workflow.metadata.description.clone(),
            taskfile_author: workflow.metadata.author.clone(),
        })
        .context("recording run start")?;

    let task_ids: Vec<_> = dag.ids().cloned().collect();
    let mut checkpoint = CheckpointManager::new(
        std::path::Path::new(&settings.checkpoint.checkpoint_dir),
        &args.tasks,
        &name,
        &task_ids,
        Duration::from_secs(settings.checkpoint.checkpoint_interval),
        settings.checkpoint.enabled,
    )
    .context("initializing checkpoint manager")?;

    let mut estimator = Estimator::new(EstimatorSettings {
        lookback_runs: settings.optimization.lookback_runs,
        min_samples: settings.optimization.min_samples,
        time_of_day_weighting: settings.optimization.time_of_day_weighting,
        cache_duration: Duration::from_secs(settings.optimization.cache_duration_hours as u64 * 3600),
    });

    let remote: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(connections));
    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let config = SchedulerConfig {
        workflow: name.clone(),
        run_id: run_id.clone(),
        max_workers: settings.defaults.max_workers,
        stage_workers: workflow.settings.stage_workers.clone(),
        retries: settings.defaults.retries,
        algorithm,
    };

    let summary =
        rushti_scheduler::run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &config, cancel).await;

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
        .context("recording run completion")?;

    checkpoint.cleanup(summary.fails == 0 && !summary.cancelled);

    if !settings.defaults.result_file.is_empty() {
        let report = serde_json::json!({
            "run_id": run_id.as_str(),
            "workflow": name,
            "status": status,
            "executions": summary.executions,
            "fails": summary.fails,
            "skipped": summary.skipped,
            "duration_seconds": duration.as_secs_f64(),
        });
        std::fs::write(&settings.defaults.result_file, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing result file '{}'", settings.defaults.result_file))?;
    }

    tracing::info!(
        workflow = name,
        executions = summary.executions,
        fails = summary.fails,
        skipped = summary.skipped,
        "run complete"
    );

    if summary.cancelled {
        Ok(EXIT_FATAL)
    } else if summary.fails > 0 {
        Ok(EXIT_TASK_FAILURE)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling in-flight tasks");
            cancel.cancel();
        }
    });
}
