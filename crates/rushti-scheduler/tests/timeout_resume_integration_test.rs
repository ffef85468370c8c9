//! A task that times out writes a failed checkpoint entry; resuming from
//! that checkpoint with the run's own `safe_retry` flag preloads every
//! other already-resolved id via `Dag::preload_resolved` and re-dispatches
//! only the timed-out one (spec §4.4, §4.7).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rushti_checkpoint::{Checkpoint, CheckpointManager};
use rushti_core::{RunId, SchedulingAlgorithm, Task, TaskId};
use rushti_dag::{build::build_dag, Dag, Status};
use rushti_estimator::{Estimator, EstimatorSettings};
use rushti_remote::fake::{FakeRemoteClient, Script};
use rushti_remote::{ProcessOutcome, RemoteClient};
use rushti_scheduler::{run, SchedulerConfig};
use rushti_stats::StatsStore;
use tokio_util::sync::CancellationToken;
use rushti_core::{Workflow, WorkflowMetadata, WorkflowSettings, WorkflowMode};

fn task(id: &str, preds: &[&str], timeout: Option<u32>, safe_retry: bool) -> Task {
    Task {
        id: TaskId::from(id),
        instance: "srv01".into(),
        process: format!("proc_{id}"),
        parameters: BTreeMap::new(),
        predecessors: preds.iter().map(|p| TaskId::from(*p)).collect(),
        stage: None,
        require_predecessor_success: false,
        succeed_on_minor_errors: false,
        safe_retry,
        timeout,
        cancel_at_timeout: false,
    }
}

fn workflow(tasks: Vec<Task>) -> Workflow {
    Workflow {
        version: "1".to_string(),
        metadata: WorkflowMetadata { workflow: Some("wf".into()), ..Default::default() },
        settings: WorkflowSettings {
            max_workers: 4,
            retries: 0,
            result_file: None,
            mode: WorkflowMode::Norm,
            exclusive: false,
            optimization_algorithm: None,
            stage_order: Vec::new(),
            stage_workers: BTreeMap::new(),
        },
        tasks,
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        workflow: "wf".into(),
        run_id: RunId::from_timestamp(chrono::Utc::now()),
        max_workers: 4,
        stage_workers: BTreeMap::new(),
        retries: 0,
        algorithm: SchedulingAlgorithm::LongestFirst,
    }
}

#[tokio::test]
async fn timed_out_safe_retry_task_reruns_alone_after_resume() {
    let workflow = workflow(vec![
        task("A", &[], None, false),
        task("B", &[], Some(1), true),
    ]);

    // First attempt: A succeeds, B times out and exhausts its (zero) retry budget.
    let remote = FakeRemoteClient::new()
        .with_script("srv01", "proc_A", Script::Fixed(ProcessOutcome::success("OK")))
        .with_script("srv01", "proc_B", Script::NeverReturns);
    let remote: Arc<dyn RemoteClient> = Arc::new(remote);

    let mut dag = build_dag(&workflow).unwrap();
    let stats = StatsStore::open_in_memory().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let taskfile_path = tmp.path().join("wf.txt");
    std::fs::write(&taskfile_path, "dummy taskfile contents").unwrap();
    let ids: Vec<TaskId> = dag.ids().cloned().collect();
    let mut checkpoint = CheckpointManager::new(
        tmp.path(),
        &taskfile_path,
        "wf",
        &ids,
        Duration::from_secs(3600),
        true,
    )
    .unwrap();
    let mut estimator = Estimator::new(EstimatorSettings::default());

    let summary =
        run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &config(), CancellationToken::new()).await;

    assert_eq!(summary.fails, 1);
    assert_eq!(dag.status(&TaskId::from("A")), Status::Completed);
    assert_eq!(dag.status(&TaskId::from("B")), Status::Failed);

    let saved: Checkpoint = checkpoint.checkpoint.take().expect("checkpoint was enabled");
    assert!(!saved.completed_tasks.get(&TaskId::from("B")).unwrap().success);

    // Resume: rebuild the DAG, preload A's success, leave B pending for a retry.
    let mut resumed_dag = build_dag(&workflow).unwrap();
    for (task_id, result) in &saved.completed_tasks {
        if *task_id == TaskId::from("B") {
            continue;
        }
        resumed_dag.preload_resolved(task_id, result.success);
    }
    assert_eq!(resumed_dag.status(&TaskId::from("A")), Status::Completed);
    assert_eq!(resumed_dag.status(&TaskId::from("B")), Status::Pending);

    let remote = FakeRemoteClient::new()
        .with_script("srv01", "proc_B", Script::Fixed(ProcessOutcome::success("OK")));
    let remote: Arc<dyn RemoteClient> = Arc::new(remote);
    let mut resumed_checkpoint = CheckpointManager::new(
        tmp.path(),
        &taskfile_path,
        "wf",
        &[TaskId::from("B")],
        Duration::from_secs(3600),
        false,
    )
    .unwrap();
    let mut estimator = Estimator::new(EstimatorSettings::default());

    let resumed_summary = run(
        &mut resumed_dag,
        remote,
        &stats,
        &mut resumed_checkpoint,
        &mut estimator,
        &config(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(resumed_summary.executions, 1, "only B re-dispatches");
    assert_eq!(resumed_summary.fails, 0);
    assert_eq!(resumed_dag.status(&TaskId::from("B")), Status::Completed);
}
