//! C7: the scheduler. A single-owner event loop drives [`rushti_dag::Dag`]
//! while a bounded pool of workers executes ready tasks concurrently,
//! grounded on `rushti.py::work_through_tasks`'s wait-block/executor shape
//! generalized from block-synchronous wait groups into a full DAG scheduler
//! (spec §4.5). The DAG, checkpoint, and stats store are touched only from
//! this loop; workers hand results back through a [`tokio::task::JoinSet`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rushti_checkpoint::CheckpointManager;
use rushti_core::{compute_signature, InstanceKey, RunId, SchedulingAlgorithm, Task, TaskId};
use rushti_dag::{Dag, IdTransition, SkipReason, Status};
use rushti_estimator::Estimator;
use rushti_remote::RemoteClient;
use rushti_stats::{StatsStore, TaskResultRecord};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workflow: String,
    pub run_id: RunId,
    pub max_workers: u32,
    pub stage_workers: BTreeMap<String, u32>,
    pub retries: u32,
    pub algorithm: SchedulingAlgorithm,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub executions: u32,
    pub fails: u32,
    pub skipped: u32,
    pub cancelled: bool,
}

struct TaskCompletion {
    key: InstanceKey,
    task: Task,
    concurrent_count: u32,
    outcome: rushti_exec::ExecutionOutcome,
}

/// Runs `dag` to completion (or to cooperative cancellation). Owns the only
/// mutable handles to the DAG, checkpoint, and stats store for the duration
/// of the run; workers only ever see `&dyn RemoteClient` and a task clone.
pub async fn run(
    dag: &mut Dag,
    remote: Arc<dyn RemoteClient>,
    stats: &StatsStore,
    checkpoint: &mut CheckpointManager,
    estimator: &mut Estimator,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> RunSummary {
    let global = Arc::new(Semaphore::new(config.max_workers.max(1) as usize));
    let stage_semaphores: HashMap<String, Arc<Semaphore>> = config
        .stage_workers
        .iter()
        .map(|(stage, cap)| (stage.clone(), Arc::new(Semaphore::new((*cap).max(1) as usize))))
        .collect();

    let mut in_flight: JoinSet<TaskCompletion> = JoinSet::new();
    let mut summary = RunSummary::default();

    loop {
        if !cancel.is_cancelled() {
            dispatch_ready(
                dag,
                &remote,
                stats,
                estimator,
                config,
                &global,
                &stage_semaphores,
                &cancel,
                &mut in_flight,
            );
        }

        if in_flight.is_empty() {
            if dag.is_complete() || cancel.is_cancelled() {
                break;
            }
            // Nothing ready and nothing running, but the DAG isn't done:
            // every remaining id is blocked on a predecessor that will
            // never resolve. validate() during loading should have caught
            // cycles; this is a defensive stop rather than a silent hang.
            tracing::error!("scheduler stalled: no ready tasks and no workers in flight");
            break;
        }

        let Some(joined) = in_flight.join_next().await else { break };
        let completion = joined.expect("scheduler worker task panicked");
        apply_completion(dag, checkpoint, stats, config, completion, &mut summary);
    }

    if cancel.is_cancelled() {
        summary.cancelled = true;
    }
    summary.skipped = dag.ids().filter(|id| dag.status(id) == Status::Skipped).count() as u32;
    summary
}

#[allow(clippy::too_many_arguments)]
fn dispatch_ready(
    dag: &mut Dag,
    remote: &Arc<dyn RemoteClient>,
    stats: &StatsStore,
    estimator: &mut Estimator,
    config: &SchedulerConfig,
    global: &Arc<Semaphore>,
    stage_semaphores: &HashMap<String, Arc<Semaphore>>,
    cancel: &CancellationToken,
    in_flight: &mut JoinSet<TaskCompletion>,
) {
    let candidates: Vec<(InstanceKey, Task)> = dag
        .ready_tasks()
        .into_iter()
        .filter_map(|key| {
            let task = dag.instances(&key.id).get(key.expansion_index)?.clone();
            Some((key, task))
        })
        .collect();

    let ordered = estimator.order_ready_set(
        stats,
        candidates,
        |(_, task)| compute_signature(&task.instance, &task.process, &task.parameters),
        config.algorithm,
    );

    for (key, task) in ordered {
        let stage_permit = match task.stage.as_deref().and_then(|s| stage_semaphores.get(s)) {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => continue, // this stage is at capacity; try the next candidate
            },
            None => None,
        };

        let global_permit = match Arc::clone(global).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => break, // global pool exhausted; nothing else can dispatch this cycle
        };

        dag.mark_running(key.clone());
        let concurrent_count = dag.running_count() as u32;

        let remote = Arc::clone(remote);
        let retries = config.retries;
        let cancel = cancel.clone();
        let task_for_worker = task.clone();
        let key_for_worker = key.clone();

        in_flight.spawn(async move {
            let _stage_permit = stage_permit;
            let _global_permit = global_permit;
            let outcome = rushti_exec::execute_task(remote.as_ref(), &task_for_worker, retries, &cancel).await;
            TaskCompletion { key: key_for_worker, task: task_for_worker, concurrent_count, outcome }
        });
    }
}

fn apply_completion(
    dag: &mut Dag,
    checkpoint: &mut CheckpointManager,
    stats: &StatsStore,
    config: &SchedulerConfig,
    completion: TaskCompletion,
    summary: &mut RunSummary,
) {
    let TaskCompletion { key, task, concurrent_count, outcome } = completion;

    summary.executions += 1;
    if !outcome.success {
        summary.fails += 1;
    }
    let retry_count = outcome.attempts.saturating_sub(1);

    checkpoint.mark_completed(
        &key.id,
        outcome.success,
        outcome.duration.as_secs_f64(),
        retry_count,
        outcome.error_message.clone(),
    );

    let now = Utc::now();
    let started =
        chrono::Duration::from_std(outcome.duration).map(|d| now - d).unwrap_or(now);
    let record = TaskResultRecord {
        run_id: config.run_id.clone(),
        workflow: config.workflow.clone(),
        task_id: key.id.clone(),
        signature: compute_signature(&task.instance, &task.process, &task.parameters),
        instance: task.instance.clone(),
        process: task.process.clone(),
        parameters: serde_json::to_string(&task.parameters).unwrap_or_default(),
        success: outcome.success,
        start_time: started,
        end_time: now,
        duration_seconds: outcome.duration.as_secs_f64(),
        retry_count,
        error_message: outcome.error_message.clone(),
        predecessors: serde_json::to_string(&task.predecessors).unwrap_or_default(),
        stage: task.stage.clone(),
        concurrent_count,
    };
    // Ingestion never raises into the scheduler (spec §4.9); a write
    // failure is logged and the run proceeds with one missing sample.
    if let Err(e) = stats.record_task_result(&record) {
        tracing::warn!(error = %e, task_id = %key.id, "stats-write-failed");
    }

    if let IdTransition::Resolved { id, success } = dag.mark_complete(key, outcome.success) {
        if !success {
            propagate_skips(dag, &id, checkpoint);
        }
    }
}

/// Walks descendants of a freshly-failed id, skipping every descendant whose
/// own `require_predecessor_success` is set and that has a failed
/// predecessor, then continues the walk from each id just skipped — a
/// skipped id's result is false too, so it can trigger further skips down
/// the chain (spec §4.5: "propagate transitively").
fn propagate_skips(dag: &mut Dag, failed_id: &TaskId, checkpoint: &mut CheckpointManager) {
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
            checkpoint.mark_skipped(&succ, "predecessor_failed");
            queue.push_back(succ);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushti_remote::fake::{FakeRemoteClient, Script};
    use rushti_remote::ProcessOutcome;
    use std::path::Path;
    use std::time::Duration;

    fn task(id: &str, preds: &[&str], require_guard: bool) -> Task {
        Task {
            id: TaskId::from(id),
            instance: "srv01".into(),
            process: format!("proc_{id}"),
            parameters: BTreeMap::new(),
            predecessors: preds.iter().map(|p| TaskId::from(*p)).collect(),
            stage: None,
            require_predecessor_success: require_guard,
            succeed_on_minor_errors: false,
            safe_retry: false,
            timeout: None,
            cancel_at_timeout: false,
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            workflow: "wf".into(),
            run_id: RunId::new("run1"),
            max_workers: 4,
            stage_workers: BTreeMap::new(),
            retries: 0,
            algorithm: SchedulingAlgorithm::LongestFirst,
        }
    }

    fn manager(dir: &Path, ids: &[TaskId]) -> CheckpointManager {
        CheckpointManager::new(dir, &dir.join("wf.txt"), "wf", ids, Duration::from_secs(3600), false).unwrap()
    }

    #[tokio::test]
    async fn two_independent_tasks_both_run() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &[], false));
        dag.add_task(task("B", &[], false));
        dag.validate().unwrap();

        let remote: Arc<dyn RemoteClient> = Arc::new(
            FakeRemoteClient::new()
                .with_script("srv01", "proc_A", Script::Fixed(ProcessOutcome::success("OK")))
                .with_script("srv01", "proc_B", Script::Fixed(ProcessOutcome::success("OK"))),
        );
        let stats = StatsStore::open_in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut checkpoint = manager(tmp.path(), &[TaskId::from("A"), TaskId::from("B")]);
        let mut estimator = Estimator::new(rushti_estimator::EstimatorSettings::default());

        let summary =
            run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &config(), CancellationToken::new()).await;

        assert_eq!(summary.executions, 2);
        assert_eq!(summary.fails, 0);
        assert!(dag.is_complete());
    }

    #[tokio::test]
    async fn failure_propagates_through_guarded_descendants() {
        // A (fails) -> B (guarded) -> C (guarded); D has no guard and still runs.
        let mut dag = Dag::new();
        dag.add_task(task("A", &[], false));
        dag.add_task(task("B", &["A"], true));
        dag.add_task(task("C", &["B"], true));
        dag.add_task(task("D", &["A"], false));
        dag.validate().unwrap();

        let remote: Arc<dyn RemoteClient> = Arc::new(
            FakeRemoteClient::new()
                .with_script("srv01", "proc_A", Script::Fixed(ProcessOutcome::failure("Error", "E1")))
                .with_script("srv01", "proc_D", Script::Fixed(ProcessOutcome::success("OK"))),
        );
        let stats = StatsStore::open_in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let ids = [TaskId::from("A"), TaskId::from("B"), TaskId::from("C"), TaskId::from("D")];
        let mut checkpoint = manager(tmp.path(), &ids);
        let mut estimator = Estimator::new(rushti_estimator::EstimatorSettings::default());

        let summary =
            run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &config(), CancellationToken::new()).await;

        assert_eq!(dag.status(&TaskId::from("A")), Status::Failed);
        assert_eq!(dag.status(&TaskId::from("B")), Status::Skipped);
        assert_eq!(dag.status(&TaskId::from("C")), Status::Skipped);
        assert_eq!(dag.status(&TaskId::from("D")), Status::Completed);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn stage_cap_bounds_concurrency_within_stage() {
        let mut dag = Dag::new();
        for i in 0..6 {
            let mut t = task(&format!("T{i}"), &[], false);
            t.stage = Some("extract".into());
            t.process = "proc_slow".into();
            dag.add_task(t);
        }
        dag.validate().unwrap();

        let remote: Arc<dyn RemoteClient> = Arc::new(
            FakeRemoteClient::new().with_script("srv01", "proc_slow", Script::Fixed(ProcessOutcome::success("OK"))),
        );
        let stats = StatsStore::open_in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let ids: Vec<TaskId> = (0..6).map(|i| TaskId::from(format!("T{i}"))).collect();
        let mut checkpoint = manager(tmp.path(), &ids);
        let mut estimator = Estimator::new(rushti_estimator::EstimatorSettings::default());

        let mut cfg = config();
        cfg.max_workers = 6;
        cfg.stage_workers.insert("extract".into(), 2);

        let summary =
            run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &cfg, CancellationToken::new()).await;

        assert_eq!(summary.executions, 6);
        assert_eq!(summary.fails, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_drains_in_flight() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &[], false));
        dag.validate().unwrap();

        let remote: Arc<dyn RemoteClient> = Arc::new(
            FakeRemoteClient::new().with_script("srv01", "proc_A", Script::NeverReturns),
        );
        let stats = StatsStore::open_in_memory().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut checkpoint = manager(tmp.path(), &[TaskId::from("A")]);
        let mut estimator = Estimator::new(rushti_estimator::EstimatorSettings::default());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary =
            run(&mut dag, remote, &stats, &mut checkpoint, &mut estimator, &config(), cancel).await;

        assert!(summary.cancelled);
    }
}
