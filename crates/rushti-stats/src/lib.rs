//! C4: the stats store. Embedded, durable, single-writer (spec §4.3),
//! grounded on `cortex-storage`'s rusqlite-backed migration pattern and the
//! query shapes surviving in `db_admin.py`.

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rushti_core::{RunId, Signature, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DB_PATH: &str = "data/stats.db";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow: String,
    pub taskfile_path: String,
    pub start_time: DateTime<Utc>,
    pub max_workers: u32,
    pub retries: u32,
    pub result_file: Option<String>,
    pub exclusive: bool,
    pub optimize: bool,
    pub taskfile_name: Option<String>,
    pub taskfile_description: Option<String>,
    pub taskfile_author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: String,
    pub task_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
}

#[derive(Debug, Clone)]
pub struct TaskResultRecord {
    pub run_id: RunId,
    pub workflow: String,
    pub task_id: TaskId,
    pub signature: Signature,
    pub instance: String,
    pub process: String,
    pub parameters: String,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub predecessors: String,
    pub stage: Option<String>,
    pub concurrent_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerLevelAggregate {
    pub max_workers: u32,
    pub run_count: u32,
    pub avg_wall_clock_seconds: f64,
    pub avg_task_duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrentCountBucket {
    pub concurrent_count: u32,
    pub sample_count: u32,
    pub avg_duration_seconds: f64,
}

/// Wraps a single rusqlite `Connection`. Not `Sync`; callers serialize
/// access behind a single writer task (spec §4.3: "single-writer").
pub struct StatsStore {
    conn: Connection,
}

impl StatsStore {
    pub fn open(path: &Path) -> Result<Self, StatsError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StatsError> {
        let mut conn = Connection::open_in_memory()?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn start_run(&self, run: &RunRecord) -> Result<(), StatsError> {
        self.conn.execute(
            "INSERT INTO runs (run_id, workflow, taskfile_path, start_time, status, max_workers,
                retries, result_file, exclusive, optimize, taskfile_name, taskfile_description, taskfile_author)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.run_id.as_str(),
                run.workflow,
                run.taskfile_path,
                run.start_time.to_rfc3339(),
                run.max_workers,
                run.retries,
                run.result_file,
                run.exclusive,
                run.optimize,
                run.taskfile_name,
                run.taskfile_description,
                run.taskfile_author,
            ],
        )?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &RunId, completion: &RunCompletion) -> Result<(), StatsError> {
        self.conn.execute(
            "UPDATE runs SET end_time = ?1, duration_seconds = ?2, status = ?3,
                task_count = ?4, success_count = ?5, failure_count = ?6 WHERE run_id = ?7",
            params![
                completion.end_time.to_rfc3339(),
                completion.duration_seconds,
                completion.status,
                completion.task_count,
                completion.success_count,
                completion.failure_count,
                run_id.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn record_task_result(&self, record: &TaskResultRecord) -> Result<(), StatsError> {
        self.conn.execute(
            "INSERT INTO task_results (run_id, workflow, task_id, task_signature, instance, process,
                parameters, status, start_time, end_time, duration_seconds, retry_count, error_message,
                predecessors, stage, concurrent_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.run_id.as_str(),
                record.workflow,
                record.task_id.as_str(),
                record.signature.as_str(),
                record.instance,
                record.process,
                record.parameters,
                if record.success { "Success" } else { "Error" },
                record.start_time.to_rfc3339(),
                record.end_time.to_rfc3339(),
                record.duration_seconds,
                record.retry_count,
                record.error_message,
                record.predecessors,
                record.stage,
                record.concurrent_count,
            ],
        )?;
        Ok(())
    }

    /// Concurrent-count as of this instant: rows started but not yet
    /// completed are not tracked in SQL, so the caller (scheduler) passes
    /// its own in-flight worker count; this helper exists for callers that
    /// want it derived from already-persisted rows within a run instead.
    pub fn running_count_for_run(&self, run_id: &RunId) -> Result<u32, StatsError> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM task_results WHERE run_id = ?1 AND end_time IS NULL",
            params![run_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Last N successful durations for a signature, newest first (spec §4.3 /
    /// used by C6's EWMA estimator).
    pub fn recent_durations(&self, signature: &Signature, limit: u32) -> Result<Vec<f64>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT duration_seconds FROM task_results
             WHERE task_signature = ?1 AND status = 'Success' AND duration_seconds IS NOT NULL
             ORDER BY start_time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![signature.as_str(), limit], |row| row.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn signatures_for_workflow(&self, workflow: &str) -> Result<Vec<Signature>, StatsError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT task_signature FROM task_results WHERE workflow = ?1")?;
        let rows = stmt
            .query_map(params![workflow], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(Signature::from_trusted_hex).collect())
    }

    pub fn rows_for_run(&self, run_id: &RunId) -> Result<Vec<TaskResultRow>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, task_signature, instance, process, status, start_time, end_time,
                duration_seconds, retry_count, error_message, stage, concurrent_count
             FROM task_results WHERE run_id = ?1 ORDER BY start_time",
        )?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(TaskResultRow {
                    task_id: TaskId::from(row.get::<_, String>(0)?),
                    signature: row.get(1)?,
                    instance: row.get(2)?,
                    process: row.get(3)?,
                    status: row.get(4)?,
                    start_time: row.get(5)?,
                    end_time: row.get(6)?,
                    duration_seconds: row.get(7)?,
                    retry_count: row.get(8)?,
                    error_message: row.get(9)?,
                    stage: row.get(10)?,
                    concurrent_count: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-worker-level aggregates (spec §4.3, feeds C10's worker-count
    /// recommendation).
    pub fn worker_level_aggregates(&self, workflow: &str) -> Result<Vec<WorkerLevelAggregate>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.max_workers, COUNT(*) as run_count, AVG(r.duration_seconds) as avg_wall_clock,
                (SELECT AVG(duration_seconds) FROM task_results t WHERE t.run_id = r.run_id) as avg_task_duration
             FROM runs r WHERE r.workflow = ?1 AND r.max_workers IS NOT NULL
             GROUP BY r.max_workers ORDER BY r.max_workers",
        )?;
        let rows = stmt
            .query_map(params![workflow], |row| {
                Ok(WorkerLevelAggregate {
                    max_workers: row.get(0)?,
                    run_count: row.get(1)?,
                    avg_wall_clock_seconds: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    avg_task_duration_seconds: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Concurrent-count distribution within a run (spec §4.3, feeds C10's
    /// contention analysis).
    pub fn concurrent_count_distribution(&self, run_id: &RunId) -> Result<Vec<ConcurrentCountBucket>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT concurrent_count, COUNT(*) as sample_count, AVG(duration_seconds) as avg_duration
             FROM task_results WHERE run_id = ?1 AND concurrent_count IS NOT NULL
             GROUP BY concurrent_count ORDER BY concurrent_count",
        )?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(ConcurrentCountBucket {
                    concurrent_count: row.get(0)?,
                    sample_count: row.get(1)?,
                    avg_duration_seconds: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent `Success` run for a workflow, used by C10 to pull the
    /// task/parameter layout it reorders (spec §4.10 step "most recent run").
    pub fn most_recent_successful_run(&self, workflow: &str) -> Result<Option<RunId>, StatsError> {
        let run_id = self
            .conn
            .query_row(
                "SELECT run_id FROM runs WHERE workflow = ?1 AND status = 'Success'
                 ORDER BY start_time DESC LIMIT 1",
                params![workflow],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(run_id.map(RunId::new))
    }

    /// Task id, signature, process, and decoded parameters for every row in
    /// a run, used by C10's contention-driver and fan-out grouping.
    pub fn task_params_for_run(&self, run_id: &RunId) -> Result<Vec<TaskParamRow>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, task_signature, process, parameters FROM task_results WHERE run_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(task_id, signature, process, parameters_json)| {
                let parameters: BTreeMap<String, String> =
                    if parameters_json.is_empty() { BTreeMap::new() } else { serde_json::from_str(&parameters_json)? };
                Ok(TaskParamRow { task_id: TaskId::from(task_id), signature: Signature::from_trusted_hex(signature), process, parameters })
            })
            .collect()
    }

    /// One row per `Success` run, newest first, used by C10's concurrency
    /// ceiling / scale-up detector to compare wall-clock across worker
    /// levels.
    pub fn successful_run_levels(&self, workflow: &str) -> Result<Vec<RunLevel>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, max_workers, duration_seconds FROM runs
             WHERE workflow = ?1 AND status = 'Success' AND max_workers IS NOT NULL
                AND duration_seconds IS NOT NULL
             ORDER BY start_time DESC",
        )?;
        let rows = stmt
            .query_map(params![workflow], |row| {
                Ok(RunLevel {
                    run_id: RunId::new(row.get::<_, String>(0)?),
                    max_workers: row.get(1)?,
                    wall_clock_seconds: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Aggregate task-duration statistics for one run (total/avg/count),
    /// used to compute effective parallelism in C10's ceiling detector.
    pub fn run_task_aggregate(&self, run_id: &RunId) -> Result<Option<TaskAggregate>, StatsError> {
        let row = self
            .conn
            .query_row(
                "SELECT SUM(duration_seconds), AVG(duration_seconds), COUNT(*) FROM task_results
                 WHERE run_id = ?1 AND duration_seconds IS NOT NULL",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(total, avg, count)| {
            if count == 0 {
                return None;
            }
            Some(TaskAggregate { total_duration_seconds: total.unwrap_or(0.0), avg_duration_seconds: avg.unwrap_or(0.0), task_count: count })
        }))
    }

    /// Per-task `(concurrent_count, duration_seconds)` pairs for one run,
    /// used by C10's single-run Pearson-correlation ceiling check.
    pub fn per_task_concurrency(&self, run_id: &RunId) -> Result<Vec<(u32, f64)>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT concurrent_count, duration_seconds FROM task_results
             WHERE run_id = ?1 AND concurrent_count IS NOT NULL AND duration_seconds IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_workflows(&self) -> Result<Vec<String>, StatsError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT workflow FROM task_results ORDER BY workflow")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_runs(&self, workflow: &str, limit: u32) -> Result<Vec<RunId>, StatsError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id FROM runs WHERE workflow = ?1 ORDER BY start_time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![workflow, limit], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(RunId::new).collect())
    }

    /// Deletes rows older than `retention_days`, run on open (spec §4.3).
    pub fn apply_retention(&self, retention_days: u32) -> Result<u64, StatsError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let deleted = self.conn.execute(
            "DELETE FROM task_results WHERE start_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        self.conn
            .execute("DELETE FROM runs WHERE start_time < ?1", params![cutoff.to_rfc3339()])?;
        Ok(deleted as u64)
    }

    pub fn clear_workflow(&self, workflow: &str) -> Result<u64, StatsError> {
        let deleted = self
            .conn
            .execute("DELETE FROM task_results WHERE workflow = ?1", params![workflow])?;
        self.conn.execute("DELETE FROM runs WHERE workflow = ?1", params![workflow])?;
        Ok(deleted as u64)
    }

    pub fn clear_all(&self) -> Result<u64, StatsError> {
        let deleted = self.conn.execute("DELETE FROM task_results", [])?;
        self.conn.execute("DELETE FROM runs", [])?;
        Ok(deleted as u64)
    }

    pub fn vacuum(&self) -> Result<(), StatsError> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn total_records(&self) -> Result<u64, StatsError> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM task_results", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn run_status(&self, run_id: &RunId) -> Result<Option<String>, StatsError> {
        let status = self
            .conn
            .query_row("SELECT status FROM runs WHERE run_id = ?1", params![run_id.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskParamRow {
    pub task_id: TaskId,
    pub signature: Signature,
    pub process: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLevel {
    pub run_id: RunId,
    pub max_workers: u32,
    pub wall_clock_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskAggregate {
    pub total_duration_seconds: f64,
    pub avg_duration_seconds: f64,
    pub task_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResultRow {
    pub task_id: TaskId,
    pub signature: String,
    pub instance: String,
    pub process: String,
    pub status: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: Option<f64>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub stage: Option<String>,
    pub concurrent_count: Option<u32>,
}
