//! v001: `runs` and `task_results` tables (column shapes grounded on the
//! queries in `db_admin.py`, which is the only surviving reference to the
//! original schema).

use rusqlite::Connection;

use crate::StatsError;

pub fn migrate(conn: &Connection) -> Result<(), StatsError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id                TEXT PRIMARY KEY,
            workflow              TEXT NOT NULL,
            taskfile_path         TEXT NOT NULL,
            start_time            TEXT NOT NULL,
            end_time              TEXT,
            duration_seconds      REAL,
            status                TEXT NOT NULL,
            task_count            INTEGER NOT NULL DEFAULT 0,
            success_count         INTEGER NOT NULL DEFAULT 0,
            failure_count         INTEGER NOT NULL DEFAULT 0,
            taskfile_name         TEXT,
            taskfile_description  TEXT,
            taskfile_author       TEXT,
            max_workers           INTEGER,
            retries               INTEGER,
            result_file           TEXT,
            exclusive             INTEGER NOT NULL DEFAULT 0,
            optimize              INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_runs_workflow_start
            ON runs(workflow, start_time);

        CREATE TABLE IF NOT EXISTS task_results (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id           TEXT NOT NULL,
            workflow         TEXT NOT NULL,
            task_id          TEXT NOT NULL,
            task_signature   TEXT NOT NULL,
            instance         TEXT NOT NULL,
            process          TEXT NOT NULL,
            parameters       TEXT NOT NULL DEFAULT '{}',
            status           TEXT NOT NULL,
            start_time       TEXT NOT NULL,
            end_time         TEXT,
            duration_seconds REAL,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            error_message    TEXT,
            predecessors     TEXT NOT NULL DEFAULT '[]',
            stage            TEXT,
            concurrent_count INTEGER,
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_task_results_run
            ON task_results(run_id);
        CREATE INDEX IF NOT EXISTS idx_task_results_workflow
            ON task_results(workflow);
        CREATE INDEX IF NOT EXISTS idx_task_results_signature
            ON task_results(task_signature, start_time);
        ",
    )?;
    Ok(())
}
