use thiserror::Error;

use crate::ids::TaskId;

/// Load-time errors (spec §7: `invalid-format`, `schema-violation`, `cycle`,
/// `unknown-instance`).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid-format: {0}")]
    InvalidFormat(String),

    #[error("schema-violation: {0}")]
    SchemaViolation(String),

    #[error("cycle detected among tasks: {}", .0.iter().map(TaskId::as_str).collect::<Vec<_>>().join(" -> "))]
    Cycle(Vec<TaskId>),

    #[error("unknown-instance: task {task} references unknown instance '{instance}'")]
    UnknownInstance { task: TaskId, instance: String },

    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("predecessor id '{predecessor}' referenced by '{task}' does not exist")]
    UnknownPredecessor { task: TaskId, predecessor: TaskId },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Runtime (per-task execution) errors (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("remote-failure: {0}")]
    RemoteFailure(String),

    #[error("timeout after {0}s")]
    Timeout(u32),

    #[error("transport-error: {0}")]
    TransportError(String),

    #[error("cancelled")]
    Cancelled,
}

/// Resume-time errors (spec §7).
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("checkpoint-missing: {0}")]
    CheckpointMissing(String),

    #[error("checkpoint-corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("workflow-hash-mismatch: expected {expected}, found {found}")]
    WorkflowHashMismatch { expected: String, found: String },

    #[error("unsafe-in-progress: task '{0}' was in progress and is not safe_retry; supply --resume-from or --force")]
    UnsafeInProgress(TaskId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Persistence errors (spec §7) — always logged, never fatal to scheduling.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("stats-write-failed: {0}")]
    StatsWriteFailed(String),

    #[error("checkpoint-write-failed: {0}")]
    CheckpointWriteFailed(String),
}

/// Aggregated top-level error type. Components raise their own leaf error;
/// this exists only at the boundaries (CLI, cross-crate composition) that
/// need a single type.
#[derive(Debug, Error)]
pub enum RushtiError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
