//! C5: the checkpoint store. Atomic JSON snapshots of run progress for
//! resume, grounded 1:1 on `checkpoint.py`'s `Checkpoint`/`CheckpointManager`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rushti_core::{ResumeError, TaskId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FILE_HASH_CHUNK_SIZE: usize = 8192;
const CHECKPOINT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    pub duration_seconds: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Execution-state checkpoint for resume capability (spec §4.4 / §3). The
/// four id-sets (`completed`, `in_progress`, `pending`, `skipped`) partition
/// the task-id universe of the workflow at all times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(default = "default_version")]
    pub version: String,
    pub taskfile_path: PathBuf,
    pub workflow: String,
    pub taskfile_hash: String,
    pub run_started: DateTime<Utc>,
    pub checkpoint_created: DateTime<Utc>,
    pub total_tasks: usize,
    pub completed_tasks: BTreeMap<TaskId, TaskResult>,
    pub in_progress_tasks: BTreeSet<TaskId>,
    pub pending_tasks: BTreeSet<TaskId>,
    pub failed_tasks: BTreeSet<TaskId>,
    pub skipped_tasks: BTreeSet<TaskId>,
}

fn default_version() -> String {
    CHECKPOINT_FORMAT_VERSION.to_string()
}

impl Checkpoint {
    pub fn create(taskfile_path: &Path, workflow: &str, task_ids: &[TaskId]) -> Result<Self, ResumeError> {
        let taskfile_hash = compute_file_hash(taskfile_path)?;
        let now = Utc::now();
        Ok(Self {
            version: CHECKPOINT_FORMAT_VERSION.to_string(),
            taskfile_path: taskfile_path.to_path_buf(),
            workflow: workflow.to_string(),
            taskfile_hash,
            run_started: now,
            checkpoint_created: now,
            total_tasks: task_ids.len(),
            completed_tasks: BTreeMap::new(),
            in_progress_tasks: BTreeSet::new(),
            pending_tasks: task_ids.iter().cloned().collect(),
            failed_tasks: BTreeSet::new(),
            skipped_tasks: BTreeSet::new(),
        })
    }

    pub fn mark_running(&mut self, task_id: &TaskId) {
        self.pending_tasks.remove(task_id);
        self.in_progress_tasks.insert(task_id.clone());
        self.checkpoint_created = Utc::now();
    }

    pub fn mark_completed(
        &mut self,
        task_id: &TaskId,
        success: bool,
        duration_seconds: f64,
        retry_count: u32,
        error_message: Option<String>,
    ) {
        self.in_progress_tasks.remove(task_id);
        self.pending_tasks.remove(task_id);
        self.completed_tasks.insert(
            task_id.clone(),
            TaskResult {
                task_id: task_id.clone(),
                success,
                duration_seconds,
                retry_count,
                error_message,
                completed_at: Utc::now(),
            },
        );
        if !success {
            self.failed_tasks.insert(task_id.clone());
        }
        self.checkpoint_created = Utc::now();
    }

    /// Marks a task skipped (e.g. a predecessor failed); recorded as a
    /// completed-with-failure result so stats/checkpoint consumers see one
    /// consistent outcome record per task.
    pub fn mark_skipped(&mut self, task_id: &TaskId, reason: &str) {
        self.pending_tasks.remove(task_id);
        self.in_progress_tasks.remove(task_id);
        self.skipped_tasks.insert(task_id.clone());
        self.completed_tasks.insert(
            task_id.clone(),
            TaskResult {
                task_id: task_id.clone(),
                success: false,
                duration_seconds: 0.0,
                retry_count: 0,
                error_message: Some(format!("Skipped: {reason}")),
                completed_at: Utc::now(),
            },
        );
        self.checkpoint_created = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.pending_tasks.is_empty() && self.in_progress_tasks.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.completed_tasks.values().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.failed_tasks.len()
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        (self.completed_tasks.len() as f64 / self.total_tasks as f64) * 100.0
    }

    /// Derives the resume plan: tasks safe to run outright, and in-progress
    /// tasks whose `safe_retry` flag is false and therefore require a
    /// caller decision (spec §4.4).
    pub fn resume_plan(&self, safe_retry: &BTreeMap<TaskId, bool>) -> ResumePlan {
        let mut tasks_to_run: BTreeSet<TaskId> = self.pending_tasks.clone();
        let mut requiring_decision = BTreeSet::new();

        for task_id in &self.in_progress_tasks {
            if *safe_retry.get(task_id).unwrap_or(&false) {
                tasks_to_run.insert(task_id.clone());
            } else {
                requiring_decision.insert(task_id.clone());
            }
        }

        ResumePlan { tasks_to_run, requiring_decision }
    }

    /// Validates this checkpoint's recorded taskfile hash against the
    /// current file's contents. Returns warnings even when valid (e.g. path
    /// mismatch); callers decide whether a `strict` mismatch blocks resume.
    pub fn validate_against_taskfile(
        &self,
        taskfile_path: &Path,
        strict: bool,
    ) -> Result<(bool, Vec<String>), ResumeError> {
        let mut warnings = Vec::new();
        let mut is_valid = true;

        let current_hash = compute_file_hash(taskfile_path)?;
        if current_hash != self.taskfile_hash {
            let msg = format!(
                "Taskfile has been modified since checkpoint was created. Original hash: {}..., current hash: {}...",
                &self.taskfile_hash[..8.min(self.taskfile_hash.len())],
                &current_hash[..8.min(current_hash.len())]
            );
            if strict {
                is_valid = false;
                warnings.push(format!("ERROR: {msg}"));
            } else {
                warnings.push(format!("WARNING: {msg}"));
            }
        }

        Ok((is_valid, warnings))
    }
}

pub struct ResumePlan {
    pub tasks_to_run: BTreeSet<TaskId>,
    pub requiring_decision: BTreeSet<TaskId>,
}

fn compute_file_hash(path: &Path) -> Result<String, ResumeError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; FILE_HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Atomic save: write to a sibling temp file, then rename. `std::fs::rename`
/// is atomic on POSIX filesystems; no delete-before-rename fallback is
/// implemented (spec §9 flags that fallback itself as the non-atomic path).
pub fn save_checkpoint(checkpoint: &Checkpoint, path: &Path) -> Result<(), ResumeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_path = parent.to_path_buf();
    temp_path.push(format!(".checkpoint_{}.tmp", std::process::id()));

    let json = serde_json::to_string_pretty(checkpoint)?;
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint, ResumeError> {
    if !path.exists() {
        return Err(ResumeError::CheckpointMissing(path.display().to_string()));
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| ResumeError::CheckpointCorrupt(e.to_string()))
}

pub fn delete_checkpoint(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        fs::remove_file(path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Sanitizes a workflow name into the standard `checkpoint_<workflow>.json`
/// filename.
pub fn checkpoint_path(checkpoint_dir: &Path, workflow: &str) -> PathBuf {
    let safe: String = workflow
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    checkpoint_dir.join(format!("checkpoint_{safe}.json"))
}

pub fn find_checkpoint_for_taskfile(
    checkpoint_dir: &Path,
    taskfile_path: &Path,
) -> Option<PathBuf> {
    if !checkpoint_dir.exists() {
        return None;
    }
    let target = taskfile_path.canonicalize().ok()?;
    let entries = fs::read_dir(checkpoint_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("checkpoint_") && n.ends_with(".json"))
            .unwrap_or(false);
        if !is_checkpoint {
            continue;
        }
        if let Ok(checkpoint) = load_checkpoint(&path) {
            if let Ok(canonical) = checkpoint.taskfile_path.canonicalize() {
                if canonical == target {
                    return Some(path);
                }
            }
        }
    }
    None
}

/// Drives periodic + on-completion checkpoint saves during a run. A save
/// failure is logged, never propagated into the scheduler (spec §4.3 /
/// persistence-error rule).
pub struct CheckpointManager {
    enabled: bool,
    path: PathBuf,
    interval: Duration,
    last_save: Instant,
    pub checkpoint: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(
        checkpoint_dir: &Path,
        taskfile_path: &Path,
        workflow: &str,
        task_ids: &[TaskId],
        interval: Duration,
        enabled: bool,
    ) -> Result<Self, ResumeError> {
        let path = checkpoint_path(checkpoint_dir, workflow);
        let checkpoint = if enabled {
            let checkpoint = Checkpoint::create(taskfile_path, workflow, task_ids)?;
            Some(checkpoint)
        } else {
            None
        };
        let mut manager = Self { enabled, path, interval, last_save: Instant::now(), checkpoint };
        if enabled {
            manager.save_now();
        }
        Ok(manager)
    }

    pub fn mark_running(&mut self, task_id: &TaskId) {
        let Some(checkpoint) = self.checkpoint.as_mut() else { return };
        checkpoint.mark_running(task_id);
        self.maybe_save();
    }

    pub fn mark_completed(
        &mut self,
        task_id: &TaskId,
        success: bool,
        duration_seconds: f64,
        retry_count: u32,
        error_message: Option<String>,
    ) {
        let Some(checkpoint) = self.checkpoint.as_mut() else { return };
        checkpoint.mark_completed(task_id, success, duration_seconds, retry_count, error_message);
        self.save_now();
    }

    pub fn mark_skipped(&mut self, task_id: &TaskId, reason: &str) {
        let Some(checkpoint) = self.checkpoint.as_mut() else { return };
        checkpoint.mark_skipped(task_id, reason);
        self.maybe_save();
    }

    fn maybe_save(&mut self) {
        if self.last_save.elapsed() >= self.interval {
            self.save_now();
        }
    }

    fn save_now(&mut self) {
        let Some(checkpoint) = self.checkpoint.as_ref() else { return };
        if let Err(e) = save_checkpoint(checkpoint, &self.path) {
            tracing::warn!(error = %e, path = %self.path.display(), "checkpoint-write-failed");
        } else {
            self.last_save = Instant::now();
        }
    }

    pub fn force_save(&mut self) {
        self.save_now();
    }

    /// On success, deletes the checkpoint; on failure, retains it and
    /// ensures final state is saved (spec §4.4).
    pub fn cleanup(&mut self, success: bool) {
        if !self.enabled {
            return;
        }
        if success {
            let _ = delete_checkpoint(&self.path);
        } else {
            self.save_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn save_and_load_round_trip_preserves_partitioning() {
        let tmp = tempfile::tempdir().unwrap();
        let taskfile = write_temp_file(tmp.path(), "tasks.txt", "instance=\"a\" process=\"b\"\n");
        let ids = vec![TaskId::from("A"), TaskId::from("B"), TaskId::from("C")];
        let mut checkpoint = Checkpoint::create(&taskfile, "wf1", &ids).unwrap();
        checkpoint.mark_running(&TaskId::from("A"));
        checkpoint.mark_completed(&TaskId::from("B"), true, 1.5, 0, None);

        let path = tmp.path().join("checkpoint.json");
        save_checkpoint(&checkpoint, &path).unwrap();
        let loaded = load_checkpoint(&path).unwrap();

        assert_eq!(loaded.in_progress_tasks, checkpoint.in_progress_tasks);
        assert_eq!(loaded.pending_tasks, checkpoint.pending_tasks);
        assert_eq!(loaded.completed_tasks.len(), 1);

        let universe: BTreeSet<TaskId> = ids.into_iter().collect();
        let mut partitioned: BTreeSet<TaskId> = BTreeSet::new();
        partitioned.extend(loaded.completed_tasks.keys().cloned());
        partitioned.extend(loaded.in_progress_tasks.iter().cloned());
        partitioned.extend(loaded.pending_tasks.iter().cloned());
        assert_eq!(partitioned, universe);
    }

    #[test]
    fn hash_mismatch_is_strict_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let taskfile = write_temp_file(tmp.path(), "tasks.txt", "v1");
        let checkpoint = Checkpoint::create(&taskfile, "wf1", &[TaskId::from("A")]).unwrap();

        write_temp_file(tmp.path(), "tasks.txt", "v2-modified");
        let (is_valid, warnings) = checkpoint.validate_against_taskfile(&taskfile, true).unwrap();
        assert!(!is_valid);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn safe_retry_moves_in_progress_tasks_back_to_runnable() {
        let tmp = tempfile::tempdir().unwrap();
        let taskfile = write_temp_file(tmp.path(), "tasks.txt", "v1");
        let ids = vec![TaskId::from("A"), TaskId::from("B")];
        let mut checkpoint = Checkpoint::create(&taskfile, "wf1", &ids).unwrap();
        checkpoint.mark_running(&TaskId::from("A"));
        checkpoint.mark_running(&TaskId::from("B"));

        let mut safe_retry = BTreeMap::new();
        safe_retry.insert(TaskId::from("A"), true);
        safe_retry.insert(TaskId::from("B"), false);

        let plan = checkpoint.resume_plan(&safe_retry);
        assert!(plan.tasks_to_run.contains(&TaskId::from("A")));
        assert!(plan.requiring_decision.contains(&TaskId::from("B")));
    }

    #[test]
    fn cleanup_deletes_on_success_and_retains_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let taskfile = write_temp_file(tmp.path(), "tasks.txt", "v1");
        let ids = vec![TaskId::from("A")];
        let mut manager = CheckpointManager::new(
            tmp.path(),
            &taskfile,
            "wf1",
            &ids,
            Duration::from_secs(60),
            true,
        )
        .unwrap();
        let path = checkpoint_path(tmp.path(), "wf1");
        assert!(path.exists());

        manager.cleanup(false);
        assert!(path.exists());

        manager.cleanup(true);
        assert!(!path.exists());
    }
}
