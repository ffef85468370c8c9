use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// One process invocation record, per spec §3. The two task "flavors" from
/// the source (plain vs. predecessor-aware) are collapsed into one tagged
/// struct with an optional predecessor list, rather than an inheritance
/// hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instance: String,
    pub process: String,
    /// String-keyed, string-valued parameter bag. Heterogeneous encodings
    /// at the source boundary (loader, remote client) are normalized here.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub predecessors: Vec<TaskId>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub require_predecessor_success: bool,
    #[serde(default)]
    pub succeed_on_minor_errors: bool,
    #[serde(default)]
    pub safe_retry: bool,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub cancel_at_timeout: bool,
}

impl Task {
    pub fn has_predecessors(&self) -> bool {
        !self.predecessors.is_empty()
    }
}

/// A sentinel in line-oriented workflows, not a task: introduces an implicit
/// predecessor edge between every task before it and every task after it,
/// bounded by the previous wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait;

/// One statement in a line-oriented workflow file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Task(Task),
    Wait,
}

/// Ordering algorithm for the scheduler's ready-set (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    LongestFirst,
    ShortestFirst,
}

impl Default for SchedulingAlgorithm {
    fn default() -> Self {
        Self::LongestFirst
    }
}

/// Top-level settings recognized in a workflow file (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_workers: u32,
    pub retries: u32,
    pub result_file: Option<String>,
    pub mode: WorkflowMode,
    pub exclusive: bool,
    pub optimization_algorithm: Option<SchedulingAlgorithm>,
    pub stage_order: Vec<String>,
    pub stage_workers: BTreeMap<String, u32>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retries: 0,
            result_file: None,
            mode: WorkflowMode::Norm,
            exclusive: false,
            optimization_algorithm: None,
            stage_order: Vec::new(),
            stage_workers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    #[default]
    Norm,
    Opt,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowMetadata {
    pub workflow: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
}

/// Parsed, validated workflow (C2 output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub version: String,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub tasks: Vec<Task>,
}
