//! C3: the dependency graph. Ids are the dependency-resolution unit;
//! task instances (siblings sharing an id after wildcard expansion) are the
//! dispatch unit. See spec §9 "Expansion yielding siblings that share an id".

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rushti_core::{InstanceKey, Task, TaskId};
use thiserror::Error;

pub mod build;
pub use build::build_dag;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("cycle detected among tasks: {}", .0.iter().map(TaskId::as_str).collect::<Vec<_>>().join(" -> "))]
    Cycle(Vec<TaskId>),

    #[error("predecessor id '{predecessor}' referenced by '{task}' does not exist")]
    UnknownPredecessor { task: TaskId, predecessor: TaskId },

    #[error("unknown stage '{0}' in stage_order")]
    UnknownStage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Skipped | Status::Failed)
    }

    /// A predecessor id is "satisfied" for dependents once it reaches any
    /// of completed/skipped/failed — propagation decides per spec §4.5
    /// whether a dependent still runs or is skipped.
    pub fn is_resolved(self) -> bool {
        self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PredecessorFailed,
}

/// Dependency graph over task ids, plus the per-instance dispatch state.
pub struct Dag {
    tasks_by_id: HashMap<TaskId, Vec<Task>>,
    /// Declaration order of ids, for deterministic iteration in tests/ordering.
    id_order: Vec<TaskId>,
    predecessors_by_id: HashMap<TaskId, BTreeSet<TaskId>>,
    successors_by_id: HashMap<TaskId, BTreeSet<TaskId>>,
    status_by_id: HashMap<TaskId, Status>,
    running_instances: HashSet<InstanceKey>,
    completed_instances: HashSet<InstanceKey>,
    /// id-level result, set once the id reaches a terminal state.
    result_by_id: HashMap<TaskId, bool>,
    skip_reason_by_id: HashMap<TaskId, SkipReason>,
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

impl Dag {
    pub fn new() -> Self {
        Self {
            tasks_by_id: HashMap::new(),
            id_order: Vec::new(),
            predecessors_by_id: HashMap::new(),
            successors_by_id: HashMap::new(),
            status_by_id: HashMap::new(),
            running_instances: HashSet::new(),
            completed_instances: HashSet::new(),
            result_by_id: HashMap::new(),
            skip_reason_by_id: HashMap::new(),
        }
    }

    /// Registers one task instance. All instances sharing an id must be
    /// added before [`Dag::validate`] is called.
    pub fn add_task(&mut self, task: Task) {
        let id = task.id.clone();
        if !self.tasks_by_id.contains_key(&id) {
            self.id_order.push(id.clone());
            self.status_by_id.insert(id.clone(), Status::Pending);
            self.predecessors_by_id.entry(id.clone()).or_default();
            self.successors_by_id.entry(id.clone()).or_default();
        }
        for pred in &task.predecessors {
            self.predecessors_by_id.entry(id.clone()).or_default().insert(pred.clone());
            self.successors_by_id.entry(pred.clone()).or_default().insert(id.clone());
        }
        self.tasks_by_id.entry(id).or_default().push(task);
    }

    /// Adds an edge not declared on the task record itself — used by stage
    /// ordering (spec §4.2) and by the contention optimizer's synthesized
    /// predecessor chains (spec §4.10).
    pub fn add_dependency(&mut self, id: &TaskId, predecessor: &TaskId) -> Result<(), DagError> {
        if !self.tasks_by_id.contains_key(id) {
            return Err(DagError::UnknownPredecessor {
                task: id.clone(),
                predecessor: predecessor.clone(),
            });
        }
        if !self.tasks_by_id.contains_key(predecessor) {
            return Err(DagError::UnknownPredecessor {
                task: id.clone(),
                predecessor: predecessor.clone(),
            });
        }
        self.predecessors_by_id.entry(id.clone()).or_default().insert(predecessor.clone());
        self.successors_by_id.entry(predecessor.clone()).or_default().insert(id.clone());
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.id_order.iter()
    }

    pub fn instances(&self, id: &TaskId) -> &[Task] {
        self.tasks_by_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.predecessors_by_id.get(id).into_iter().flatten()
    }

    pub fn successors(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.successors_by_id.get(id).into_iter().flatten()
    }

    pub fn status(&self, id: &TaskId) -> Status {
        self.status_by_id.get(id).copied().unwrap_or(Status::Pending)
    }

    /// DFS/SCC cycle check. On failure, the offending cycle's member ids are
    /// listed (spec §4.1: `cycle` error "listing any cycle participants").
    pub fn validate(&self) -> Result<(), DagError> {
        for (id, preds) in &self.predecessors_by_id {
            for pred in preds {
                if !self.tasks_by_id.contains_key(pred) {
                    return Err(DagError::UnknownPredecessor {
                        task: id.clone(),
                        predecessor: pred.clone(),
                    });
                }
            }
        }

        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut index_of: HashMap<TaskId, NodeIndex> = HashMap::new();
        for id in &self.id_order {
            let idx = graph.add_node(id.clone());
            index_of.insert(id.clone(), idx);
        }
        for (id, preds) in &self.predecessors_by_id {
            let to = index_of[id];
            for pred in preds {
                let from = index_of[pred];
                graph.add_edge(from, to, ());
            }
        }

        for scc in tarjan_scc(&graph) {
            if scc.len() > 1 {
                let cycle: Vec<TaskId> = scc.into_iter().map(|idx| graph[idx].clone()).collect();
                return Err(DagError::Cycle(cycle));
            }
        }
        // tarjan_scc also reports single-node SCCs for self-loops; check those.
        for edge in graph.edge_indices() {
            let (a, b) = graph.edge_endpoints(edge).unwrap();
            if a == b {
                return Err(DagError::Cycle(vec![graph[a].clone()]));
            }
        }

        Ok(())
    }

    /// Adds cross-stage predecessor edges so every task in stage k+1 depends
    /// on every task in stage k (spec §4.2, applied post-load).
    pub fn apply_stage_ordering(&mut self, order: &[String]) -> Result<(), DagError> {
        let mut ids_by_stage: HashMap<String, Vec<TaskId>> = HashMap::new();
        for id in &self.id_order {
            if let Some(task) = self.tasks_by_id.get(id).and_then(|v| v.first()) {
                if let Some(stage) = &task.stage {
                    ids_by_stage.entry(stage.clone()).or_default().push(id.clone());
                }
            }
        }
        for stage in order {
            if !ids_by_stage.contains_key(stage.as_str()) {
                return Err(DagError::UnknownStage(stage.clone()));
            }
        }
        for window in order.windows(2) {
            let (prev_stage, next_stage) = (&window[0], &window[1]);
            let prev_ids = ids_by_stage.get(prev_stage.as_str()).cloned().unwrap_or_default();
            let next_ids = ids_by_stage.get(next_stage.as_str()).cloned().unwrap_or_default();
            for next_id in &next_ids {
                for prev_id in &prev_ids {
                    self.add_dependency(next_id, prev_id)?;
                }
            }
        }
        Ok(())
    }

    /// The set of instances whose id's predecessors are all resolved, whose
    /// own id status is pending, and that are not already running.
    pub fn ready_tasks(&self) -> Vec<InstanceKey> {
        let mut ready = Vec::new();
        for id in &self.id_order {
            if self.status(id) != Status::Pending {
                continue;
            }
            let preds_satisfied = self
                .predecessors_by_id
                .get(id)
                .map(|preds| preds.iter().all(|p| self.status(p).is_resolved()))
                .unwrap_or(true);
            if !preds_satisfied {
                continue;
            }
            for (idx, _) in self.tasks_by_id.get(id).into_iter().flatten().enumerate() {
                let key = InstanceKey::new(id.clone(), idx);
                if !self.running_instances.contains(&key) && !self.completed_instances.contains(&key) {
                    ready.push(key);
                }
            }
        }
        ready
    }

    pub fn mark_running(&mut self, instance: InstanceKey) {
        self.status_by_id.insert(instance.id.clone(), Status::Running);
        self.running_instances.insert(instance);
    }

    /// Records one instance's outcome. Once every instance sharing the id
    /// has completed, the id transitions to a terminal state and failure
    /// propagation (spec §4.5) is the caller's responsibility — this method
    /// only exposes `id_just_resolved` so the scheduler can act on it.
    pub fn mark_complete(&mut self, instance: InstanceKey, success: bool) -> IdTransition {
        self.running_instances.remove(&instance);
        self.completed_instances.insert(instance.clone());
        let id = instance.id;
        let total = self.tasks_by_id.get(&id).map(Vec::len).unwrap_or(0);
        let done = (0..total)
            .filter(|i| self.completed_instances.contains(&InstanceKey::new(id.clone(), *i)))
            .count();

        if !success {
            self.result_by_id.insert(id.clone(), false);
        } else {
            self.result_by_id.entry(id.clone()).or_insert(true);
        }

        if done < total {
            return IdTransition::StillRunning;
        }

        let id_success = self.result_by_id.get(&id).copied().unwrap_or(true);
        let status = if id_success { Status::Completed } else { Status::Failed };
        self.status_by_id.insert(id.clone(), status);
        IdTransition::Resolved { id, success: id_success }
    }

    /// Marks an id skipped (e.g. a predecessor failed and this task requires
    /// predecessor success). Transitively applied by the scheduler to
    /// descendants per spec §4.5.
    pub fn mark_skipped(&mut self, id: &TaskId, reason: SkipReason) {
        self.status_by_id.insert(id.clone(), Status::Skipped);
        self.skip_reason_by_id.insert(id.clone(), reason);
        self.result_by_id.insert(id.clone(), false);
    }

    /// Reconstructs a previously-resolved id from a loaded checkpoint
    /// (spec §4.4 resume): marks every instance under `id` complete without
    /// going through `mark_running`/`mark_complete`'s dispatch bookkeeping,
    /// since the scheduler loop has not started yet.
    pub fn preload_resolved(&mut self, id: &TaskId, success: bool) {
        let total = self.tasks_by_id.get(id).map(Vec::len).unwrap_or(0);
        for idx in 0..total {
            self.completed_instances.insert(InstanceKey::new(id.clone(), idx));
        }
        self.result_by_id.insert(id.clone(), success);
        self.status_by_id.insert(id.clone(), if success { Status::Completed } else { Status::Failed });
    }

    pub fn skip_reason(&self, id: &TaskId) -> Option<SkipReason> {
        self.skip_reason_by_id.get(id).copied()
    }

    pub fn id_success(&self, id: &TaskId) -> Option<bool> {
        self.result_by_id.get(id).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.id_order.iter().all(|id| self.status(id).is_terminal())
    }

    pub fn has_running(&self) -> bool {
        !self.running_instances.is_empty()
    }

    /// Number of instances currently dispatched but not yet completed, used
    /// as the "concurrent count" stamped on each stats row at dispatch time
    /// (spec §4.5 / §4.9).
    pub fn running_count(&self) -> usize {
        self.running_instances.len()
    }

    pub fn task_count(&self) -> usize {
        self.id_order.len()
    }
}

pub enum IdTransition {
    StillRunning,
    Resolved { id: TaskId, success: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn task(id: &str, preds: &[&str]) -> Task {
        Task {
            id: TaskId::from(id),
            instance: "srv01".into(),
            process: "proc".into(),
            parameters: BTreeMap::new(),
            predecessors: preds.iter().map(|p| TaskId::from(*p)).collect(),
            stage: None,
            require_predecessor_success: false,
            succeed_on_minor_errors: false,
            safe_retry: false,
            timeout: None,
            cancel_at_timeout: false,
        }
    }

    #[test]
    fn ready_tasks_respects_predecessors() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &[]));
        dag.add_task(task("B", &["A"]));
        dag.validate().unwrap();

        let ready: Vec<_> = dag.ready_tasks().into_iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![TaskId::from("A")]);

        let a_inst = InstanceKey::single(TaskId::from("A"));
        dag.mark_running(a_inst.clone());
        let transition = dag.mark_complete(a_inst, true);
        assert!(matches!(transition, IdTransition::Resolved { success: true, .. }));

        let ready: Vec<_> = dag.ready_tasks().into_iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![TaskId::from("B")]);
    }

    #[test]
    fn multi_instance_id_resolves_only_when_all_instances_complete() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &[]));
        dag.add_task(task("A", &[]));
        dag.add_task(task("B", &["A"]));
        dag.validate().unwrap();

        let inst0 = InstanceKey::new(TaskId::from("A"), 0);
        let inst1 = InstanceKey::new(TaskId::from("A"), 1);
        dag.mark_running(inst0.clone());
        dag.mark_running(inst1.clone());
        let t0 = dag.mark_complete(inst0, true);
        assert!(matches!(t0, IdTransition::StillRunning));
        assert!(dag.ready_tasks().is_empty() || dag.ready_tasks().iter().all(|k| k.id.as_str() != "B"));

        let t1 = dag.mark_complete(inst1, true);
        assert!(matches!(t1, IdTransition::Resolved { success: true, .. }));
        let ready: Vec<_> = dag.ready_tasks().into_iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![TaskId::from("B")]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &["B"]));
        dag.add_task(task("B", &["A"]));
        assert!(matches!(dag.validate(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn preload_resolved_unblocks_dependents_without_dispatch() {
        let mut dag = Dag::new();
        dag.add_task(task("A", &[]));
        dag.add_task(task("B", &["A"]));
        dag.validate().unwrap();

        dag.preload_resolved(&TaskId::from("A"), true);
        assert_eq!(dag.status(&TaskId::from("A")), Status::Completed);
        let ready: Vec<_> = dag.ready_tasks().into_iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![TaskId::from("B")]);
    }

    #[test]
    fn stage_ordering_adds_cross_stage_edges() {
        let mut t1 = task("A", &[]);
        t1.stage = Some("extract".into());
        let mut t2 = task("B", &[]);
        t2.stage = Some("load".into());

        let mut dag = Dag::new();
        dag.add_task(t1);
        dag.add_task(t2);
        dag.apply_stage_ordering(&["extract".into(), "load".into()]).unwrap();
        dag.validate().unwrap();

        let ready: Vec<_> = dag.ready_tasks().into_iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![TaskId::from("A")]);
    }
}
