//! Builds a [`Dag`] from a loaded [`Workflow`] (spec §4.1 `build_dag` /
//! `convert_json_to_dag`): register every task, then apply stage ordering,
//! then validate for cycles.

use rushti_core::Workflow;

use crate::{Dag, DagError};

pub fn build_dag(workflow: &Workflow) -> Result<Dag, DagError> {
    let mut dag = Dag::new();
    for task in &workflow.tasks {
        dag.add_task(task.clone());
    }
    if !workflow.settings.stage_order.is_empty() {
        dag.apply_stage_ordering(&workflow.settings.stage_order)?;
    }
    dag.validate()?;
    Ok(dag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushti_core::{Task, TaskId, WorkflowMetadata, WorkflowSettings};
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
    fn builds_and_validates_a_simple_workflow() {
        let workflow = Workflow {
            version: "1".into(),
            metadata: WorkflowMetadata::default(),
            settings: WorkflowSettings::default(),
            tasks: vec![task("A", &[]), task("B", &["A"])],
        };
        let dag = build_dag(&workflow).unwrap();
        assert_eq!(dag.task_count(), 2);
    }

    #[test]
    fn rejects_cycles() {
        let workflow = Workflow {
            version: "1".into(),
            metadata: WorkflowMetadata::default(),
            settings: WorkflowSettings::default(),
            tasks: vec![task("A", &["B"]), task("B", &["A"])],
        };
        assert!(build_dag(&workflow).is_err());
    }
}
