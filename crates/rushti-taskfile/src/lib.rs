//! C2: the workflow loader. Parses line-oriented or JSON input into a
//! validated [`Workflow`], after which [`rushti_dag::Dag`] construction is a
//! generic operation the caller performs (this crate does not depend on
//! `rushti-dag` to keep the loader testable without a graph library).

pub mod expand;
pub mod json_format;
pub mod line_format;

use std::path::Path;

use rushti_core::{LoadError, Statement, Task, TaskId, Workflow, WorkflowMetadata, WorkflowSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Line,
}

/// Extension-then-content-sniff detection (spec §4.1).
pub fn detect_file_format(path: &Path, contents: &str) -> FileFormat {
    if json_format::looks_like_json(path, contents) {
        FileFormat::Json
    } else {
        FileFormat::Line
    }
}

/// Parses workflow source text into a validated [`Workflow`]. For the line
/// format, injects wait-derived predecessor edges so the rest of the
/// pipeline (DAG construction, scheduler) only ever sees ordinary
/// predecessor lists (spec §4.1: "Norm workflows are rewritten to the opt
/// DAG by injecting implicit predecessors per wait marker").
pub fn parse_workflow(path: &Path, contents: &str) -> Result<Workflow, LoadError> {
    match detect_file_format(path, contents) {
        FileFormat::Json => json_format::parse(contents),
        FileFormat::Line => {
            let statements = line_format::parse_statements(contents)?;
            let tasks = materialize_wait_predecessors(statements);
            let workflow = Workflow {
                version: "1".to_string(),
                metadata: WorkflowMetadata::default(),
                settings: WorkflowSettings::default(),
                tasks,
            };
            json_format::validate(&workflow)?;
            Ok(workflow)
        }
    }
}

/// Rewrites wait markers into predecessor edges: every task between two
/// waits depends on every task in the immediately preceding block.
fn materialize_wait_predecessors(statements: Vec<Statement>) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut previous_block: Vec<TaskId> = Vec::new();
    let mut current_block: Vec<TaskId> = Vec::new();

    for statement in statements {
        match statement {
            Statement::Wait => {
                previous_block = std::mem::take(&mut current_block);
            }
            Statement::Task(mut task) => {
                if !previous_block.is_empty() {
                    let mut preds = previous_block.clone();
                    preds.extend(task.predecessors);
                    preds.sort();
                    preds.dedup();
                    task.predecessors = preds;
                }
                current_block.push(task.id.clone());
                tasks.push(task);
            }
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn wait_marker_injects_predecessors_on_following_block_only() {
        let contents = "instance=\"s\" process=\"A\"\ninstance=\"s\" process=\"B\"\nwait\ninstance=\"s\" process=\"C\"\ninstance=\"s\" process=\"D\"\n";
        let workflow = parse_workflow(&PathBuf::from("wf.txt"), contents).unwrap();
        assert_eq!(workflow.tasks.len(), 4);
        let a_id = workflow.tasks[0].id.clone();
        let b_id = workflow.tasks[1].id.clone();
        for task in &workflow.tasks[2..] {
            assert!(task.predecessors.contains(&a_id));
            assert!(task.predecessors.contains(&b_id));
        }
        assert!(workflow.tasks[0].predecessors.is_empty());
        assert!(workflow.tasks[1].predecessors.is_empty());
    }

    #[test]
    fn detects_json_by_extension_and_by_content_sniff() {
        assert_eq!(
            detect_file_format(&PathBuf::from("wf.json"), "anything"),
            FileFormat::Json
        );
        assert_eq!(
            detect_file_format(&PathBuf::from("wf.txt"), "  { \"a\": 1 }"),
            FileFormat::Json
        );
        assert_eq!(
            detect_file_format(&PathBuf::from("wf.txt"), "instance=\"a\""),
            FileFormat::Line
        );
    }
}
