//! JSON workflow parsing and validation (spec §4.1, §6).

use std::collections::HashSet;

use rushti_core::{LoadError, TaskId, Workflow};

pub fn parse(contents: &str) -> Result<Workflow, LoadError> {
    let workflow: Workflow = serde_json::from_str(contents)?;
    validate(&workflow)?;
    Ok(workflow)
}

pub fn validate(workflow: &Workflow) -> Result<(), LoadError> {
    if workflow.version.is_empty() {
        return Err(LoadError::SchemaViolation("'version' is required".into()));
    }
    if workflow.tasks.is_empty() {
        return Err(LoadError::SchemaViolation("'tasks' must be non-empty".into()));
    }
    if workflow.settings.max_workers < 1 {
        return Err(LoadError::SchemaViolation("'max_workers' must be >= 1".into()));
    }

    let mut seen: HashSet<&TaskId> = HashSet::new();
    for task in &workflow.tasks {
        if task.instance.is_empty() {
            return Err(LoadError::SchemaViolation(format!(
                "task '{}' is missing 'instance'",
                task.id
            )));
        }
        if task.process.is_empty() {
            return Err(LoadError::SchemaViolation(format!(
                "task '{}' is missing 'process'",
                task.id
            )));
        }
        if !seen.insert(&task.id) {
            return Err(LoadError::DuplicateId(task.id.clone()));
        }
    }

    let known_ids: HashSet<&TaskId> = workflow.tasks.iter().map(|t| &t.id).collect();
    for task in &workflow.tasks {
        for pred in &task.predecessors {
            if !known_ids.contains(pred) {
                return Err(LoadError::UnknownPredecessor {
                    task: task.id.clone(),
                    predecessor: pred.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Extension/content-sniff detection (spec §4.1): `.json` extension, or
/// (content sniff) first non-space byte is `{`.
pub fn looks_like_json(path: &std::path::Path, contents: &str) -> bool {
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        return true;
    }
    contents.trim_start().starts_with('{')
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "version": "1",
        "metadata": {"workflow": "wf1"},
        "settings": {"max_workers": 2},
        "tasks": [
            {"id": "A", "instance": "srv01", "process": "p1", "parameters": {}, "predecessors": []},
            {"id": "B", "instance": "srv01", "process": "p2", "parameters": {}, "predecessors": ["A"]}
        ]
    }"#;

    #[test]
    fn parses_valid_workflow() {
        let wf = parse(VALID).unwrap();
        assert_eq!(wf.tasks.len(), 2);
    }

    #[test]
    fn rejects_unknown_predecessor() {
        let bad = VALID.replace(r#""predecessors": ["A"]"#, r#""predecessors": ["Z"]"#);
        assert!(matches!(parse(&bad), Err(LoadError::UnknownPredecessor { .. })));
    }

    #[test]
    fn rejects_duplicate_id() {
        let bad = VALID.replace(r#""id": "B""#, r#""id": "A""#);
        assert!(matches!(parse(&bad), Err(LoadError::DuplicateId(_))));
    }

    #[test]
    fn rejects_empty_tasks() {
        let bad = r#"{"version": "1", "tasks": []}"#;
        assert!(matches!(parse(bad), Err(LoadError::SchemaViolation(_))));
    }
}
