//! Wildcard parameter expansion (spec §3, §4.1). Grounded in
//! `parsing.py::expand_task`: a parameter key ending in `*` is evaluated as
//! a set-expression against the remote server; the task expands into the
//! Cartesian product over all wildcard keys, `*` stripped from the key
//! name, and the expansion preserves the task id across all siblings.

use rushti_core::{RuntimeError, Task};
use rushti_remote::RemoteClient;

/// Expands one task's wildcard parameters. Returns `vec![task]` unchanged
/// if it has no wildcard keys (mirrors the source's "no expansion needed"
/// fast path, which matters because it preserves object identity for
/// non-expanded tasks).
pub async fn expand_task(
    remote: &dyn RemoteClient,
    task: Task,
) -> Result<Vec<Task>, RuntimeError> {
    let wildcard_keys: Vec<&String> =
        task.parameters.keys().filter(|k| k.ends_with('*')).collect();
    if wildcard_keys.is_empty() {
        return Ok(vec![task]);
    }

    // Each entry is the list of (key, value) pairs one wildcard key can
    // contribute; a non-wildcard key contributes exactly one pair.
    let mut per_key_options: Vec<Vec<(String, String)>> = Vec::new();
    for (key, value) in &task.parameters {
        if key.ends_with('*') {
            // The source drops the first character of the value before
            // treating it as the MDX set expression (`value[1:]`); we carry
            // that literally since it is the established wire convention,
            // not a flagged bug.
            let mdx = value.chars().skip(1).collect::<String>();
            let elements = remote.expand_set(&task.instance, &mdx).await?;
            let stripped_key = key.trim_end_matches('*').to_string();
            per_key_options.push(
                elements.into_iter().map(|el| (stripped_key.clone(), el)).collect(),
            );
        } else {
            per_key_options.push(vec![(key.clone(), value.clone())]);
        }
    }

    // Cartesian product over per_key_options. An empty wildcard result
    // collapses the whole product to zero tasks (spec §8: "Empty parameter
    // wildcard -> task is dropped from the expansion").
    let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for options in per_key_options {
        if options.is_empty() {
            return Ok(Vec::new());
        }
        let mut next = Vec::with_capacity(combinations.len() * options.len());
        for combo in &combinations {
            for opt in &options {
                let mut extended = combo.clone();
                extended.push(opt.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    let expanded = combinations
        .into_iter()
        .map(|pairs| Task { parameters: pairs.into_iter().collect(), ..task.clone() })
        .collect();
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushti_core::TaskId;
    use rushti_remote::fake::FakeRemoteClient;
    use std::collections::BTreeMap;

    fn base_task(params: &[(&str, &str)]) -> Task {
        Task {
            id: TaskId::from("1"),
            instance: "srv01".into(),
            process: "proc".into(),
            parameters: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            predecessors: vec![],
            stage: None,
            require_predecessor_success: false,
            succeed_on_minor_errors: false,
            safe_retry: false,
            timeout: None,
            cancel_at_timeout: false,
        }
    }

    #[tokio::test]
    async fn no_wildcard_returns_single_task_unchanged() {
        let remote = FakeRemoteClient::new();
        let task = base_task(&[("region", "EU")]);
        let result = expand_task(&remote, task.clone()).await.unwrap();
        assert_eq!(result, vec![task]);
    }

    #[tokio::test]
    async fn expands_cartesian_product_across_wildcards() {
        let remote = FakeRemoteClient::new()
            .with_set_expansion("{region}", vec!["EU".into(), "US".into()])
            .with_set_expansion("{year}", vec!["2024".into(), "2025".into()]);
        let mut params = BTreeMap::new();
        params.insert("pRegion*".to_string(), "{region}".to_string());
        params.insert("pYear*".to_string(), "{year}".to_string());
        let task = Task { parameters: params, ..base_task(&[]) };

        let result = expand_task(&remote, task.clone()).await.unwrap();
        assert_eq!(result.len(), 4);
        assert!(result.iter().all(|t| t.id == task.id));
        assert!(result.iter().all(|t| !t.parameters.contains_key("pRegion*")));
    }

    #[tokio::test]
    async fn empty_wildcard_result_drops_the_task() {
        let remote = FakeRemoteClient::new().with_set_expansion("{region}", vec![]);
        let mut params = BTreeMap::new();
        params.insert("pRegion*".to_string(), "{region}".to_string());
        let task = Task { parameters: params, ..base_task(&[]) };

        let result = expand_task(&remote, task).await.unwrap();
        assert!(result.is_empty());
    }
}
