//! Line-oriented workflow parsing. Grounded in
//! `rushti.py::extract_task_from_line`, which substitutes a unique
//! placeholder for `\"` before `shlex.split`, then restores it afterward.
//! We perform the equivalent two-pass substitution by hand rather than
//! pulling in a shell-tokenizing crate, since the only quoting rule needed
//! is "double quotes group, `\"` escapes".

use std::collections::BTreeMap;

use rushti_core::{LoadError, SchedulingAlgorithm, Statement, Task, TaskId};

const ESCAPED_QUOTE_PLACEHOLDER: char = '\u{0}';

/// Tokenizes one `key="value with spaces"` / `key=value` line into raw
/// key/value pairs, preserving one level of `\"` unescaping inside quoted
/// values (spec §6).
fn tokenize(line: &str) -> Result<Vec<(String, String)>, LoadError> {
    let protected = line.replace("\\\"", &ESCAPED_QUOTE_PLACEHOLDER.to_string());

    let mut tokens = Vec::new();
    let mut chars = protected.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut push_current = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => push_current(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(LoadError::InvalidFormat(format!(
            "unterminated quoted value in line: {line}"
        )));
    }
    push_current(&mut current, &mut tokens);

    let mut pairs = Vec::with_capacity(tokens.len());
    for token in tokens {
        let restored = token.replace(ESCAPED_QUOTE_PLACEHOLDER, "\"");
        let (key, value) = restored
            .split_once('=')
            .ok_or_else(|| LoadError::InvalidFormat(format!("malformed token '{restored}'")))?;
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Treats empty string, `"0"`, and the literal digit `0` as "no
/// predecessors" (spec §9 open question; canonical written form is empty).
fn parse_predecessors(value: &str) -> Vec<TaskId> {
    if value.is_empty() || value == "0" {
        return Vec::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "0")
        .map(TaskId::from)
        .collect()
}

/// Removes a reserved field by case-insensitive key match, leaving every
/// other key byte-for-byte as tokenized (spec §3: parameter keys are
/// case-sensitive; only `instance`/`process`/`id`/... are case-insensitive
/// on the wire).
fn take_reserved(fields: &mut BTreeMap<String, String>, name: &str) -> Option<String> {
    let key = fields.keys().find(|k| k.eq_ignore_ascii_case(name))?.clone();
    fields.remove(&key)
}

/// Parses one line into a [`Statement`]. `id`/`predecessors` are accepted
/// when present (opt format); their absence produces a plain task (norm
/// format) with an id assigned by the caller.
pub fn parse_line(line: &str, default_id: impl FnOnce() -> TaskId) -> Result<Statement, LoadError> {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case("wait") {
        return Ok(Statement::Wait);
    }

    let mut fields: BTreeMap<String, String> = tokenize(trimmed)?.into_iter().collect();

    let instance = take_reserved(&mut fields, "instance")
        .ok_or_else(|| LoadError::SchemaViolation("missing 'instance' field".into()))?;
    let process = take_reserved(&mut fields, "process")
        .ok_or_else(|| LoadError::SchemaViolation("missing 'process' field".into()))?;
    let id = match take_reserved(&mut fields, "id") {
        Some(raw) if !raw.is_empty() => TaskId::from(raw),
        _ => default_id(),
    };
    let predecessors = take_reserved(&mut fields, "predecessors")
        .map(|v| parse_predecessors(&v))
        .unwrap_or_default();
    let require_predecessor_success = take_reserved(&mut fields, "require_predecessor_success")
        .map(|v| parse_bool(&v))
        .unwrap_or(false);
    let succeed_on_minor_errors = take_reserved(&mut fields, "succeed_on_minor_errors")
        .map(|v| parse_bool(&v))
        .unwrap_or(false);
    let safe_retry = take_reserved(&mut fields, "safe_retry").map(|v| parse_bool(&v)).unwrap_or(false);
    let stage = take_reserved(&mut fields, "stage");
    let timeout = take_reserved(&mut fields, "timeout")
        .map(|v| v.parse::<u32>())
        .transpose()
        .map_err(|_| LoadError::SchemaViolation("invalid 'timeout' value".into()))?;
    let cancel_at_timeout = take_reserved(&mut fields, "cancel_at_timeout")
        .map(|v| parse_bool(&v))
        .unwrap_or(false);

    // Remaining fields are the task's parameter bag, keys untouched.
    let parameters = fields.into_iter().collect();

    Ok(Statement::Task(Task {
        id,
        instance,
        process,
        parameters,
        predecessors,
        stage,
        require_predecessor_success,
        succeed_on_minor_errors,
        safe_retry,
        timeout,
        cancel_at_timeout,
    }))
}

fn escape_value(value: &str) -> String {
    value.replace('"', "\\\"")
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", escape_value(value))
}

/// Serializes a task back to one opt-form line (`id=` always written
/// explicitly), the inverse of [`parse_line`].
pub fn to_line(task: &Task) -> String {
    let mut parts = vec![
        format!("instance={}", quoted(&task.instance)),
        format!("process={}", quoted(&task.process)),
        format!("id={}", quoted(task.id.as_str())),
    ];
    if !task.predecessors.is_empty() {
        let joined =
            task.predecessors.iter().map(TaskId::as_str).collect::<Vec<_>>().join(",");
        parts.push(format!("predecessors={}", quoted(&joined)));
    }
    if task.require_predecessor_success {
        parts.push("require_predecessor_success=true".to_string());
    }
    if task.succeed_on_minor_errors {
        parts.push("succeed_on_minor_errors=true".to_string());
    }
    if task.safe_retry {
        parts.push("safe_retry=true".to_string());
    }
    if let Some(stage) = &task.stage {
        parts.push(format!("stage={}", quoted(stage)));
    }
    if let Some(timeout) = task.timeout {
        parts.push(format!("timeout={timeout}"));
    }
    if task.cancel_at_timeout {
        parts.push("cancel_at_timeout=true".to_string());
    }
    for (key, value) in &task.parameters {
        parts.push(format!("{key}={}", quoted(value)));
    }
    parts.join(" ")
}

/// A line format is "opt" if any non-blank, non-comment line has an `id=`
/// key; otherwise "norm" (spec §4.1).
pub fn detect_mode(contents: &str) -> rushti_core::WorkflowMode {
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.to_ascii_lowercase().contains("id=") {
            return rushti_core::WorkflowMode::Opt;
        }
    }
    rushti_core::WorkflowMode::Norm
}

pub fn parse_optimization_algorithm(value: &str) -> Option<SchedulingAlgorithm> {
    match value {
        "longest_first" => Some(SchedulingAlgorithm::LongestFirst),
        "shortest_first" => Some(SchedulingAlgorithm::ShortestFirst),
        _ => None,
    }
}

/// Parses an entire line-format file into ordered statements. Blank and
/// `#`-comment lines are skipped in both norm and opt variants, per
/// SPEC_FULL.md §4.1 (standardizing the source's inconsistent norm-format
/// blank-line handling).
pub fn parse_statements(contents: &str) -> Result<Vec<Statement>, LoadError> {
    let mode = detect_mode(contents);
    let mut next_id: u64 = 1;
    let mut statements = Vec::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let statement = parse_line(line, || {
            let id = TaskId::new(next_id.to_string());
            next_id += 1;
            id
        })?;
        statements.push(statement);
    }

    let _ = mode; // mode drives which id assignment branch parse_line took implicitly
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wait_case_insensitively() {
        assert_eq!(parse_line("Wait", || TaskId::from("1")).unwrap(), Statement::Wait);
        assert_eq!(parse_line("  wait  ", || TaskId::from("1")).unwrap(), Statement::Wait);
    }

    #[test]
    fn parses_quoted_values_with_escaped_quotes() {
        let line = r#"instance="srv01" process="Load \"Data\"" pRegion="EU""#;
        let stmt = parse_line(line, || TaskId::from("1")).unwrap();
        match stmt {
            Statement::Task(t) => {
                assert_eq!(t.instance, "srv01");
                assert_eq!(t.process, "Load \"Data\"");
                assert_eq!(t.parameters.get("pRegion"), Some(&"EU".to_string()));
            }
            Statement::Wait => panic!("expected task"),
        }
    }

    #[test]
    fn predecessors_treats_zero_and_empty_as_none() {
        assert!(parse_predecessors("").is_empty());
        assert!(parse_predecessors("0").is_empty());
        assert_eq!(parse_predecessors("A,B"), vec![TaskId::from("A"), TaskId::from("B")]);
    }

    #[test]
    fn reserved_keys_are_case_insensitive() {
        let line = r#"INSTANCE="srv01" PROCESS="proc" STAGE="extract""#;
        let stmt = parse_line(line, || TaskId::from("1")).unwrap();
        match stmt {
            Statement::Task(t) => assert_eq!(t.stage, Some("extract".to_string())),
            Statement::Wait => panic!("expected task"),
        }
    }

    #[test]
    fn detects_opt_mode_from_id_key() {
        let norm = "instance=\"a\" process=\"b\"\n";
        let opt = "id=\"1\" instance=\"a\" process=\"b\"\n";
        assert_eq!(detect_mode(norm), rushti_core::WorkflowMode::Norm);
        assert_eq!(detect_mode(opt), rushti_core::WorkflowMode::Opt);
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        let contents = "# comment\n\ninstance=\"a\" process=\"b\"\n\nwait\n";
        let statements = parse_statements(contents).unwrap();
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn to_line_escapes_embedded_quotes() {
        let mut task = sample_task_for_round_trip();
        task.process = "Load \"Data\"".to_string();
        let line = to_line(&task);
        match parse_line(&line, || task.id.clone()).unwrap() {
            Statement::Task(t) => assert_eq!(t, task),
            Statement::Wait => panic!("expected task"),
        }
    }

    fn sample_task_for_round_trip() -> Task {
        Task {
            id: TaskId::from("T1"),
            instance: "srv01".into(),
            process: "proc".into(),
            parameters: BTreeMap::new(),
            predecessors: Vec::new(),
            stage: None,
            require_predecessor_success: false,
            succeed_on_minor_errors: false,
            safe_retry: false,
            timeout: None,
            cancel_at_timeout: false,
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const RESERVED: &[&str] = &[
        "instance",
        "process",
        "id",
        "predecessors",
        "require_predecessor_success",
        "succeed_on_minor_errors",
        "safe_retry",
        "stage",
        "timeout",
        "cancel_at_timeout",
    ];

    fn free_text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 \"]{1,12}"
    }

    fn token() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_]{0,8}"
    }

    fn param_key() -> impl Strategy<Value = String> {
        token().prop_filter("must not shadow a reserved field", |k| {
            !RESERVED.iter().any(|r| r.eq_ignore_ascii_case(k))
        })
    }

    fn arbitrary_task() -> impl Strategy<Value = Task> {
        (
            token(),
            free_text(),
            free_text(),
            prop::collection::vec(token().prop_filter("not the sentinel value", |s| s != "0"), 0..3),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
            prop::option::of(free_text()),
            prop::option::of(0u32..600),
            any::<bool>(),
            prop::collection::btree_map(param_key(), free_text(), 0..4),
        )
            .prop_map(
                |(
                    id,
                    instance,
                    process,
                    predecessors,
                    require_predecessor_success,
                    succeed_on_minor_errors,
                    safe_retry,
                    stage,
                    timeout,
                    cancel_at_timeout,
                    parameters,
                )| Task {
                    id: TaskId::from(id),
                    instance,
                    process,
                    parameters,
                    predecessors: predecessors.into_iter().map(TaskId::from).collect(),
                    stage,
                    require_predecessor_success,
                    succeed_on_minor_errors,
                    safe_retry,
                    timeout,
                    cancel_at_timeout,
                },
            )
    }

    proptest! {
        #[test]
        fn line_format_round_trips_through_serialize_then_parse(task in arbitrary_task()) {
            let line = to_line(&task);
            let reparsed = parse_line(&line, || task.id.clone()).unwrap();
            match reparsed {
                Statement::Task(t) => prop_assert_eq!(t, task),
                Statement::Wait => prop_assert!(false, "expected a task statement"),
            }
        }
    }
}
