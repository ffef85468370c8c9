//! C8: the execution harness. Per-task retry/timeout wrapper around
//! [`rushti_remote::RemoteClient`], grounded on `rushti.py`'s
//! `execute_process_with_retries` — generalized away from its bare
//! `except: continue` (an unbounded retry loop on any exception) into a
//! bounded, typed retry policy per spec §4.7. The retry count is a
//! workflow-level setting (spec §3/§6), not a field on `Task`, so it is
//! threaded through explicitly rather than read off the task.

use std::time::{Duration, Instant};

use rushti_core::{RuntimeError, Task};
use rushti_remote::{ProcessOutcome, RemoteClient, SessionId};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub status: String,
    pub server_error_ref: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
    pub error_message: Option<String>,
}

enum AttemptError {
    Timeout,
    Transport(String),
    Cancelled,
}

/// Runs one task to terminal outcome: success, exhausted retries, or
/// cancellation. Never returns `Err` — all failure modes are folded into
/// [`ExecutionOutcome`] so the scheduler has one uniform completion path.
pub async fn execute_task(
    remote: &dyn RemoteClient,
    task: &Task,
    retries: u32,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return ExecutionOutcome {
                success: false,
                status: "Cancelled".to_string(),
                server_error_ref: None,
                attempts: attempt,
                duration: start.elapsed(),
                error_message: Some(RuntimeError::Cancelled.to_string()),
            };
        }

        match run_one_attempt(remote, task, cancel).await {
            Ok(outcome) => {
                let effective_success =
                    if outcome.is_minor_errors() { task.succeed_on_minor_errors } else { outcome.success };

                if effective_success {
                    return ExecutionOutcome {
                        success: true,
                        status: outcome.status,
                        server_error_ref: outcome.server_error_ref,
                        attempts: attempt + 1,
                        duration: start.elapsed(),
                        error_message: None,
                    };
                }

                if attempt >= retries {
                    return ExecutionOutcome {
                        success: false,
                        status: outcome.status.clone(),
                        server_error_ref: outcome.server_error_ref.clone(),
                        attempts: attempt + 1,
                        duration: start.elapsed(),
                        error_message: Some(format!(
                            "remote-failure: {}",
                            outcome.server_error_ref.unwrap_or(outcome.status)
                        )),
                    };
                }
                attempt += 1;
            }
            Err(AttemptError::Timeout) => {
                if attempt >= retries {
                    return ExecutionOutcome {
                        success: false,
                        status: "Timeout".to_string(),
                        server_error_ref: None,
                        attempts: attempt + 1,
                        duration: start.elapsed(),
                        error_message: Some(RuntimeError::Timeout(task.timeout.unwrap_or(0)).to_string()),
                    };
                }
                attempt += 1;
            }
            Err(AttemptError::Transport(message)) => {
                if attempt >= retries {
                    return ExecutionOutcome {
                        success: false,
                        status: "TransportError".to_string(),
                        server_error_ref: None,
                        attempts: attempt + 1,
                        duration: start.elapsed(),
                        error_message: Some(RuntimeError::TransportError(message).to_string()),
                    };
                }
                attempt += 1;
            }
            Err(AttemptError::Cancelled) => {
                return ExecutionOutcome {
                    success: false,
                    status: "Cancelled".to_string(),
                    server_error_ref: None,
                    attempts: attempt + 1,
                    duration: start.elapsed(),
                    error_message: Some(RuntimeError::Cancelled.to_string()),
                };
            }
        }
    }
}

/// Issues the remote cancel once a timeout fires with `cancel_at_timeout`
/// set. `session` is whatever `run_process` managed to hand back through
/// its oneshot before the timer fired; a server that only ever reveals the
/// session id on completion leaves it `None`, and that's reported as such
/// rather than silently skipped.
async fn cancel_on_timeout(remote: &dyn RemoteClient, task: &Task, session: Option<SessionId>) {
    if !task.cancel_at_timeout {
        return;
    }
    match session {
        Some(session) => match remote.cancel(&task.instance, &session).await {
            Ok(true) => tracing::info!(task_id = %task.id, "timeout: issued remote cancel"),
            Ok(false) => {
                tracing::warn!(task_id = %task.id, "timeout: remote does not support cancellation")
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "timeout: remote cancel request failed")
            }
        },
        None => tracing::warn!(
            task_id = %task.id,
            "timeout: cancel_at_timeout set but no session id arrived before the timer fired; skipping remote cancel"
        ),
    }
}

async fn run_one_attempt(
    remote: &dyn RemoteClient,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome, AttemptError> {
    let (session_tx, mut session_rx) = tokio::sync::oneshot::channel();
    let call = remote.run_process(&task.instance, &task.process, &task.parameters, Some(session_tx));
    tokio::pin!(call);

    let mut session: Option<SessionId> = None;
    let mut awaiting_session = true;

    let result = match task.timeout {
        Some(seconds) if seconds > 0 => {
            let sleep = tokio::time::sleep(Duration::from_secs(seconds as u64));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                    _ = &mut sleep => {
                        cancel_on_timeout(remote, task, session).await;
                        return Err(AttemptError::Timeout);
                    }
                    recv = &mut session_rx, if awaiting_session => {
                        awaiting_session = false;
                        if let Ok(sid) = recv {
                            session = Some(sid);
                        }
                    }
                    outcome = &mut call => break outcome,
                }
            }
        }
        _ => loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                recv = &mut session_rx, if awaiting_session => {
                    awaiting_session = false;
                    if let Ok(sid) = recv {
                        session = Some(sid);
                    }
                }
                outcome = &mut call => break outcome,
            }
        },
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(RuntimeError::Timeout(_)) => Err(AttemptError::Timeout),
        Err(RuntimeError::Cancelled) => Err(AttemptError::Cancelled),
        Err(e) => Err(AttemptError::Transport(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushti_core::TaskId;
    use rushti_remote::fake::{FakeRemoteClient, Script};
    use std::collections::BTreeMap;

    fn sample_task() -> Task {
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

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let remote = FakeRemoteClient::new().with_script("srv01", "proc", Script::Fixed(ProcessOutcome::success("OK")));
        let task = sample_task();
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 2, &cancel).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_budget() {
        let remote = FakeRemoteClient::new().with_script("srv01", "proc", Script::FailThenSucceed { remaining_failures: 2 });
        let task = sample_task();
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 3, &cancel).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn exhausts_retries_and_reports_remote_failure() {
        let remote = FakeRemoteClient::new().with_script(
            "srv01",
            "proc",
            Script::Fixed(ProcessOutcome::failure("Error", "E001")),
        );
        let task = sample_task();
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 1, &cancel).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn minor_errors_succeed_only_when_flag_set() {
        let remote = FakeRemoteClient::new().with_script(
            "srv01",
            "proc",
            Script::Fixed(ProcessOutcome::minor_errors("completed with minor errors")),
        );
        let mut task = sample_task();
        task.succeed_on_minor_errors = false;
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 0, &cancel).await;
        assert!(!outcome.success);

        task.succeed_on_minor_errors = true;
        let outcome = execute_task(&remote, &task, 0, &cancel).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_dispatch() {
        let remote = FakeRemoteClient::new().with_script("srv01", "proc", Script::NeverReturns);
        let task = sample_task();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = execute_task(&remote, &task, 5, &cancel).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, "Cancelled");
    }

    #[tokio::test]
    async fn timeout_fires_and_counts_against_retry_budget() {
        let remote = FakeRemoteClient::new().with_script("srv01", "proc", Script::NeverReturns);
        let mut task = sample_task();
        task.timeout = Some(1);
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 0, &cancel).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, "Timeout");
    }

    #[tokio::test]
    async fn cancel_at_timeout_issues_a_remote_cancel_once_a_session_is_known() {
        let remote = FakeRemoteClient::new().with_script("srv01", "proc", Script::NeverReturns);
        let mut task = sample_task();
        task.timeout = Some(1);
        task.cancel_at_timeout = true;
        let cancel = CancellationToken::new();
        let outcome = execute_task(&remote, &task, 0, &cancel).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, "Timeout");
        assert_eq!(remote.cancel_calls(), 1);
    }
}
