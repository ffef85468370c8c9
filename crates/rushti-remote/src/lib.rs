//! C9: the remote client. Defines the [`RemoteClient`] trait so the
//! scheduler and execution harness depend on a trait object, not on
//! `reqwest` directly — tests drive an in-memory fake implementing the same
//! trait instead of a real connection.

pub mod fake;
pub mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use rushti_core::RuntimeError;
use serde::{Deserialize, Serialize};

/// Outcome of a single "run process" RPC, before retry/timeout policy is
/// applied (that's the execution harness's job, C8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub status: String,
    pub server_error_ref: Option<String>,
}

impl ProcessOutcome {
    pub fn success(status: impl Into<String>) -> Self {
        Self { success: true, status: status.into(), server_error_ref: None }
    }

    pub fn minor_errors(status: impl Into<String>) -> Self {
        Self { success: false, status: status.into(), server_error_ref: None }
    }

    pub fn failure(status: impl Into<String>, error_ref: impl Into<String>) -> Self {
        Self { success: false, status: status.into(), server_error_ref: Some(error_ref.into()) }
    }

    /// Whether the server reported "completed with minor errors" rather than
    /// an outright failure (spec §4.7 step 4).
    pub fn is_minor_errors(&self) -> bool {
        !self.success && self.status.eq_ignore_ascii_case("completed with minor errors")
    }
}

/// A session handle usable with `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

/// Two operations used by the core (spec §4.8), plus cancel.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Runs a process to completion. `session_tx`, when given, is sent the
    /// session id as soon as the server assigns one -- which for an
    /// asynchronous submission happens well before the process finishes,
    /// so a caller racing this future against a timeout can still issue
    /// `cancel` for the session it is about to give up on (spec §4.7 step
    /// 5). A client unable to learn the session id before completion (e.g.
    /// a server that only supports synchronous execution) drops the sender
    /// without sending; callers must treat that as "no session available".
    async fn run_process(
        &self,
        instance: &str,
        process: &str,
        parameters: &BTreeMap<String, String>,
        session_tx: Option<tokio::sync::oneshot::Sender<SessionId>>,
    ) -> Result<ProcessOutcome, RuntimeError>;

    /// Evaluates a set-expression and returns the element names, used by
    /// wildcard expansion (spec §4.1).
    async fn expand_set(&self, instance: &str, mdx: &str) -> Result<Vec<String>, RuntimeError>;

    /// Best-effort remote cancellation. A `false` return (not an error)
    /// means the server does not support cancellation; callers log a
    /// warning and move on (spec §4.8).
    async fn cancel(&self, instance: &str, session: &SessionId) -> Result<bool, RuntimeError>;
}
