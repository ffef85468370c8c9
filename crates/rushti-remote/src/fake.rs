//! In-memory [`RemoteClient`] fake, scripted per instance/process. Drives
//! scheduler and execution-harness tests without network I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rushti_core::RuntimeError;

use crate::{ProcessOutcome, RemoteClient, SessionId};

#[derive(Clone)]
pub enum Script {
    /// Always returns this outcome.
    Fixed(ProcessOutcome),
    /// Never resolves, so a caller's own timeout/cancellation logic is what
    /// has to end the attempt -- this exercises real timer/cancel racing
    /// rather than a pre-baked timeout error.
    NeverReturns,
    /// Fails the first `n` attempts with `RemoteFailure`, then succeeds.
    FailThenSucceed { remaining_failures: u32 },
    /// Always returns a transport error.
    TransportError(String),
}

pub struct FakeRemoteClient {
    scripts: Mutex<BTreeMap<(String, String), Script>>,
    set_expansions: BTreeMap<String, Vec<String>>,
    call_count: AtomicU64,
    cancel_calls: AtomicU64,
}

impl Default for FakeRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemoteClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(BTreeMap::new()),
            set_expansions: BTreeMap::new(),
            call_count: AtomicU64::new(0),
            cancel_calls: AtomicU64::new(0),
        }
    }

    pub fn with_script(mut self, instance: &str, process: &str, script: Script) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert((instance.to_string(), process.to_string()), script);
        self
    }

    pub fn with_set_expansion(mut self, mdx: &str, elements: Vec<String>) -> Self {
        self.set_expansions.insert(mdx.to_string(), elements);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u64 {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn run_process(
        &self,
        instance: &str,
        process: &str,
        _parameters: &BTreeMap<String, String>,
        session_tx: Option<tokio::sync::oneshot::Sender<SessionId>>,
    ) -> Result<ProcessOutcome, RuntimeError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = session_tx {
            let _ = tx.send(SessionId("fake-session".into()));
        }
        let key = (instance.to_string(), process.to_string());
        let script = {
            let scripts = self.scripts.lock().unwrap();
            scripts
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Script::Fixed(ProcessOutcome::success("ok")))
        };

        match script {
            Script::Fixed(outcome) => Ok(outcome),
            Script::NeverReturns => std::future::pending().await,
            Script::TransportError(msg) => Err(RuntimeError::TransportError(msg)),
            Script::FailThenSucceed { remaining_failures } => {
                if remaining_failures > 0 {
                    let mut scripts = self.scripts.lock().unwrap();
                    scripts.insert(
                        key,
                        Script::FailThenSucceed { remaining_failures: remaining_failures - 1 },
                    );
                    Ok(ProcessOutcome::failure("error", "E001"))
                } else {
                    Ok(ProcessOutcome::success("ok"))
                }
            }
        }
    }

    async fn expand_set(&self, _instance: &str, mdx: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self.set_expansions.get(mdx).cloned().unwrap_or_default())
    }

    async fn cancel(&self, _instance: &str, _session: &SessionId) -> Result<bool, RuntimeError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
