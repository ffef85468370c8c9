//! `reqwest`-backed [`RemoteClient`] implementation. Pools one client per
//! logical instance name, mirroring the teacher's use of `DashMap` for
//! concurrency-safe lookup maps shared across worker tasks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rushti_core::{ConnectionDescriptor, RuntimeError};
use serde::Deserialize;

use crate::{ProcessOutcome, RemoteClient, SessionId};

pub struct HttpRemoteClient {
    connections: BTreeMap<String, ConnectionDescriptor>,
    clients: DashMap<String, reqwest::Client>,
}

impl HttpRemoteClient {
    pub fn new(connections: BTreeMap<String, ConnectionDescriptor>) -> Self {
        Self { connections, clients: DashMap::new() }
    }

    fn client_for(&self, instance: &str) -> Result<reqwest::Client, RuntimeError> {
        if let Some(existing) = self.clients.get(instance) {
            return Ok(existing.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| RuntimeError::TransportError(e.to_string()))?;
        self.clients.insert(instance.to_string(), client.clone());
        Ok(client)
    }

    fn base_url(&self, instance: &str) -> Result<String, RuntimeError> {
        let conn = self.connections.get(instance).ok_or_else(|| {
            RuntimeError::TransportError(format!("unknown instance '{instance}'"))
        })?;
        let scheme = if conn.ssl { "https" } else { "http" };
        Ok(format!("{scheme}://{}:{}", conn.address, conn.port))
    }

    /// Polls an async operation's `Location` URL until the server reports a
    /// terminal status, honoring `Retry-After` when given.
    async fn poll_until_complete(
        &self,
        client: &reqwest::Client,
        location: &str,
    ) -> Result<ProcessOutcome, RuntimeError> {
        loop {
            let response = client
                .get(location)
                .send()
                .await
                .map_err(|e| RuntimeError::TransportError(e.to_string()))?;

            if response.status().as_u16() == 202 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if !response.status().is_success() {
                return Err(RuntimeError::RemoteFailure(format!(
                    "HTTP {} polling operation",
                    response.status()
                )));
            }

            let body: RunProcessResponse = response
                .json()
                .await
                .map_err(|e| RuntimeError::TransportError(e.to_string()))?;
            return Ok(outcome_from_body(body));
        }
    }
}

#[derive(Deserialize)]
struct RunProcessResponse {
    success: bool,
    status: String,
    #[serde(default)]
    error_ref: Option<String>,
}

#[derive(Deserialize)]
struct ExpandSetResponse {
    elements: Vec<String>,
}

fn outcome_from_body(body: RunProcessResponse) -> ProcessOutcome {
    if body.success {
        ProcessOutcome::success(body.status)
    } else if let Some(err_ref) = body.error_ref {
        ProcessOutcome::failure(body.status, err_ref)
    } else {
        ProcessOutcome::minor_errors(body.status)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn run_process(
        &self,
        instance: &str,
        process: &str,
        parameters: &BTreeMap<String, String>,
        session_tx: Option<tokio::sync::oneshot::Sender<SessionId>>,
    ) -> Result<ProcessOutcome, RuntimeError> {
        let client = self.client_for(instance)?;
        let base = self.base_url(instance)?;
        let url = format!("{base}/api/v1/Processes('{process}')/tm1.ExecuteWithReturn");

        // `Prefer: respond-async` asks the server to hand back a 202 and a
        // `Location` to poll rather than holding the connection open for the
        // whole run. Either way the session id header is present on the
        // first response, before we've read a body at all, so we can hand
        // it to `session_tx` immediately -- well before the process (and
        // this function) completes.
        let response = client
            .post(url)
            .header("Prefer", "respond-async")
            .json(&serde_json::json!({ "Parameters": parameters }))
            .send()
            .await
            .map_err(|e| RuntimeError::TransportError(e.to_string()))?;

        if let (Some(session), Some(tx)) = (
            response.headers().get("X-TM1-Session-Id").and_then(|v| v.to_str().ok()),
            session_tx,
        ) {
            let _ = tx.send(SessionId(session.to_string()));
        }

        if response.status().as_u16() == 202 {
            let location = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    RuntimeError::TransportError("202 response missing Location header".into())
                })?;
            return self.poll_until_complete(&client, &location).await;
        }

        if !response.status().is_success() {
            return Err(RuntimeError::RemoteFailure(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: RunProcessResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::TransportError(e.to_string()))?;
        Ok(outcome_from_body(body))
    }

    async fn expand_set(&self, instance: &str, mdx: &str) -> Result<Vec<String>, RuntimeError> {
        let client = self.client_for(instance)?;
        let base = self.base_url(instance)?;
        let url = format!("{base}/api/v1/ExecuteMDXSet");

        let response = client
            .post(url)
            .json(&serde_json::json!({ "MDX": mdx }))
            .send()
            .await
            .map_err(|e| RuntimeError::TransportError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::TransportError(format!(
                "HTTP {} evaluating set expression",
                response.status()
            )));
        }

        let body: ExpandSetResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::TransportError(e.to_string()))?;
        Ok(body.elements)
    }

    async fn cancel(&self, instance: &str, session: &SessionId) -> Result<bool, RuntimeError> {
        let client = self.client_for(instance)?;
        let base = self.base_url(instance)?;
        let url = format!("{base}/api/v1/Sessions('{}')/tm1.Cancel", session.0);

        match client.post(url).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) if response.status().as_u16() == 501 => {
                tracing::warn!(instance, "remote server does not support cancellation");
                Ok(false)
            }
            Ok(response) => Err(RuntimeError::TransportError(format!(
                "HTTP {} cancelling session",
                response.status()
            ))),
            Err(e) => Err(RuntimeError::TransportError(e.to_string())),
        }
    }
}
