//! HTTP binding to a session manager behind the execution-plane surface.
//!
//! Used for both the loopback (same-pod sidecar) and remote (cross-pod)
//! topologies; the two differ only in the configured base URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sandbox::Outputs;
use crate::session::SessionId;

use super::wire::{CreateSessionRequest, CreateSessionResponse, ExecuteRequest};
use super::Transport;

/// Minimum slack added to the execute timeout for network transfer.
const NETWORK_BUDGET_MS: u64 = 5_000;

/// Pooled, keep-alive HTTP client for the execution plane.
pub struct HttpTransport {
    http: Client,
    base_url: String,
    /// Wall timeout assumed for executions that do not override it
    default_execute_timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, default_execute_timeout_ms: u64) -> Result<Self> {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_execute_timeout_ms,
        })
    }

    fn operation_timeout(&self, execute_timeout_ms: Option<u64>) -> Duration {
        let execute = execute_timeout_ms.unwrap_or(self.default_execute_timeout_ms);
        Duration::from_millis(execute + NETWORK_BUDGET_MS)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_session(&self, owner_tag: Option<&str>) -> Result<SessionId> {
        let url = format!("{}/session", self.base_url);
        let body = CreateSessionRequest {
            owner_tag: owner_tag.map(str::to_string),
        };

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_millis(NETWORK_BUDGET_MS))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("create_session: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let parsed: CreateSessionResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::transport(format!("create_session decode: {e}")))?;
                Ok(parsed.session_id)
            }
            StatusCode::SERVICE_UNAVAILABLE => Err(Error::CapacityExhausted { max_sessions: 0 }),
            status => Err(Error::transport(format!(
                "create_session: unexpected status {status}"
            ))),
        }
    }

    async fn execute(
        &self,
        session: &SessionId,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Outputs> {
        let url = format!("{}/session/{}/execute", self.base_url, session);
        let body = ExecuteRequest {
            code: code.to_string(),
            timeout_ms,
        };

        // No retries here: once the server may have observed the request,
        // re-sending could re-run non-idempotent side effects against the
        // session state.
        let response = self
            .http
            .post(&url)
            .timeout(self.operation_timeout(timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("execute: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let outputs: Outputs = response
                    .json()
                    .await
                    .map_err(|e| Error::transport(format!("execute decode: {e}")))?;
                debug!(session = %session, duration_ms = outputs.duration_ms, "Remote execution");
                Ok(outputs)
            }
            StatusCode::NOT_FOUND => Err(Error::no_such_session(session.as_str())),
            StatusCode::BAD_REQUEST => Err(Error::transport("execute: request rejected")),
            status => Err(Error::transport(format!(
                "execute: unexpected status {status}"
            ))),
        }
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let url = format!("{}/session/{}", self.base_url, session);

        let response = self
            .http
            .delete(&url)
            .timeout(Duration::from_millis(NETWORK_BUDGET_MS))
            .send()
            .await
            .map_err(|e| Error::transport(format!("destroy_session: {e}")))?;

        match response.status() {
            // Idempotent on the server: unknown sessions also return 204.
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::transport(format!(
                "destroy_session: unexpected status {status}"
            ))),
        }
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_millis(NETWORK_BUDGET_MS))
            .send()
            .await
            .map_err(|e| Error::transport(format!("health: {e}")))?;

        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::transport(format!(
                "health: unexpected status {}",
                response.status()
            )))
        }
    }
}
