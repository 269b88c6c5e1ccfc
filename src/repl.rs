//! REPL environment: what a reasoning level uses to service tool calls.
//!
//! Binds one transport-backed session and, while depth budget remains, a
//! sub-reasoner factory. `run_code` never raises: every failure folds
//! into `Outputs` so the model can observe it as a tool result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::llm::UsageRecord;
use crate::sandbox::Outputs;
use crate::session::SessionId;
use crate::transport::Transport;

/// Delay before the single capacity-exhausted retry at session creation.
const CAPACITY_RETRY_DELAY_MS: u64 = 1_000;

/// Final text and usage returned by a sub-reasoner invocation.
#[derive(Debug, Clone)]
pub struct SubAnswer {
    /// The sub-level's final assistant text, relayed verbatim
    pub text: String,
    /// Usage records accumulated across the sub-tree
    pub usage: Vec<UsageRecord>,
}

/// A child reasoning invocation. The parent only awaits the result; no
/// state or conversation is shared.
#[async_trait]
pub trait SubReasoner: Send + Sync {
    async fn reason(&self, query: &str) -> Result<SubAnswer>;
}

/// One level's bound session plus optional recursion.
pub struct ReplEnv {
    transport: Arc<dyn Transport>,
    session_id: SessionId,
    execute_timeout_ms: Option<u64>,
    sub: Option<Arc<dyn SubReasoner>>,
    closed: AtomicBool,
}

impl ReplEnv {
    /// Create the session eagerly and fail fast when the execution plane
    /// is unavailable. A capacity rejection is retried once after a short
    /// delay before giving up.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        owner_tag: Option<&str>,
        execute_timeout_ms: Option<u64>,
        sub: Option<Arc<dyn SubReasoner>>,
    ) -> Result<Self> {
        let session_id = match transport.create_session(owner_tag).await {
            Ok(id) => id,
            Err(Error::CapacityExhausted { .. }) => {
                debug!("Session capacity exhausted, retrying once");
                tokio::time::sleep(Duration::from_millis(CAPACITY_RETRY_DELAY_MS)).await;
                transport.create_session(owner_tag).await?
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            transport,
            session_id,
            execute_timeout_ms,
            sub,
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether this level may delegate to a sub-reasoner.
    pub fn has_sub(&self) -> bool {
        self.sub.is_some()
    }

    /// Execute code against the bound session. Transport faults come back
    /// as `transport_unavailable` outputs and the execution is not
    /// retried: the server may already have observed it.
    pub async fn run_code(&self, code: &str) -> Outputs {
        match self
            .transport
            .execute(&self.session_id, code, self.execute_timeout_ms)
            .await
        {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(session = %self.session_id, "Code execution failed: {err}");
                Outputs::transport_unavailable(err.to_string())
            }
        }
    }

    /// Delegate a narrower query to a fresh sub-reasoner. Present only
    /// when a factory was bound at construction.
    pub async fn ask_sub(&self, query: &str) -> Result<SubAnswer> {
        let Some(sub) = &self.sub else {
            return Err(Error::SubFailed(
                "No sub-reasoner at this depth".to_string(),
            ));
        };
        sub.reason(query).await
    }

    /// Destroy the bound session. Idempotent; callers must reach this on
    /// every exit path.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.transport.destroy_session(&self.session_id).await {
            warn!(session = %self.session_id, "Failed to destroy session: {err}");
        }
    }
}

/// Render execution outputs into the model-visible tool-message format:
/// three labelled sections in fixed order, empty ones omitted. When
/// everything is empty an empty stdout section is kept so the model
/// always sees one labelled section.
pub fn format_outputs(outputs: &Outputs) -> String {
    let mut sections = Vec::with_capacity(3);
    if !outputs.stdout.is_empty() {
        sections.push(format!("<stdout>{}</stdout>", outputs.stdout));
    }
    if !outputs.stderr.is_empty() {
        sections.push(format!("<stderr>{}</stderr>", outputs.stderr));
    }
    if let Some(kind) = outputs.error_kind {
        sections.push(format!("<error>{kind}</error>"));
    }
    if sections.is_empty() {
        return "<stdout></stdout>".to_string();
    }
    sections.join("\n")
}

/// Tool-message content for a call naming a tool outside the level's
/// tool set.
pub fn format_unknown_tool() -> String {
    "<error>unknown_tool</error>".to_string()
}
