//! Recursion control: depth-indexed model selection, lineage, and the
//! strict base case.
//!
//! The recursion is a tree, never a graph. A child invocation always has
//! `depth = parent.depth + 1`, runs against its own fresh session, and
//! terminates before the parent's next model call. No component holds a
//! back-reference to its parent; the parent only awaits the child's
//! result.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::llm::{ChatClient, CompletionOptions};
use crate::reasoning::{LevelOutcome, ReasoningLoop};
use crate::repl::{ReplEnv, SubAnswer, SubReasoner};
use crate::telemetry::{NoopSink, TelemetryEvent, TelemetryEventKind, TelemetrySink};
use crate::transport::Transport;

/// Per-invocation context. Lives on the stack of one reasoning level and
/// is discarded on return.
#[derive(Debug, Clone)]
pub struct LevelContext {
    /// This invocation's depth; the root is 0
    pub depth: u32,
    /// Number of levels the task may use; the deepest is `max_depth - 1`
    pub max_depth: u32,
    /// Model serving this level
    pub model_id: String,
    /// Models configured for depths >= 1
    pub sub_model_ids: Vec<String>,
    /// Lineage: the caller's recursion id, absent at the root
    pub parent_recursion_id: Option<String>,
    /// Unique id of this invocation
    pub recursion_id: String,
    /// Tool-bearing turns allowed before forced synthesis
    pub hard_iteration_cap: u32,
}

/// Depth-indexed model selection: the root model at depth 0, then the
/// sub-model list clamped so its last entry serves all deeper levels.
pub fn select_model(root_model: &str, sub_models: &[String], depth: u32) -> String {
    if depth == 0 || sub_models.is_empty() {
        return root_model.to_string();
    }
    let index = ((depth - 1) as usize).min(sub_models.len() - 1);
    sub_models[index].clone()
}

/// Builds the right level for each invocation: resolves the model,
/// generates lineage, wires the REPL environment, and substitutes the
/// untooled leaf reasoner at the depth budget.
#[derive(Clone)]
pub struct RecursionController {
    client: Arc<dyn ChatClient>,
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn TelemetrySink>,
    root_model: String,
    sub_models: Vec<String>,
    max_depth: u32,
    hard_iteration_cap: u32,
    execute_timeout_ms: Option<u64>,
    options: CompletionOptions,
}

impl RecursionController {
    pub fn new(client: Arc<dyn ChatClient>, transport: Arc<dyn Transport>) -> Self {
        Self {
            client,
            transport,
            telemetry: Arc::new(NoopSink),
            root_model: "gpt-4o".to_string(),
            sub_models: Vec::new(),
            max_depth: 3,
            hard_iteration_cap: 20,
            execute_timeout_ms: None,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_models(mut self, root_model: impl Into<String>, sub_models: Vec<String>) -> Self {
        self.root_model = root_model.into();
        self.sub_models = sub_models;
        self
    }

    pub fn with_root_model(mut self, root_model: impl Into<String>) -> Self {
        self.root_model = root_model.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_iteration_cap(mut self, cap: u32) -> Self {
        self.hard_iteration_cap = cap;
        self
    }

    pub fn with_execute_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.execute_timeout_ms = timeout_ms;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Run a full reasoning tree rooted at depth 0.
    pub async fn reason(
        self: &Arc<Self>,
        query: &str,
        context_text: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LevelOutcome> {
        Arc::clone(self)
            .level(
                0,
                None,
                query.to_string(),
                context_text.map(str::to_string),
                cancel.clone(),
            )
            .await
    }

    fn level(
        self: Arc<Self>,
        depth: u32,
        parent_recursion_id: Option<String>,
        query: String,
        context_text: Option<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<LevelOutcome>> {
        Box::pin(async move {
            let recursion_id = Uuid::new_v4().simple().to_string();
            let ctx = LevelContext {
                depth,
                max_depth: self.max_depth,
                model_id: select_model(&self.root_model, &self.sub_models, depth),
                sub_model_ids: self.sub_models.clone(),
                parent_recursion_id: parent_recursion_id.clone(),
                recursion_id: recursion_id.clone(),
                hard_iteration_cap: self.hard_iteration_cap,
            };
            let reasoning = ReasoningLoop::new(
                Arc::clone(&self.client),
                Arc::clone(&self.telemetry),
            )
            .with_options(self.options.clone());

            // Final guard against unbounded recursion: a level landing at
            // or past the depth budget runs the untooled leaf reasoner,
            // with no session at all. Normal advertising never requests
            // this; the deepest advertised level is max_depth - 1.
            if depth >= self.max_depth {
                return reasoning
                    .run_leaf(&ctx, &query, context_text.as_deref(), &cancel)
                    .await;
            }

            self.telemetry.record(
                TelemetryEvent::new(
                    TelemetryEventKind::LevelStart,
                    recursion_id.clone(),
                    parent_recursion_id.clone(),
                    depth,
                    "level started",
                )
                .with_metadata("model", ctx.model_id.clone()),
            );

            let sub: Option<Arc<dyn SubReasoner>> = if depth + 1 < self.max_depth {
                Some(Arc::new(SubFactory {
                    controller: Arc::clone(&self),
                    child_depth: depth + 1,
                    parent_recursion_id: recursion_id.clone(),
                    cancel: cancel.clone(),
                }))
            } else {
                None
            };

            let owner_tag = format!("depth-{depth}");
            let repl = ReplEnv::connect(
                Arc::clone(&self.transport),
                Some(&owner_tag),
                self.execute_timeout_ms,
                sub,
            )
            .await?;
            debug!(
                recursion_id = %recursion_id,
                depth,
                session = %repl.session_id(),
                model = %ctx.model_id,
                "Level bound to session"
            );

            let result = reasoning
                .run(&ctx, &repl, &query, context_text.as_deref(), &cancel)
                .await;
            // Mandatory on every exit path, error returns included.
            repl.close().await;

            self.telemetry.record(TelemetryEvent::new(
                TelemetryEventKind::LevelEnd,
                recursion_id,
                parent_recursion_id,
                depth,
                match &result {
                    Ok(_) => "level completed".to_string(),
                    Err(err) => format!("level failed: {err}"),
                },
            ));

            result
        })
    }
}

/// The sub-reasoner factory bound into a level's REPL environment.
/// Invoking it enters the controller one level deeper with a fresh
/// conversation: new session, new system prompt, only the sub-query as
/// the user message.
struct SubFactory {
    controller: Arc<RecursionController>,
    child_depth: u32,
    parent_recursion_id: String,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl SubReasoner for SubFactory {
    async fn reason(&self, query: &str) -> Result<SubAnswer> {
        let outcome = Arc::clone(&self.controller)
            .level(
                self.child_depth,
                Some(self.parent_recursion_id.clone()),
                query.to_string(),
                None,
                self.cancel.clone(),
            )
            .await?;
        Ok(SubAnswer {
            text: outcome.answer,
            usage: outcome.per_call_usage,
        })
    }
}
