//! The per-level conversation engine.
//!
//! Given a query, a model id, and a REPL environment, drives a
//! tool-using conversation until the model produces a terminal assistant
//! message with no tool calls. Tool dispatch within one assistant turn is
//! strictly sequential in the order the model emitted the calls; running
//! them in parallel would break per-session serialization and make the
//! transcript order non-deterministic.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::llm::{
    ChatClient, ChatMessage, CompletionOptions, CompletionRequest, CompletionResponse, ToolCall,
    ToolInvocation, ToolSpec, UsageRecord,
};
use crate::recursion::LevelContext;
use crate::repl::{format_outputs, format_unknown_tool, ReplEnv};
use crate::sandbox::Outputs;
use crate::telemetry::{TelemetryEvent, TelemetryEventKind, TelemetrySink};

const SYSTEM_PROMPT_TOOL_ONLY: &str = "\
You are a reasoning assistant with access to a persistent sandboxed interpreter.

Use the code_execution tool to compute, verify, and explore. Variables and \
imports persist between calls, so build on earlier executions instead of \
repeating them. Tool results arrive as labelled <stdout>, <stderr> and \
<error> sections; reason about errors rather than giving up.

When you know the answer, reply in plain text with no tool calls.";

const SYSTEM_PROMPT_WITH_SUB: &str = "\
You are a reasoning assistant with access to a persistent sandboxed \
interpreter and a recursive sub-reasoner.

Use the code_execution tool to compute, verify, and explore. Variables and \
imports persist between calls, so build on earlier executions instead of \
repeating them. Tool results arrive as labelled <stdout>, <stderr> and \
<error> sections; reason about errors rather than giving up.

Use the ask_sub_rlm tool to delegate a narrower, self-contained sub-question. \
The sub-reasoner starts fresh with its own interpreter and returns only its \
final answer, so include everything it needs in the query.

When you know the answer, reply in plain text with no tool calls.";

const SYSTEM_PROMPT_LEAF: &str = "\
You are a reasoning assistant. Answer the question directly and concisely \
from what is given; you have no tools available.";

const FINALIZE_PROMPT: &str = "\
Stop using tools now. Based on the work so far, state your final answer in \
plain text.";

/// What one reasoning invocation produced.
#[derive(Debug, Clone)]
pub struct LevelOutcome {
    /// Unique id of this invocation, for telemetry correlation
    pub recursion_id: String,
    /// The terminal assistant text
    pub answer: String,
    /// One usage record per model call in this level and its sub-tree
    pub per_call_usage: Vec<UsageRecord>,
    /// Tool-bearing assistant turns consumed
    pub iterations: u32,
}

/// The conversation engine for one level. Stateless across invocations;
/// all per-invocation state lives on the stack of [`ReasoningLoop::run`].
pub struct ReasoningLoop {
    client: Arc<dyn ChatClient>,
    telemetry: Arc<dyn TelemetrySink>,
    options: CompletionOptions,
}

impl ReasoningLoop {
    pub fn new(client: Arc<dyn ChatClient>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            client,
            telemetry,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Conduct the tool-using conversation for one level.
    ///
    /// The caller owns the REPL environment and must close it on every
    /// exit path, including errors returned here.
    pub async fn run(
        &self,
        ctx: &LevelContext,
        repl: &ReplEnv,
        query: &str,
        context_text: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LevelOutcome> {
        let system = if repl.has_sub() {
            SYSTEM_PROMPT_WITH_SUB
        } else {
            SYSTEM_PROMPT_TOOL_ONLY
        };
        let tools = if repl.has_sub() {
            vec![ToolSpec::code_execution(), ToolSpec::ask_sub_rlm()]
        } else {
            vec![ToolSpec::code_execution()]
        };

        let mut messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(compose_user_message(query, context_text)),
        ];
        let mut usage: Vec<UsageRecord> = Vec::new();
        let mut iterations: u32 = 0;

        loop {
            let response = self
                .checked_complete(ctx, &messages, tools.clone(), cancel)
                .await?;
            usage.push(response.usage.clone());

            if response.content_filtered {
                // Provider suppressed the output; stop without failing.
                warn!(recursion_id = %ctx.recursion_id, "Completion content filtered");
                return Ok(LevelOutcome {
                    recursion_id: ctx.recursion_id.clone(),
                    answer: String::new(),
                    per_call_usage: usage,
                    iterations,
                });
            }

            messages.push(response.message.clone());

            if !response.message.has_tool_calls() {
                return Ok(LevelOutcome {
                    recursion_id: ctx.recursion_id.clone(),
                    answer: response.message.content,
                    per_call_usage: usage,
                    iterations,
                });
            }

            for call in &response.message.tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let content = self.dispatch(ctx, repl, call, &mut usage).await;
                messages.push(ChatMessage::tool(call.id.clone(), content));
            }

            iterations += 1;
            if iterations >= ctx.hard_iteration_cap {
                debug!(
                    recursion_id = %ctx.recursion_id,
                    cap = ctx.hard_iteration_cap,
                    "Iteration cap reached, forcing synthesis"
                );
                messages.push(ChatMessage::user(FINALIZE_PROMPT));
                let response = self
                    .checked_complete(ctx, &messages, Vec::new(), cancel)
                    .await?;
                usage.push(response.usage);
                return Ok(LevelOutcome {
                    recursion_id: ctx.recursion_id.clone(),
                    answer: response.message.content,
                    per_call_usage: usage,
                    iterations,
                });
            }
        }
    }

    /// The no-tools base case: a single model call with no tool set.
    pub async fn run_leaf(
        &self,
        ctx: &LevelContext,
        query: &str,
        context_text: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LevelOutcome> {
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT_LEAF),
            ChatMessage::user(compose_user_message(query, context_text)),
        ];
        let response = self
            .checked_complete(ctx, &messages, Vec::new(), cancel)
            .await?;

        Ok(LevelOutcome {
            recursion_id: ctx.recursion_id.clone(),
            answer: response.message.content,
            per_call_usage: vec![response.usage],
            iterations: 0,
        })
    }

    /// Dispatch one tool call; every failure folds into tool-message
    /// content so the model can observe and recover from it.
    async fn dispatch(
        &self,
        ctx: &LevelContext,
        repl: &ReplEnv,
        call: &ToolCall,
        usage: &mut Vec<UsageRecord>,
    ) -> String {
        match &call.invocation {
            ToolInvocation::CodeExecution { code } => {
                let outputs = repl.run_code(code).await;
                self.telemetry.record(
                    TelemetryEvent::new(
                        TelemetryEventKind::CodeExec,
                        ctx.recursion_id.clone(),
                        ctx.parent_recursion_id.clone(),
                        ctx.depth,
                        "code execution",
                    )
                    .with_metadata("duration_ms", outputs.duration_ms)
                    .with_metadata(
                        "error_kind",
                        outputs
                            .error_kind
                            .map(|k| k.to_string())
                            .unwrap_or_default(),
                    ),
                );
                format_outputs(&outputs)
            }
            ToolInvocation::AskSubRlm { query } if repl.has_sub() => {
                self.telemetry.record(TelemetryEvent::new(
                    TelemetryEventKind::SubCallStart,
                    ctx.recursion_id.clone(),
                    ctx.parent_recursion_id.clone(),
                    ctx.depth,
                    query.clone(),
                ));
                let content = match repl.ask_sub(query).await {
                    Ok(sub) => {
                        usage.extend(sub.usage);
                        // Relayed verbatim per the tool-message contract.
                        sub.text
                    }
                    Err(err) => {
                        warn!(recursion_id = %ctx.recursion_id, "Sub-reasoner failed: {err}");
                        format_outputs(&Outputs::sub_failed(err.to_string()))
                    }
                };
                self.telemetry.record(TelemetryEvent::new(
                    TelemetryEventKind::SubCallEnd,
                    ctx.recursion_id.clone(),
                    ctx.parent_recursion_id.clone(),
                    ctx.depth,
                    "sub-call returned",
                ));
                content
            }
            // The base case is strict: a sub-call emitted where no depth
            // budget remains never instantiates a sub-reasoner.
            ToolInvocation::AskSubRlm { .. } | ToolInvocation::Unknown { .. } => {
                format_unknown_tool()
            }
        }
    }

    async fn checked_complete(
        &self,
        ctx: &LevelContext,
        messages: &[ChatMessage],
        tools: Vec<ToolSpec>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = CompletionRequest::new(&ctx.model_id, messages.to_vec())
            .with_tools(tools)
            .with_options(self.options.clone());

        match self.client.complete(request).await {
            Ok(response) => {
                self.telemetry.record(
                    TelemetryEvent::new(
                        TelemetryEventKind::ModelCall,
                        ctx.recursion_id.clone(),
                        ctx.parent_recursion_id.clone(),
                        ctx.depth,
                        "model round",
                    )
                    .with_metadata("model", ctx.model_id.clone())
                    .with_metadata("total_tokens", response.usage.total_tokens),
                );
                Ok(response)
            }
            Err(err) => {
                self.telemetry.record(TelemetryEvent::new(
                    TelemetryEventKind::Error,
                    ctx.recursion_id.clone(),
                    ctx.parent_recursion_id.clone(),
                    ctx.depth,
                    err.to_string(),
                ));
                // The client already retried what is retryable; what is
                // left means the model is unavailable to this invocation.
                if err.is_retryable_model_error() {
                    Err(Error::ModelUnavailable(err.to_string()))
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn compose_user_message(query: &str, context_text: Option<&str>) -> String {
    match context_text {
        Some(context) if !context.is_empty() => {
            format!("<context>\n{context}\n</context>\n\n{query}")
        }
        _ => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{code_call, sub_call, unknown_call, ScriptedClient};
    use crate::llm::ChatRole;
    use crate::repl::{SubAnswer, SubReasoner};
    use crate::sandbox::fake::FakeRuntime;
    use crate::sandbox::SandboxRuntime;
    use crate::session::{SessionConfig, SessionManager};
    use crate::telemetry::{MemorySink, NoopSink};
    use crate::transport::{InProcessTransport, Transport};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn ctx(depth: u32, max_depth: u32) -> LevelContext {
        LevelContext {
            depth,
            max_depth,
            model_id: "m-test".to_string(),
            sub_model_ids: vec!["m-sub".to_string()],
            parent_recursion_id: None,
            recursion_id: format!("rid-{depth}"),
            hard_iteration_cap: 20,
        }
    }

    fn plane() -> (Arc<FakeRuntime>, Arc<dyn Transport>) {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&runtime) as Arc<dyn SandboxRuntime>,
            SessionConfig::default(),
        ));
        (runtime, Arc::new(InProcessTransport::new(manager)))
    }

    async fn repl_without_sub(transport: &Arc<dyn Transport>) -> ReplEnv {
        ReplEnv::connect(Arc::clone(transport), None, None, None)
            .await
            .unwrap()
    }

    struct FixedSub {
        answer: String,
    }

    #[async_trait]
    impl SubReasoner for FixedSub {
        async fn reason(&self, _query: &str) -> crate::error::Result<SubAnswer> {
            Ok(SubAnswer {
                text: self.answer.clone(),
                usage: vec![UsageRecord {
                    total_tokens: 7,
                    model_id: "m-sub".to_string(),
                    ..UsageRecord::default()
                }],
            })
        }
    }

    struct FailingSub;

    #[async_trait]
    impl SubReasoner for FailingSub {
        async fn reason(&self, _query: &str) -> crate::error::Result<SubAnswer> {
            Err(Error::SubFailed("child exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hello_world_single_code_call() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![code_call("call_1", "print(21+21)")]);
        client.push_text("The answer is 42.");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(
                &ctx(0, 1),
                &repl,
                "print 21+21",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        repl.close().await;

        assert!(outcome.answer.contains("42"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.per_call_usage.len(), 2);

        // The tool observation was appended with the call id and the
        // labelled output format.
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        let tool_msg = &requests[1].messages[3];
        assert_eq!(tool_msg.role, ChatRole::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.content, "<stdout>42\n</stdout>");
    }

    #[tokio::test]
    async fn test_tool_set_without_sub_excludes_ask_sub() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("done");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        let tools = &client.requests()[0].tools;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "code_execution");
    }

    #[tokio::test]
    async fn test_tool_set_with_sub_includes_both() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("done");

        let (_runtime, transport) = plane();
        let repl = ReplEnv::connect(
            Arc::clone(&transport),
            None,
            None,
            Some(Arc::new(FixedSub {
                answer: "7".to_string(),
            })),
        )
        .await
        .unwrap();
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        reasoning
            .run(&ctx(0, 2), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        let tools = &client.requests()[0].tools;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["code_execution", "ask_sub_rlm"]);
    }

    #[tokio::test]
    async fn test_sub_answer_relayed_verbatim() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![sub_call("call_s", "what is 3+4")]);
        client.push_text("It is 7.");

        let (_runtime, transport) = plane();
        let repl = ReplEnv::connect(
            Arc::clone(&transport),
            None,
            None,
            Some(Arc::new(FixedSub {
                answer: "7".to_string(),
            })),
        )
        .await
        .unwrap();
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(&ctx(0, 2), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert!(outcome.answer.contains('7'));
        let tool_msg = &client.requests()[1].messages[3];
        assert_eq!(tool_msg.content, "7");
        // Sub-tree usage is folded into the level's records.
        assert!(outcome
            .per_call_usage
            .iter()
            .any(|u| u.model_id == "m-sub"));
    }

    #[tokio::test]
    async fn test_sub_failure_becomes_tool_error() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![sub_call("call_s", "q")]);
        client.push_text("giving up");

        let (_runtime, transport) = plane();
        let repl = ReplEnv::connect(
            Arc::clone(&transport),
            None,
            None,
            Some(Arc::new(FailingSub)),
        )
        .await
        .unwrap();
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(&ctx(0, 2), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        // The parent loop continued to a final answer.
        assert_eq!(outcome.answer, "giving up");
        let tool_msg = &client.requests()[1].messages[3];
        assert!(tool_msg.content.contains("<error>sub_failed</error>"));
    }

    #[tokio::test]
    async fn test_base_case_strict_no_sub_instantiated() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![sub_call("call_s", "recurse anyway")]);
        client.push_text("fine, directly then");

        let (runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let spawns_before = runtime.spawn_count();
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(&ctx(1, 2), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert_eq!(outcome.answer, "fine, directly then");
        // No new session appeared for the rejected sub-call.
        assert_eq!(runtime.spawn_count(), spawns_before);
        let tool_msg = &client.requests()[1].messages[3];
        assert_eq!(tool_msg.content, "<error>unknown_tool</error>");
    }

    #[tokio::test]
    async fn test_unknown_tool_does_not_fail_loop() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![unknown_call("call_u", "fetch_url")]);
        client.push_text("done without it");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert_eq!(outcome.answer, "done without it");
        let tool_msg = &client.requests()[1].messages[3];
        assert_eq!(tool_msg.content, "<error>unknown_tool</error>");
    }

    #[tokio::test]
    async fn test_observation_order_matches_emission_order() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![
            code_call("call_a", "print(1)"),
            code_call("call_b", "print(2)"),
        ]);
        client.push_text("done");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        let messages = &client.requests()[1].messages;
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(messages[3].content, "<stdout>1\n</stdout>");
        assert_eq!(messages[4].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(messages[4].content, "<stdout>2\n</stdout>");
    }

    #[tokio::test]
    async fn test_iteration_cap_forces_synthesis() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![code_call("c1", "pass")]);
        client.push_tool_calls(vec![code_call("c2", "pass")]);
        client.push_text("forced final");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let mut level = ctx(0, 1);
        level.hard_iteration_cap = 2;

        let outcome = reasoning
            .run(&level, &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert_eq!(outcome.answer, "forced final");
        assert_eq!(outcome.iterations, 2);

        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        // The synthesis turn advertises no tools and follows the
        // synthetic finalize instruction.
        assert!(requests[2].tools.is_empty());
        let last_user = requests[2].messages.last().unwrap();
        assert_eq!(last_user.role, ChatRole::User);
        assert_eq!(last_user.content, FINALIZE_PROMPT);
    }

    #[tokio::test]
    async fn test_content_filtered_stops_loop() {
        let client = Arc::new(ScriptedClient::new());
        client.push_filtered();

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let outcome = reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert_eq!(outcome.answer, "");
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_model_visible() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![code_call("c1", "print(1)")]);
        client.push_text("observed the failure");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        // Destroy the session out from under the level.
        transport.destroy_session(repl.session_id()).await.unwrap();

        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));
        let outcome = reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        assert_eq!(outcome.answer, "observed the failure");
        let tool_msg = &client.requests()[1].messages[3];
        assert!(tool_msg
            .content
            .contains("<error>transport_unavailable</error>"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_model_unavailable() {
        let client = Arc::new(ScriptedClient::new());
        client.push_error(Error::RateLimited("try later".to_string()));

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let err = reasoning
            .run(&ctx(0, 1), &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap_err();
        repl.close().await;

        assert!(matches!(err, Error::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cancellation_checked_before_model_call() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("never reached");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reasoning
            .run(&ctx(0, 1), &repl, "q", None, &cancel)
            .await
            .unwrap_err();
        repl.close().await;

        assert!(matches!(err, Error::Cancelled));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_leaf_is_single_untooled_call() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("leaf answer");

        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));
        let outcome = reasoning
            .run_leaf(&ctx(2, 2), "q", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer, "leaf answer");
        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_empty());
        assert_eq!(requests[0].messages[0].content, SYSTEM_PROMPT_LEAF);
    }

    #[tokio::test]
    async fn test_context_text_composed_into_user_message() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("ok");

        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), Arc::new(NoopSink));

        reasoning
            .run(
                &ctx(0, 1),
                &repl,
                "the question",
                Some("background facts"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        repl.close().await;

        let user = &client.requests()[0].messages[1];
        assert!(user.content.contains("background facts"));
        assert!(user.content.ends_with("the question"));
    }

    #[tokio::test]
    async fn test_telemetry_lineage_on_events() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_calls(vec![code_call("c1", "print(1)")]);
        client.push_text("done");

        let sink = Arc::new(MemorySink::new());
        let (_runtime, transport) = plane();
        let repl = repl_without_sub(&transport).await;
        let reasoning = ReasoningLoop::new(client.clone(), sink.clone());

        let mut level = ctx(1, 2);
        level.parent_recursion_id = Some("rid-parent".to_string());

        reasoning
            .run(&level, &repl, "q", None, &CancellationToken::new())
            .await
            .unwrap();
        repl.close().await;

        let events = sink.events();
        assert!(!events.is_empty());
        for event in &events {
            assert_eq!(event.recursion_id, "rid-1");
            assert_eq!(event.parent_recursion_id.as_deref(), Some("rid-parent"));
            assert_eq!(event.depth, 1);
        }
        assert!(events
            .iter()
            .any(|e| e.kind == TelemetryEventKind::CodeExec));
    }
}
