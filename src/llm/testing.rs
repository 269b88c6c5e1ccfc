//! Scripted chat client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::types::{
    ChatMessage, CompletionRequest, CompletionResponse, ToolCall, UsageRecord,
};
use super::ChatClient;

/// Plays back a fixed sequence of completion results and records every
/// request it saw.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<CompletionResponse>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain assistant text turn.
    pub fn push_text(&self, content: &str) {
        self.push_response(response_with(ChatMessage::assistant(content)));
    }

    /// Queue an assistant turn carrying tool calls.
    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) {
        self.push_response(response_with(
            ChatMessage::assistant("").with_tool_calls(calls),
        ));
    }

    /// Queue a content-filtered turn.
    pub fn push_filtered(&self) {
        let mut response = response_with(ChatMessage::assistant(""));
        response.content_filtered = true;
        self.push_response(response);
    }

    /// Queue an error result.
    pub fn push_error(&self, err: Error) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Err(err));
    }

    pub fn push_response(&self, response: CompletionResponse) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Ok(response));
    }

    /// Every request the client has served, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock poisoned").len()
    }
}

fn response_with(message: ChatMessage) -> CompletionResponse {
    CompletionResponse {
        message,
        usage: UsageRecord {
            prompt_tokens: 10,
            cached_prompt_tokens: 0,
            completion_tokens: 5,
            total_tokens: 15,
            wallclock_ms: 1,
            model_id: "scripted".to_string(),
        },
        content_filtered: false,
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push(request);
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(Error::Internal(
                    "ScriptedClient ran out of scripted responses".to_string(),
                ))
            })
    }
}

/// Build a `code_execution` tool call for scripting.
pub fn code_call(id: &str, code: &str) -> ToolCall {
    ToolCall::decode(
        id,
        super::types::TOOL_CODE_EXECUTION,
        &serde_json::json!({ "code": code }).to_string(),
    )
}

/// Build an `ask_sub_rlm` tool call for scripting.
pub fn sub_call(id: &str, query: &str) -> ToolCall {
    ToolCall::decode(
        id,
        super::types::TOOL_ASK_SUB_RLM,
        &serde_json::json!({ "query": query }).to_string(),
    )
}

/// Build a tool call outside the tool set.
pub fn unknown_call(id: &str, name: &str) -> ToolCall {
    ToolCall::decode(id, name, "{}")
}
