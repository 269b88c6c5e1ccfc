//! Model client: typed chat-completion wrapper with tool calls.

mod client;
mod types;

#[cfg(test)]
pub mod testing;

pub use client::{ChatClient, HttpChatClient, ModelClientConfig, RetryPolicy};
pub use types::{
    ChatMessage, ChatRole, CompletionOptions, CompletionRequest, CompletionResponse, ToolCall,
    ToolInvocation, ToolSpec, UsageRecord, TOOL_ASK_SUB_RLM, TOOL_CODE_EXECUTION,
};
