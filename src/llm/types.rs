//! Chat types for requests, responses, tool calls, and usage accounting.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool name for sandboxed code execution. Always advertised when a level
/// has a session.
pub const TOOL_CODE_EXECUTION: &str = "code_execution";

/// Tool name for recursive sub-reasoner invocation. Advertised only while
/// depth budget remains.
pub const TOOL_ASK_SUB_RLM: &str = "ask_sub_rlm";

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions
    System,
    /// User/human input
    User,
    /// Assistant/model response
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

/// A structured tool invocation embedded in an assistant message.
///
/// The tool set is a closed enum: dispatch is a tagged-variant match, not
/// a string-to-handler registry. Names the model emits outside the set
/// (or with arguments that do not decode) land in `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolInvocation {
    /// Execute code in the level's sandbox session.
    CodeExecution { code: String },
    /// Ask a sub-reasoner a narrower query.
    AskSubRlm { query: String },
    /// Anything the model emitted that is not part of the tool set.
    Unknown { name: String },
}

impl ToolInvocation {
    /// The wire name of this invocation.
    pub fn name(&self) -> &str {
        match self {
            Self::CodeExecution { .. } => TOOL_CODE_EXECUTION,
            Self::AskSubRlm { .. } => TOOL_ASK_SUB_RLM,
            Self::Unknown { name } => name,
        }
    }
}

/// A single tool call, keyed by the provider-assigned call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back on the corresponding tool message
    pub id: String,
    /// The decoded invocation
    #[serde(flatten)]
    pub invocation: ToolInvocation,
}

impl ToolCall {
    /// Decode a wire-level tool call into the closed invocation set.
    ///
    /// `arguments` is the JSON-encoded argument object as providers emit
    /// it. A known name with undecodable arguments is treated as unknown.
    pub fn decode(id: impl Into<String>, name: &str, arguments: &str) -> Self {
        let invocation = match name {
            TOOL_CODE_EXECUTION => serde_json::from_str::<CodeArgs>(arguments)
                .map(|args| ToolInvocation::CodeExecution { code: args.code })
                .unwrap_or_else(|_| ToolInvocation::Unknown {
                    name: name.to_string(),
                }),
            TOOL_ASK_SUB_RLM => serde_json::from_str::<QueryArgs>(arguments)
                .map(|args| ToolInvocation::AskSubRlm { query: args.query })
                .unwrap_or_else(|_| ToolInvocation::Unknown {
                    name: name.to_string(),
                }),
            other => ToolInvocation::Unknown {
                name: other.to_string(),
            },
        };

        Self {
            id: id.into(),
            invocation,
        }
    }
}

#[derive(Deserialize)]
struct CodeArgs {
    code: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

/// A message in a level's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: ChatRole,
    /// Content of the message
    pub content: String,
    /// Tool calls carried by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages, the id of the call this result answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a new message with just role and content.
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// Create a tool result message answering a prior call.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Attach tool calls to an assistant message.
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Whether this message carries any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// An advertised tool: name, description, JSON-schema parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    /// The code-execution tool as advertised to the model.
    pub fn code_execution() -> Self {
        Self {
            name: TOOL_CODE_EXECUTION.to_string(),
            description: "Execute code in a persistent sandboxed interpreter. Variables and \
                          imports persist across calls within this conversation."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Source code to execute"
                    }
                },
                "required": ["code"]
            }),
        }
    }

    /// The sub-reasoner tool as advertised to the model.
    pub fn ask_sub_rlm() -> Self {
        Self {
            name: TOOL_ASK_SUB_RLM.to_string(),
            description: "Delegate a narrower sub-question to a recursive sub-reasoner with its \
                          own sandbox. Returns the sub-reasoner's final answer."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The sub-question to reason about"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

/// Sampling and output options for one completion call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// A chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier
    pub model: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Advertised tool set (empty means the model cannot call tools)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Sampling options
    #[serde(default)]
    pub options: CompletionOptions,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            options: CompletionOptions::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Token and wallclock accounting for one or more model calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    /// Prompt tokens served from the provider's cache; 0 when unreported
    pub cached_prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub wallclock_ms: u64,
    /// Model that produced this usage; empty when merged across models
    pub model_id: String,
}

impl UsageRecord {
    /// Create an empty record attributed to a model.
    pub fn for_model(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    /// Fold another record into this one. Token counts and wallclock add;
    /// the model id is kept only when both sides agree.
    pub fn merge(&mut self, other: &UsageRecord) {
        self.prompt_tokens += other.prompt_tokens;
        self.cached_prompt_tokens += other.cached_prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.wallclock_ms += other.wallclock_ms;
        if self.model_id != other.model_id {
            self.model_id.clear();
        }
    }

    /// Sum a sequence of records into one aggregate.
    pub fn total_of<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut iter = records.into_iter();
        let mut total = match iter.next() {
            Some(first) => first.clone(),
            None => return Self::default(),
        };
        for record in iter {
            total.merge(record);
        }
        total
    }
}

/// One assistant turn: the message, its usage, and whether the provider's
/// content filter suppressed the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub usage: UsageRecord,
    /// Set when the provider filtered the content; the message content is
    /// empty and the reasoning loop treats it as a stop signal.
    #[serde(default)]
    pub content_filtered: bool,
}
