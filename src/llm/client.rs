//! Chat client trait and the HTTP chat-completion implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, ToolCall, UsageRecord,
};

/// Chat client trait: one conversation round against a model.
///
/// Implementations must be thread-safe (`Send + Sync`) so one client can
/// serve every concurrent reasoning level.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one completion round: messages and tool set in, assistant
    /// message and usage out.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Configuration for the HTTP chat client.
#[derive(Debug, Clone)]
pub struct ModelClientConfig {
    /// API key for the provider
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Deadline for one model call, including retries
    pub call_timeout_ms: u64,
    /// Retry behavior for rate-limit and transient-network failures
    pub retry: RetryPolicy,
}

impl ModelClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            call_timeout_ms: 120_000,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff with full jitter for retryable model errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay used for exponential backoff
    pub base_delay_ms: u64,
    /// Cap on cumulative backoff across all retries
    pub max_total_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_total_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before retry number `attempt` (1-based), bounded by
    /// the remaining backoff budget. `None` when the budget is spent.
    fn delay_for_attempt(&self, attempt: u32, spent_ms: u64) -> Option<Duration> {
        let remaining = self.max_total_backoff_ms.checked_sub(spent_ms)?;
        if remaining == 0 {
            return None;
        }
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let ceiling = exp.min(remaining).max(1);
        // Full jitter: uniform in [0, ceiling].
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Some(Duration::from_millis(jittered))
    }
}

/// HTTP client for an OpenAI-compatible chat-completion endpoint.
pub struct HttpChatClient {
    config: ModelClientConfig,
    http: Client,
}

impl HttpChatClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ModelClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.call_timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let api_request = WireRequest::from_request(request);
        let url = format!("{}/v1/chat/completions", self.base_url());
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::TransientNetwork(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let api_response: WireResponse = serde_json::from_str(&body)
            .map_err(|e| Error::TransientNetwork(format!("Failed to parse response: {e}")))?;

        api_response.into_response(&request.model, started.elapsed().as_millis() as u64)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut spent_backoff_ms: u64 = 0;

        for attempt in 0..self.config.retry.max_attempts {
            match self.complete_once(&request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable_model_error() => {
                    let next = attempt + 1;
                    if next >= self.config.retry.max_attempts {
                        return Err(err);
                    }
                    let Some(delay) = self.config.retry.delay_for_attempt(next, spent_backoff_ms)
                    else {
                        return Err(err);
                    };
                    warn!(
                        attempt = next,
                        delay_ms = delay.as_millis() as u64,
                        "Model call failed ({err}), backing off"
                    );
                    spent_backoff_ms += delay.as_millis() as u64;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::ModelUnavailable(format!(
            "Retries exhausted after {} attempts",
            self.config.retry.max_attempts
        )))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> Error {
    Error::TransientNetwork(format!("HTTP request failed: {err}"))
}

fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = wire_error_message(body).unwrap_or_else(|| {
        let excerpt: String = body.chars().take(200).collect();
        excerpt
    });

    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication(detail),
        s if s.is_server_error() => Error::TransientNetwork(format!("{status}: {detail}")),
        _ => Error::InvalidRequest(format!("{status}: {detail}")),
    }
}

fn wire_error_message(body: &str) -> Option<String> {
    let parsed: WireError = serde_json::from_str(body).ok()?;
    Some(parsed.error.message)
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

// Wire types for the OpenAI-compatible chat-completion format.

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl WireRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        let messages = request.messages.iter().map(WireMessage::from_message).collect();
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: WireFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        Self {
            model: request.model.clone(),
            messages,
            tools,
            temperature: request.options.temperature,
            max_tokens: request.options.max_output_tokens,
            stop: request.options.stop.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn from_message(message: &ChatMessage) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: WireFunctionCall {
                            name: call.invocation.name().to_string(),
                            arguments: wire_arguments(call),
                        },
                    })
                    .collect(),
            )
        };

        Self {
            role: match message.role {
                ChatRole::System => "system".to_string(),
                ChatRole::User => "user".to_string(),
                ChatRole::Assistant => "assistant".to_string(),
                ChatRole::Tool => "tool".to_string(),
            },
            content: Some(message.content.clone()),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

fn wire_arguments(call: &ToolCall) -> String {
    use super::types::ToolInvocation;
    let value = match &call.invocation {
        ToolInvocation::CodeExecution { code } => serde_json::json!({ "code": code }),
        ToolInvocation::AskSubRlm { query } => serde_json::json!({ "query": query }),
        ToolInvocation::Unknown { .. } => serde_json::json!({}),
    };
    value.to_string()
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

impl WireResponse {
    fn into_response(self, requested_model: &str, wallclock_ms: u64) -> Result<CompletionResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::TransientNetwork("No choices in response".to_string()))?;

        let content_filtered = choice.finish_reason.as_deref() == Some("content_filter");

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall::decode(call.id, &call.function.name, &call.function.arguments))
            .collect::<Vec<_>>();

        let content = if content_filtered {
            debug!("Provider filtered completion content");
            String::new()
        } else {
            choice.message.content.unwrap_or_default()
        };

        let model_id = self.model.unwrap_or_else(|| requested_model.to_string());
        let usage = match self.usage {
            Some(u) => UsageRecord {
                prompt_tokens: u.prompt_tokens,
                cached_prompt_tokens: u
                    .prompt_tokens_details
                    .and_then(|d| d.cached_tokens)
                    .unwrap_or(0),
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                wallclock_ms,
                model_id: model_id.clone(),
            },
            None => UsageRecord {
                wallclock_ms,
                model_id: model_id.clone(),
                ..UsageRecord::default()
            },
        };

        let message = ChatMessage::assistant(content).with_tool_calls(if content_filtered {
            Vec::new()
        } else {
            tool_calls
        });

        Ok(CompletionResponse {
            message,
            usage,
            content_filtered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ToolInvocation, ToolSpec};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retry_policy_delay_bounds() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_total_backoff_ms: 1_000,
        };

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1, 0).unwrap();
            assert!(delay.as_millis() <= 200);
        }

        // Remaining budget bounds the ceiling.
        let delay = policy.delay_for_attempt(3, 990).unwrap();
        assert!(delay.as_millis() <= 10);

        // Exhausted budget stops retrying.
        assert!(policy.delay_for_attempt(2, 1_000).is_none());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "{}"),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "{}"),
            Error::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "{}"),
            Error::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{}"),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_classify_status_extracts_provider_message() {
        let body = r#"{"error": {"message": "model not found", "type": "invalid_request_error"}}"#;
        let err = classify_status(StatusCode::BAD_REQUEST, body);
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn test_wire_request_serialization() {
        let request = CompletionRequest::new(
            "m-root",
            vec![ChatMessage::system("sys"), ChatMessage::user("hello")],
        )
        .with_tools(vec![ToolSpec::code_execution()]);

        let wire = WireRequest::from_request(&request);
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["model"], "m-root");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "code_execution");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_wire_request_omits_empty_tools() {
        let request = CompletionRequest::new("m-leaf", vec![ChatMessage::user("finalize")]);
        let wire = WireRequest::from_request(&request);
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_wire_tool_message_round_trip() {
        let tool_msg = ChatMessage::tool("call_1", "<stdout>42\n</stdout>");
        let wire = WireMessage::from_message(&tool_msg);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_wire_response_parse_with_tool_calls() {
        let body = r#"{
            "id": "cmpl-1",
            "model": "m-root",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {"name": "code_execution", "arguments": "{\"code\": \"print(21+21)\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 18,
                "total_tokens": 138,
                "prompt_tokens_details": {"cached_tokens": 100}
            }
        }"#;

        let parsed: WireResponse = serde_json::from_str(body).unwrap();
        let response = parsed.into_response("m-root", 250).unwrap();

        assert!(!response.content_filtered);
        assert_eq!(response.message.tool_calls.len(), 1);
        assert_eq!(
            response.message.tool_calls[0].invocation,
            ToolInvocation::CodeExecution {
                code: "print(21+21)".to_string()
            }
        );
        assert_eq!(response.usage.prompt_tokens, 120);
        assert_eq!(response.usage.cached_prompt_tokens, 100);
        assert_eq!(response.usage.wallclock_ms, 250);
        assert_eq!(response.usage.model_id, "m-root");
    }

    #[test]
    fn test_wire_response_content_filter() {
        let body = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "partial"},
                "finish_reason": "content_filter"
            }]
        }"#;

        let parsed: WireResponse = serde_json::from_str(body).unwrap();
        let response = parsed.into_response("m-root", 10).unwrap();

        assert!(response.content_filtered);
        assert_eq!(response.message.content, "");
        assert!(!response.message.has_tool_calls());
    }

    #[test]
    fn test_wire_response_no_choices_is_error() {
        let parsed: WireResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(parsed.into_response("m", 0).is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = ModelClientConfig::new("key")
            .with_base_url("http://localhost:9999")
            .with_call_timeout_ms(5_000);
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:9999"));
        assert_eq!(config.call_timeout_ms, 5_000);
    }
}
