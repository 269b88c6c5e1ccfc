//! # rlm-engine
//!
//! A Recursive Language Model (RLM) execution engine: drives a chat
//! model through tool-using turns, executes emitted code in
//! session-scoped sandboxes, and recurses into sub-reasoners under a
//! strict depth budget.
//!
//! ## Core Components
//!
//! - **Sandbox**: stateful interpreter execution behind a black-box
//!   contract
//! - **Session**: lifecycle and per-session serialization of sandbox
//!   states
//! - **Transport**: one contract over in-process, loopback, and remote
//!   bindings
//! - **Reasoning**: the per-level conversation engine
//! - **Recursion**: depth-indexed model selection and the strict base
//!   case
//! - **Coordinator**: bounded-concurrency multiplexing of task trees
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_engine::{
//!     EngineConfig, HttpChatClient, InProcessTransport, RecursionController,
//!     SessionManager, SubprocessConfig, SubprocessRuntime, Task, TaskCoordinator,
//! };
//! use std::sync::Arc;
//!
//! let config = EngineConfig::from_env()?;
//! let runtime = Arc::new(SubprocessRuntime::new(SubprocessConfig::default())?);
//! let manager = SessionManager::shared(runtime, config.session.clone());
//! let transport = Arc::new(InProcessTransport::new(manager));
//! let client = Arc::new(HttpChatClient::new(config.model_client_config())?);
//!
//! let controller = RecursionController::new(client, transport)
//!     .with_models(config.root_model.clone(), config.sub_models.clone())
//!     .with_max_depth(config.max_depth);
//! let coordinator = TaskCoordinator::new(controller, config.coordinator_config());
//!
//! let handle = coordinator.submit(Task::new("what is 21+21?")).await?;
//! println!("{}", handle.wait().await.answer);
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod reasoning;
pub mod recursion;
pub mod repl;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-exports for convenience
pub use config::EngineConfig;
pub use coordinator::{
    CoordinatorConfig, Task, TaskCoordinator, TaskError, TaskHandle, TaskOptions, TaskResult,
};
pub use error::{Error, Result};
pub use llm::{
    ChatClient, ChatMessage, ChatRole, CompletionOptions, CompletionRequest, CompletionResponse,
    HttpChatClient, ModelClientConfig, RetryPolicy, ToolCall, ToolInvocation, ToolSpec,
    UsageRecord,
};
pub use reasoning::{LevelOutcome, ReasoningLoop};
pub use recursion::{select_model, LevelContext, RecursionController};
pub use repl::{format_outputs, format_unknown_tool, ReplEnv, SubAnswer, SubReasoner};
pub use sandbox::{
    ExecErrorKind, ExecLimits, Interpreter, Outputs, SandboxRuntime, SubprocessConfig,
    SubprocessRuntime,
};
pub use server::{execution_router, inference_router, InferRequest, InferResponse};
pub use session::{SessionConfig, SessionId, SessionManager, SessionStats, SessionSummary};
pub use telemetry::{MemorySink, NoopSink, TelemetryEvent, TelemetryEventKind, TelemetrySink};
pub use transport::{HttpTransport, InProcessTransport, Transport, TransportKind};
