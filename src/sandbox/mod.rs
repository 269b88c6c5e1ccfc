//! Sandbox runtime contract: execute code against a persistent
//! interpreter state, capturing output and enforcing per-execution
//! limits.
//!
//! The runtime is a black box behind two traits: [`SandboxRuntime`]
//! spawns interpreter states, [`Interpreter`] executes code against one
//! state. The production implementation runs one interpreter subprocess
//! per state; tests use a deterministic in-process fake.

mod subprocess;

#[cfg(test)]
pub mod fake;

pub use subprocess::{SubprocessConfig, SubprocessRuntime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Marker appended to a stream cut at the truncation cap.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Classification of a failed execution.
///
/// The first five kinds come from the sandbox itself. The last two are
/// orchestrator-side conditions folded into `Outputs` so the model can
/// observe them as tool results; they never appear on the execution-plane
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    Syntax,
    Runtime,
    Timeout,
    Memory,
    OutputOverflow,
    TransportUnavailable,
    SubFailed,
}

impl std::fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::Memory => "memory",
            Self::OutputOverflow => "output_overflow",
            Self::TransportUnavailable => "transport_unavailable",
            Self::SubFailed => "sub_failed",
        };
        write!(f, "{s}")
    }
}

/// Result record of one code execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    /// Captured stdout, possibly truncated
    pub stdout: String,
    /// Captured stderr (exception tracebacks land here), possibly truncated
    pub stderr: String,
    /// Wallclock duration of the execution
    pub duration_ms: u64,
    /// Error classification; absent on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ExecErrorKind>,
}

impl Outputs {
    /// A successful execution.
    pub fn ok(stdout: impl Into<String>, stderr: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms,
            error_kind: None,
        }
    }

    /// A failed execution with the given kind and stderr detail.
    pub fn error(kind: ExecErrorKind, stderr: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms,
            error_kind: Some(kind),
        }
    }

    /// An execution that never reached the sandbox because the transport
    /// failed. Reported to the model as a tool error, never retried.
    pub fn transport_unavailable(detail: impl Into<String>) -> Self {
        Self::error(ExecErrorKind::TransportUnavailable, detail, 0)
    }

    /// A sub-reasoner failure folded into tool-result form.
    pub fn sub_failed(detail: impl Into<String>) -> Self {
        Self::error(ExecErrorKind::SubFailed, detail, 0)
    }

    /// Truncate both streams to `cap` bytes, marking the cut. Sets
    /// `output_overflow` when anything was dropped and no other error is
    /// already recorded.
    pub fn truncated_to(mut self, cap: usize) -> Self {
        let mut overflowed = false;
        for stream in [&mut self.stdout, &mut self.stderr] {
            if stream.len() > cap {
                let mut cut = cap;
                while cut > 0 && !stream.is_char_boundary(cut) {
                    cut -= 1;
                }
                stream.truncate(cut);
                stream.push_str(TRUNCATION_MARKER);
                overflowed = true;
            }
        }
        if overflowed && self.error_kind.is_none() {
            self.error_kind = Some(ExecErrorKind::OutputOverflow);
        }
        self
    }
}

/// Per-execution resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecLimits {
    /// Wall-clock timeout for one execution
    pub wall_timeout_ms: u64,
    /// Address-space cap applied to the interpreter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_cap_bytes: Option<u64>,
    /// Per-stream output cap before truncation
    pub output_truncate_bytes: usize,
    /// Source-length cap; longer code is rejected before dispatch
    pub max_code_bytes: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            wall_timeout_ms: 30_000,
            memory_cap_bytes: Some(512 * 1024 * 1024),
            output_truncate_bytes: 64 * 1024,
            max_code_bytes: 256 * 1024,
        }
    }
}

impl ExecLimits {
    pub fn with_wall_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.wall_timeout_ms = timeout_ms;
        self
    }

    pub fn with_output_truncate_bytes(mut self, cap: usize) -> Self {
        self.output_truncate_bytes = cap;
        self
    }
}

/// One persistent interpreter state.
///
/// Callers must serialize access themselves; the session manager does so
/// through the per-session lock.
#[async_trait]
pub trait Interpreter: Send {
    /// Execute code against this state. In-language failures come back
    /// inside `Outputs`; an `Err` means the interpreter itself is
    /// unusable.
    async fn execute(&mut self, code: &str, limits: &ExecLimits) -> Result<Outputs>;

    /// Tear the state down. Idempotent.
    async fn shutdown(&mut self);
}

/// Factory for interpreter states.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Allocate a fresh, empty interpreter state.
    async fn spawn(&self) -> Result<Box<dyn Interpreter>>;

    /// Whether the runtime can currently spawn states.
    fn ready(&self) -> bool;
}
