//! Execution transport: the polymorphic boundary between the reasoning
//! side and the session manager.
//!
//! Three interchangeable bindings share one contract: in-process direct
//! calls, loopback HTTP against a pod-local port, and remote HTTP
//! against a cluster-internal service. Everything above this module is
//! written against [`Transport`].

mod http;
mod inprocess;

pub use http::HttpTransport;
pub use inprocess::InProcessTransport;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::sandbox::Outputs;
use crate::session::SessionId;

/// Which binding a deployment uses. All levels of a process share one
/// kind; sessions are still distinct per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Direct method calls, zero serialization
    InProcess,
    /// Manager listens on a pod-local port
    Loopback,
    /// Cluster-internal service address
    Remote,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inprocess" => Ok(Self::InProcess),
            "loopback" => Ok(Self::Loopback),
            "remote" => Ok(Self::Remote),
            other => Err(Error::config(format!(
                "Unknown transport kind '{other}' (expected inprocess|loopback|remote)"
            ))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "inprocess"),
            Self::Loopback => write!(f, "loopback"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// The session manager's operations, binding-agnostic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocate a session on the execution plane.
    async fn create_session(&self, owner_tag: Option<&str>) -> Result<SessionId>;

    /// Run code against a session. A returned `Outputs` (any error kind
    /// included) means the execution happened; an `Err` means it may not
    /// have, and must not be retried blindly.
    async fn execute(
        &self,
        session: &SessionId,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Outputs>;

    /// Destroy a session. Idempotent.
    async fn destroy_session(&self, session: &SessionId) -> Result<()>;

    /// Probe the execution plane.
    async fn health(&self) -> Result<()>;
}

/// JSON bodies shared by the HTTP binding and the server surface.
pub mod wire {
    use serde::{Deserialize, Serialize};

    use crate::session::{SessionId, SessionSummary};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct CreateSessionRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub owner_tag: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreateSessionResponse {
        pub session_id: SessionId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ExecuteRequest {
        pub code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub timeout_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ErrorResponse {
        pub error: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StatusResponse {
        pub status: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionsResponse {
        pub sessions: Vec<SessionSummary>,
    }
}
