//! Direct in-process binding over a shared session manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::sandbox::Outputs;
use crate::session::{SessionId, SessionManager};

use super::Transport;

/// Zero-serialization transport for the single-process topology.
/// Failures surface as native error values.
pub struct InProcessTransport {
    manager: Arc<SessionManager>,
}

impl InProcessTransport {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn create_session(&self, owner_tag: Option<&str>) -> Result<SessionId> {
        self.manager
            .create_session(owner_tag.map(str::to_string))
            .await
    }

    async fn execute(
        &self,
        session: &SessionId,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Outputs> {
        self.manager.execute(session, code, timeout_ms).await
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        self.manager.destroy_session(session).await;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        if self.manager.ready() {
            Ok(())
        } else {
            Err(Error::transport("Sandbox runtime is not ready"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeRuntime;
    use crate::sandbox::SandboxRuntime;
    use crate::session::SessionConfig;
    use pretty_assertions::assert_eq;

    fn transport() -> (Arc<FakeRuntime>, InProcessTransport) {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&runtime) as Arc<dyn SandboxRuntime>,
            SessionConfig {
                max_sessions: 2,
                ..SessionConfig::default()
            },
        ));
        (runtime, InProcessTransport::new(manager))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_runtime, transport) = transport();

        transport.health().await.unwrap();
        let id = transport.create_session(Some("depth-0")).await.unwrap();

        let outputs = transport.execute(&id, "print(21+21)", None).await.unwrap();
        assert_eq!(outputs.stdout, "42\n");

        transport.destroy_session(&id).await.unwrap();
        transport.destroy_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_surface_natively() {
        let (_runtime, transport) = transport();

        let err = transport
            .execute(&SessionId::from("missing"), "pass", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchSession { .. }));

        transport.create_session(None).await.unwrap();
        transport.create_session(None).await.unwrap();
        let err = transport.create_session(None).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_health_reflects_runtime() {
        let (runtime, transport) = transport();
        transport.health().await.unwrap();
        runtime.set_fail_spawn(true);
        assert!(transport.health().await.is_err());
    }
}
