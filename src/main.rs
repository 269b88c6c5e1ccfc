//! Service binary: hosts the execution plane and, when model
//! credentials are configured, the inference plane.
//!
//! Configuration comes entirely from the environment; the only argument
//! is an optional bind address.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rlm_engine::{
    EngineConfig, Error, HttpChatClient, InProcessTransport, RecursionController, Result,
    SessionManager, SubprocessConfig, SubprocessRuntime, TaskCoordinator, Transport,
    TransportKind,
};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8900";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Without model credentials the binary still serves the execution
    // plane; only /infer needs the model provider.
    let has_model_key = std::env::var("MODEL_API_KEY").is_ok();
    let config = if has_model_key {
        EngineConfig::from_env()?
    } else {
        EngineConfig::from_lookup(|name| {
            if name == "MODEL_API_KEY" {
                Some(String::new())
            } else {
                std::env::var(name).ok()
            }
        })?
    };

    let runtime = Arc::new(SubprocessRuntime::new(SubprocessConfig::default())?);
    let manager = SessionManager::shared(runtime, config.session.clone());
    let mut router = rlm_engine::execution_router(Arc::clone(&manager));

    if has_model_key {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::InProcess => {
                Arc::new(InProcessTransport::new(Arc::clone(&manager)))
            }
            TransportKind::Loopback | TransportKind::Remote => {
                let url = config
                    .execute_service_url
                    .as_deref()
                    .ok_or_else(|| Error::config("EXECUTE_SERVICE_URL is required"))?;
                Arc::new(rlm_engine::HttpTransport::new(
                    url,
                    config.execution_timeout_ms,
                )?)
            }
        };
        let client = Arc::new(HttpChatClient::new(config.model_client_config())?);
        let controller = RecursionController::new(client, transport)
            .with_models(config.root_model.clone(), config.sub_models.clone())
            .with_max_depth(config.max_depth)
            .with_iteration_cap(config.max_iterations)
            .with_execute_timeout_ms(Some(config.execution_timeout_ms));
        let coordinator = Arc::new(TaskCoordinator::new(
            controller,
            config.coordinator_config(),
        ));
        router = router.merge(rlm_engine::inference_router(coordinator, None));
        info!("Inference plane enabled (root model {})", config.root_model);
    } else {
        warn!("MODEL_API_KEY not set; serving execution plane only");
    }

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {bind_addr}: {e}")))?;
    info!("Listening on {bind_addr}");

    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {e}")))?;

    manager.shutdown_all().await;
    Ok(())
}
