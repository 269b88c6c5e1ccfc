//! Engine configuration, read from the environment.
//!
//! Only the enumerated variable names are recognized. Malformed numeric
//! values are configuration errors, never silent defaults.

use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::llm::ModelClientConfig;
use crate::session::SessionConfig;
use crate::transport::TransportKind;

/// Process-wide configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Credential for the model provider (`MODEL_API_KEY`, required)
    pub model_api_key: String,
    /// Provider endpoint override (`MODEL_BASE_URL`)
    pub model_base_url: Option<String>,
    /// Depth-0 model id (`MODEL_ROOT`)
    pub root_model: String,
    /// Models for depths >= 1 (`MODEL_SUB_LIST`, comma-separated)
    pub sub_models: Vec<String>,
    /// Depth budget (`MAX_DEPTH`, >= 1)
    pub max_depth: u32,
    /// Hard iteration cap per level (`MAX_ITERATIONS`)
    pub max_iterations: u32,
    /// Default sandbox wall timeout (`EXECUTION_TIMEOUT_MS`)
    pub execution_timeout_ms: u64,
    /// Execution-plane binding (`EXECUTE_TRANSPORT`)
    pub transport: TransportKind,
    /// Plane address for loopback/remote (`EXECUTE_SERVICE_URL`)
    pub execute_service_url: Option<String>,
    /// Coordinator permit count (`CONCURRENCY`)
    pub concurrency: usize,
    /// Reasoning worker count (`WORKER_POOL_SIZE`)
    pub worker_pool_size: usize,
    /// Session lifecycle (`SESSION_IDLE_TTL_MS`, `SESSION_ABSOLUTE_TTL_MS`,
    /// `MAX_SESSIONS`)
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_api_key: String::new(),
            model_base_url: None,
            root_model: "gpt-4o".to_string(),
            sub_models: Vec::new(),
            max_depth: 3,
            max_iterations: 20,
            execution_timeout_ms: 30_000,
            transport: TransportKind::InProcess,
            execute_service_url: None,
            concurrency: 5,
            worker_pool_size: 3,
            session: SessionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup (tests
    /// inject maps here instead of mutating the process environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        config.model_api_key = lookup("MODEL_API_KEY")
            .ok_or_else(|| Error::config("MODEL_API_KEY is required"))?;
        config.model_base_url = lookup("MODEL_BASE_URL");
        if let Some(root) = lookup("MODEL_ROOT") {
            config.root_model = root;
        }
        if let Some(subs) = lookup("MODEL_SUB_LIST") {
            config.sub_models = subs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("MAX_DEPTH") {
            config.max_depth = parse_var("MAX_DEPTH", &value)?;
            if config.max_depth == 0 {
                return Err(Error::config("MAX_DEPTH must be >= 1"));
            }
        }
        if let Some(value) = lookup("MAX_ITERATIONS") {
            config.max_iterations = parse_var("MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("EXECUTION_TIMEOUT_MS") {
            config.execution_timeout_ms = parse_var("EXECUTION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("EXECUTE_TRANSPORT") {
            config.transport = value.parse()?;
        }
        config.execute_service_url = lookup("EXECUTE_SERVICE_URL");
        if let Some(value) = lookup("CONCURRENCY") {
            config.concurrency = parse_var("CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("WORKER_POOL_SIZE") {
            config.worker_pool_size = parse_var("WORKER_POOL_SIZE", &value)?;
        }
        if let Some(value) = lookup("SESSION_IDLE_TTL_MS") {
            config.session.idle_ttl_ms = parse_var("SESSION_IDLE_TTL_MS", &value)?;
        }
        if let Some(value) = lookup("SESSION_ABSOLUTE_TTL_MS") {
            config.session.absolute_ttl_ms = parse_var("SESSION_ABSOLUTE_TTL_MS", &value)?;
        }
        if let Some(value) = lookup("MAX_SESSIONS") {
            config.session.max_sessions = parse_var("MAX_SESSIONS", &value)?;
        }

        config.session.default_limits.wall_timeout_ms = config.execution_timeout_ms;

        if matches!(
            config.transport,
            TransportKind::Loopback | TransportKind::Remote
        ) && config.execute_service_url.is_none()
        {
            return Err(Error::config(format!(
                "EXECUTE_SERVICE_URL is required for the {} transport",
                config.transport
            )));
        }

        Ok(config)
    }

    /// Model client settings derived from this configuration.
    pub fn model_client_config(&self) -> ModelClientConfig {
        let mut client = ModelClientConfig::new(self.model_api_key.clone());
        if let Some(base_url) = &self.model_base_url {
            client = client.with_base_url(base_url.clone());
        }
        client
    }

    /// Coordinator sizing derived from this configuration.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            worker_pool_size: self.worker_pool_size,
            max_concurrency: self.concurrency,
            ..CoordinatorConfig::default()
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("{name} has invalid value '{value}'")))
}
