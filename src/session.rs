//! Session management: live sandbox states keyed by opaque ids.
//!
//! The manager owns the only map of sessions and the per-session lock
//! that serializes executions. A background reaper destroys sessions
//! past their idle or absolute TTL; capacity exhaustion rejects new
//! sessions rather than evicting victims.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sandbox::{ExecLimits, Interpreter, Outputs, SandboxRuntime};

/// Opaque session identifier: 128 bits from a cryptographic RNG, so ids
/// stay unguessable when the execution plane is exposed beyond a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Live-session cap; `create_session` fails beyond it
    pub max_sessions: usize,
    /// Idle eviction threshold
    pub idle_ttl_ms: u64,
    /// Hard lifetime cap regardless of activity
    pub absolute_ttl_ms: u64,
    /// Reaper scan cadence
    pub reap_interval_ms: u64,
    /// Limits applied when an execution does not override them
    pub default_limits: ExecLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_ttl_ms: 600_000,
            absolute_ttl_ms: 3_600_000,
            reap_interval_ms: 30_000,
            default_limits: ExecLimits::default(),
        }
    }
}

/// Observable per-session record (for `/sessions` only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub execution_counter: u64,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub total_created: u64,
    pub active: usize,
}

struct SessionHandle {
    id: SessionId,
    owner_tag: Option<String>,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    /// Wall-clock and monotonic liveness, updated after each execution.
    liveness: StdMutex<(DateTime<Utc>, Instant)>,
    execution_counter: AtomicU64,
    /// Set by destroy so waiters holding a stale handle fail cleanly.
    closed: AtomicBool,
    /// The per-session serialization point. FIFO on this lock is the
    /// only ordering guarantee across executions on one session.
    interpreter: Mutex<Box<dyn Interpreter>>,
}

impl SessionHandle {
    fn summary(&self) -> SessionSummary {
        let liveness = self.liveness.lock().expect("liveness lock poisoned");
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_used_at: liveness.0,
            execution_counter: self.execution_counter.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        *liveness = (Utc::now(), Instant::now());
    }

    fn idle_for(&self) -> Duration {
        let liveness = self.liveness.lock().expect("liveness lock poisoned");
        liveness.1.elapsed()
    }

    fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }
}

/// Owns the set of live sandbox states and serializes execution per
/// session. Executions across distinct sessions run fully concurrently.
pub struct SessionManager {
    runtime: Arc<dyn SandboxRuntime>,
    config: SessionConfig,
    sessions: StdMutex<HashMap<SessionId, Arc<SessionHandle>>>,
    total_created: AtomicU64,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SessionConfig) -> Self {
        Self {
            runtime,
            config,
            sessions: StdMutex::new(HashMap::new()),
            total_created: AtomicU64::new(0),
        }
    }

    /// Build a shared manager with its background reaper running. The
    /// reaper holds only a weak reference and exits when the manager is
    /// dropped.
    pub fn shared(runtime: Arc<dyn SandboxRuntime>, config: SessionConfig) -> Arc<Self> {
        let manager = Arc::new(Self::new(runtime, config));
        Self::spawn_reaper(&manager);
        manager
    }

    fn spawn_reaper(manager: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(manager);
        let interval_ms = manager.config.reap_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.reap_expired().await;
            }
        });
    }

    /// Whether the sandbox runtime can currently serve new sessions.
    pub fn ready(&self) -> bool {
        self.runtime.ready()
    }

    /// Allocate a fresh sandbox state and register it.
    pub async fn create_session(&self, owner_tag: Option<String>) -> Result<SessionId> {
        self.check_capacity()?;

        let interpreter = self.runtime.spawn().await?;
        let id = SessionId::generate();
        let now = Utc::now();
        let now_instant = Instant::now();
        let mut handle = Arc::new(SessionHandle {
            id: id.clone(),
            owner_tag,
            created_at: now,
            created_instant: now_instant,
            liveness: StdMutex::new((now, now_instant)),
            execution_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            interpreter: Mutex::new(interpreter),
        });

        let at_capacity = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            // Re-check under the lock: spawning happened outside it.
            if sessions.len() >= self.config.max_sessions {
                true
            } else {
                sessions.insert(id.clone(), Arc::clone(&handle));
                false
            }
        };

        if at_capacity {
            if let Some(handle) = Arc::get_mut(&mut handle) {
                handle.interpreter.get_mut().shutdown().await;
            }
            return Err(Error::CapacityExhausted {
                max_sessions: self.config.max_sessions,
            });
        }

        self.total_created.fetch_add(1, Ordering::Relaxed);
        info!(session = %id, "Created session");
        Ok(id)
    }

    fn check_capacity(&self) -> Result<()> {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        if sessions.len() >= self.config.max_sessions {
            return Err(Error::CapacityExhausted {
                max_sessions: self.config.max_sessions,
            });
        }
        Ok(())
    }

    fn lookup(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::no_such_session(id.as_str()))
    }

    /// Execute code against a session with the default limits, optionally
    /// overriding the wall timeout. Blocks until the session is free;
    /// executions apply in lock-acquisition (FIFO) order.
    pub async fn execute(
        &self,
        id: &SessionId,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Outputs> {
        let mut limits = self.config.default_limits.clone();
        if let Some(timeout_ms) = timeout_ms {
            limits.wall_timeout_ms = timeout_ms;
        }
        self.execute_with_limits(id, code, &limits).await
    }

    /// Execute with fully caller-specified limits.
    pub async fn execute_with_limits(
        &self,
        id: &SessionId,
        code: &str,
        limits: &ExecLimits,
    ) -> Result<Outputs> {
        let handle = self.lookup(id)?;
        let mut interpreter = handle.interpreter.lock().await;
        if handle.closed.load(Ordering::Acquire) {
            return Err(Error::no_such_session(id.as_str()));
        }

        let outputs = interpreter.execute(code, limits).await?;
        handle.execution_counter.fetch_add(1, Ordering::Relaxed);
        handle.touch();
        debug!(
            session = %id,
            duration_ms = outputs.duration_ms,
            error_kind = ?outputs.error_kind,
            "Executed code"
        );
        Ok(outputs)
    }

    /// Non-blocking execute variant; fails with `SessionBusy` instead of
    /// queueing behind an in-flight execution.
    pub async fn try_execute(
        &self,
        id: &SessionId,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Outputs> {
        let handle = self.lookup(id)?;
        let mut interpreter = handle
            .interpreter
            .try_lock()
            .map_err(|_| Error::SessionBusy {
                session_id: id.to_string(),
            })?;
        if handle.closed.load(Ordering::Acquire) {
            return Err(Error::no_such_session(id.as_str()));
        }

        let mut limits = self.config.default_limits.clone();
        if let Some(timeout_ms) = timeout_ms {
            limits.wall_timeout_ms = timeout_ms;
        }
        let outputs = interpreter.execute(code, &limits).await?;
        handle.execution_counter.fetch_add(1, Ordering::Relaxed);
        handle.touch();
        Ok(outputs)
    }

    /// Destroy a session. Idempotent: unknown ids succeed. Waits for any
    /// in-flight execution before tearing down the sandbox state.
    pub async fn destroy_session(&self, id: &SessionId) {
        let handle = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            sessions.remove(id)
        };
        let Some(handle) = handle else {
            return;
        };

        handle.closed.store(true, Ordering::Release);
        let mut interpreter = handle.interpreter.lock().await;
        interpreter.shutdown().await;
        info!(session = %id, "Destroyed session");
    }

    /// Snapshot of live sessions, for observability only.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions.values().map(|handle| handle.summary()).collect()
    }

    pub fn stats(&self) -> SessionStats {
        let active = self
            .sessions
            .lock()
            .expect("session map lock poisoned")
            .len();
        SessionStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            active,
        }
    }

    /// One reaper pass: destroy every session past its idle or absolute
    /// TTL. Returns how many were destroyed.
    pub async fn reap_expired(&self) -> usize {
        let idle_ttl = Duration::from_millis(self.config.idle_ttl_ms);
        let absolute_ttl = Duration::from_millis(self.config.absolute_ttl_ms);

        let expired: Vec<SessionId> = {
            let sessions = self.sessions.lock().expect("session map lock poisoned");
            sessions
                .values()
                .filter(|handle| handle.idle_for() > idle_ttl || handle.age() > absolute_ttl)
                .map(|handle| handle.id.clone())
                .collect()
        };

        for id in &expired {
            warn!(session = %id, "Reaping expired session");
            self.destroy_session(id).await;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Reaped expired sessions");
        }
        expired.len()
    }

    /// Destroy every live session (graceful shutdown).
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = {
            let sessions = self.sessions.lock().expect("session map lock poisoned");
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.destroy_session(&id).await;
        }
    }

    /// Owner tag recorded at creation, if any.
    pub fn owner_tag(&self, id: &SessionId) -> Result<Option<String>> {
        Ok(self.lookup(id)?.owner_tag.clone())
    }
}
