//! Interpreter subprocess management.
//!
//! One subprocess per sandbox state, speaking line-delimited JSON over
//! stdin/stdout. The harness enforces the wall timeout in-band so state
//! survives a timed-out execution; the host kills the process only when
//! the harness overruns its deadline by the grace margin.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{ExecErrorKind, ExecLimits, Interpreter, Outputs, SandboxRuntime};

const HARNESS_SOURCE: &str = include_str!("harness.py");

/// Host-side margin past the wall timeout before the process is killed.
const KILL_GRACE_MS: u64 = 500;
const SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Configuration for the subprocess runtime.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Interpreter binary; discovered on PATH when unset
    pub interpreter_path: Option<String>,
    /// How long to wait for the ready handshake
    pub startup_timeout_ms: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            interpreter_path: None,
            startup_timeout_ms: 10_000,
        }
    }
}

/// Sandbox runtime that spawns one interpreter subprocess per state.
pub struct SubprocessRuntime {
    interpreter: PathBuf,
    config: SubprocessConfig,
}

impl SubprocessRuntime {
    /// Resolve the interpreter binary and build the runtime.
    pub fn new(config: SubprocessConfig) -> Result<Self> {
        let interpreter = match &config.interpreter_path {
            Some(path) => PathBuf::from(path),
            None => which::which("python3")
                .map_err(|e| Error::config(format!("No sandbox interpreter on PATH: {e}")))?,
        };

        Ok(Self {
            interpreter,
            config,
        })
    }
}

#[async_trait]
impl SandboxRuntime for SubprocessRuntime {
    async fn spawn(&self) -> Result<Box<dyn Interpreter>> {
        let startup_context = format!("interpreter='{}'", self.interpreter.display());

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(HARNESS_SOURCE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::sandbox(format!(
                    "Failed to spawn interpreter ({startup_context}): {e}"
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::sandbox("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::sandbox("Failed to get stdout handle"))?;
        let mut stdout = BufReader::new(stdout);

        let startup = Duration::from_millis(self.config.startup_timeout_ms);
        if let Err(err) = wait_for_ready(&mut stdout, startup, &startup_context).await {
            // Do not leak a subprocess when startup fails; include an
            // stderr excerpt for diagnosis.
            let excerpt = read_stderr_excerpt(&mut child).await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(match excerpt {
                Some(stderr) => Error::sandbox(format!("{err}; stderr: {stderr}")),
                None => err,
            });
        }

        debug!("Spawned sandbox interpreter ({startup_context})");

        Ok(Box::new(SubprocessInterpreter {
            child,
            stdin,
            stdout,
            next_id: 1,
            dead: false,
        }))
    }

    fn ready(&self) -> bool {
        self.interpreter.exists()
    }
}

async fn wait_for_ready(
    stdout: &mut BufReader<ChildStdout>,
    startup: Duration,
    context: &str,
) -> Result<()> {
    let mut line = String::new();
    let read = tokio::time::timeout(startup, stdout.read_line(&mut line))
        .await
        .map_err(|_| {
            Error::sandbox(format!(
                "Interpreter did not become ready within {}ms ({context})",
                startup.as_millis()
            ))
        })?
        .map_err(|e| Error::sandbox(format!("Failed to read ready message ({context}): {e}")))?;

    if read == 0 {
        return Err(Error::sandbox(format!(
            "Interpreter exited before sending ready message ({context})"
        )));
    }

    let msg: serde_json::Value = serde_json::from_str(&line)
        .map_err(|e| Error::sandbox(format!("Invalid ready message ({context}): {e}")))?;
    if msg.get("event").and_then(|v| v.as_str()) != Some("ready") {
        return Err(Error::sandbox(format!(
            "Expected ready message ({context}), got: {}",
            line.trim()
        )));
    }

    Ok(())
}

async fn read_stderr_excerpt(child: &mut Child) -> Option<String> {
    let mut stderr = child.stderr.take()?;
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(200), stderr.read_to_end(&mut buf)).await;
    if buf.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(&buf);
    let excerpt: String = text.trim().chars().take(500).collect();
    Some(excerpt)
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    id: u64,
    code: &'a str,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_cap_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ShutdownRequest {
    id: u64,
    shutdown: bool,
}

#[derive(Debug, Deserialize)]
struct WireOutputs {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    error_kind: Option<String>,
}

fn parse_error_kind(kind: &str) -> ExecErrorKind {
    match kind {
        "syntax" => ExecErrorKind::Syntax,
        "runtime" => ExecErrorKind::Runtime,
        "timeout" => ExecErrorKind::Timeout,
        "memory" => ExecErrorKind::Memory,
        "output_overflow" => ExecErrorKind::OutputOverflow,
        other => {
            warn!("Unknown sandbox error kind '{other}', reporting as runtime");
            ExecErrorKind::Runtime
        }
    }
}

/// Handle to one running interpreter subprocess.
struct SubprocessInterpreter {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    dead: bool,
}

#[async_trait]
impl Interpreter for SubprocessInterpreter {
    async fn execute(&mut self, code: &str, limits: &ExecLimits) -> Result<Outputs> {
        if code.len() > limits.max_code_bytes {
            return Err(Error::CodeTooLarge {
                len: code.len(),
                max: limits.max_code_bytes,
            });
        }
        if self.dead {
            return Err(Error::sandbox("Interpreter process is not running"));
        }

        let id = self.next_id;
        self.next_id += 1;

        let request = ExecRequest {
            id,
            code,
            timeout_ms: limits.wall_timeout_ms,
            memory_cap_bytes: limits.memory_cap_bytes,
        };
        let request_json = serde_json::to_string(&request)?;

        if let Err(e) = self.send_line(&request_json).await {
            self.dead = true;
            return Err(e);
        }

        let deadline = Duration::from_millis(limits.wall_timeout_ms + KILL_GRACE_MS);
        let started = Instant::now();

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(self.kill_after_overrun(started).await);
            }

            let mut line = String::new();
            let read = match tokio::time::timeout(remaining, self.stdout.read_line(&mut line)).await
            {
                Err(_) => return Ok(self.kill_after_overrun(started).await),
                Ok(Err(e)) => {
                    self.dead = true;
                    return Err(Error::sandbox(format!("Failed to read response: {e}")));
                }
                Ok(Ok(read)) => read,
            };

            if read == 0 {
                self.dead = true;
                return Err(Error::sandbox("Interpreter closed unexpectedly"));
            }

            let response: WireOutputs = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(e) => {
                    self.dead = true;
                    return Err(Error::sandbox(format!("Invalid response line: {e}")));
                }
            };

            // Skip stray events and stale responses.
            if response.event.is_some() || response.id != Some(id) {
                continue;
            }

            let outputs = Outputs {
                stdout: response.stdout,
                stderr: response.stderr,
                duration_ms: response.duration_ms,
                error_kind: response.error_kind.as_deref().map(parse_error_kind),
            };
            return Ok(outputs.truncated_to(limits.output_truncate_bytes));
        }
    }

    async fn shutdown(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;

        let request = ShutdownRequest {
            id: self.next_id,
            shutdown: true,
        };
        self.next_id += 1;
        if let Ok(json) = serde_json::to_string(&request) {
            let _ = self.send_line(&json).await;
        }

        let grace = Duration::from_millis(SHUTDOWN_GRACE_MS);
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!("Interpreter ignored shutdown request, killing");
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

impl SubprocessInterpreter {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::sandbox(format!("Failed to send request: {e}")))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::sandbox(format!("Failed to send request: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::sandbox(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// The harness overran its in-band timeout; kill the process. The
    /// state is gone, so the interpreter is marked dead.
    async fn kill_after_overrun(&mut self, started: Instant) -> Outputs {
        warn!("Interpreter overran wall timeout, killing process");
        self.dead = true;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Outputs::error(
            ExecErrorKind::Timeout,
            "Execution exceeded wall timeout; interpreter terminated",
            started.elapsed().as_millis() as u64,
        )
    }
}
