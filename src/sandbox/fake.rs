//! Deterministic in-process sandbox for tests.
//!
//! Implements a toy statement language (integer assignment, `print`,
//! `pass`, `sleep <ms>`) with enough semantics to exercise state
//! persistence, isolation, name errors, and timeouts without a real
//! interpreter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ExecErrorKind, ExecLimits, Interpreter, Outputs, SandboxRuntime};

/// Test runtime tracking spawn/shutdown pairing.
#[derive(Default)]
pub struct FakeRuntime {
    spawned: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    fail_spawn: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total interpreter states ever spawned.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Total states shut down; equals `spawn_count` when no state leaked.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Make subsequent spawns fail (construction fail-fast tests).
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn spawn(&self) -> Result<Box<dyn Interpreter>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(Error::sandbox("fake spawn failure"));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInterpreter {
            vars: HashMap::new(),
            shutdowns: Arc::clone(&self.shutdowns),
            down: false,
        }))
    }

    fn ready(&self) -> bool {
        !self.fail_spawn.load(Ordering::SeqCst)
    }
}

struct FakeInterpreter {
    vars: HashMap<String, i64>,
    shutdowns: Arc<AtomicUsize>,
    down: bool,
}

#[async_trait]
impl Interpreter for FakeInterpreter {
    async fn execute(&mut self, code: &str, limits: &ExecLimits) -> Result<Outputs> {
        if code.len() > limits.max_code_bytes {
            return Err(Error::CodeTooLarge {
                len: code.len(),
                max: limits.max_code_bytes,
            });
        }
        if self.down {
            return Err(Error::sandbox("fake interpreter is shut down"));
        }

        let mut stdout = String::new();
        let mut duration_ms: u64 = 0;

        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line == "pass" {
                continue;
            }

            if let Some(ms) = line.strip_prefix("sleep ") {
                let ms: u64 = match ms.trim().parse() {
                    Ok(ms) => ms,
                    Err(_) => {
                        return Ok(Outputs::error(
                            ExecErrorKind::Syntax,
                            format!("invalid sleep duration: {line}"),
                            duration_ms,
                        )
                        .truncated_to(limits.output_truncate_bytes));
                    }
                };
                if duration_ms + ms > limits.wall_timeout_ms {
                    let wall = limits.wall_timeout_ms;
                    tokio::time::sleep(Duration::from_millis(wall.saturating_sub(duration_ms)))
                        .await;
                    return Ok(Outputs::error(
                        ExecErrorKind::Timeout,
                        "execution exceeded wall timeout",
                        wall,
                    ));
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                duration_ms += ms;
                continue;
            }

            if let Some(rest) = line.strip_prefix("print(") {
                let Some(expr) = rest.strip_suffix(')') else {
                    return Ok(Outputs::error(
                        ExecErrorKind::Syntax,
                        format!("unterminated print: {line}"),
                        duration_ms,
                    ));
                };
                match self.eval(expr) {
                    Ok(value) => {
                        stdout.push_str(&value.to_string());
                        stdout.push('\n');
                    }
                    Err(name) => {
                        return Ok(Outputs {
                            stdout,
                            stderr: format!("NameError: name '{name}' is not defined"),
                            duration_ms,
                            error_kind: Some(ExecErrorKind::Runtime),
                        }
                        .truncated_to(limits.output_truncate_bytes));
                    }
                }
                continue;
            }

            if let Some((name, expr)) = line.split_once('=') {
                let name = name.trim();
                if is_identifier(name) {
                    match self.eval(expr) {
                        Ok(value) => {
                            self.vars.insert(name.to_string(), value);
                        }
                        Err(missing) => {
                            return Ok(Outputs {
                                stdout,
                                stderr: format!("NameError: name '{missing}' is not defined"),
                                duration_ms,
                                error_kind: Some(ExecErrorKind::Runtime),
                            });
                        }
                    }
                    continue;
                }
            }

            return Ok(Outputs::error(
                ExecErrorKind::Syntax,
                format!("invalid syntax: {line}"),
                duration_ms,
            ));
        }

        Ok(Outputs::ok(stdout, "", duration_ms).truncated_to(limits.output_truncate_bytes))
    }

    async fn shutdown(&mut self) {
        if !self.down {
            self.down = true;
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl FakeInterpreter {
    /// Evaluate `+`/`*` integer expressions over literals and variables.
    /// Returns the missing name on a lookup failure.
    fn eval(&self, expr: &str) -> std::result::Result<i64, String> {
        let mut sum = 0i64;
        for addend in expr.split('+') {
            let mut product = 1i64;
            for factor in addend.split('*') {
                let factor = factor.trim();
                product *= match factor.parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => *self
                        .vars
                        .get(factor)
                        .ok_or_else(|| factor.to_string())?,
                };
            }
            sum += product;
        }
        Ok(sum)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_assignment_and_print() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let limits = ExecLimits::default();

        let outputs = interp.execute("x = 7", &limits).await.unwrap();
        assert_eq!(outputs.error_kind, None);

        let outputs = interp.execute("print(x*6)", &limits).await.unwrap();
        assert_eq!(outputs.stdout, "42\n");
    }

    #[tokio::test]
    async fn test_arithmetic() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let limits = ExecLimits::default();

        let outputs = interp.execute("print(21+21)", &limits).await.unwrap();
        assert_eq!(outputs.stdout, "42\n");

        let outputs = interp.execute("print(2*3+4)", &limits).await.unwrap();
        assert_eq!(outputs.stdout, "10\n");
    }

    #[tokio::test]
    async fn test_name_error() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();

        let outputs = interp
            .execute("print(missing)", &ExecLimits::default())
            .await
            .unwrap();
        assert_eq!(outputs.error_kind, Some(ExecErrorKind::Runtime));
        assert!(outputs.stderr.contains("NameError: name 'missing'"));
    }

    #[tokio::test]
    async fn test_pass_is_noop() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let limits = ExecLimits::default();

        let outputs = interp.execute("pass", &limits).await.unwrap();
        assert_eq!(outputs.stdout, "");
        assert_eq!(outputs.error_kind, None);

        let outputs = interp.execute("print(1)", &limits).await.unwrap();
        assert_eq!(outputs.stdout, "1\n");
    }

    #[tokio::test]
    async fn test_syntax_error() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let outputs = interp
            .execute("def broken(:", &ExecLimits::default())
            .await
            .unwrap();
        assert_eq!(outputs.error_kind, Some(ExecErrorKind::Syntax));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_timeout() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let limits = ExecLimits::default().with_wall_timeout_ms(500);

        let outputs = interp.execute("sleep 60000", &limits).await.unwrap();
        assert_eq!(outputs.error_kind, Some(ExecErrorKind::Timeout));
        assert!(outputs.duration_ms >= 500 && outputs.duration_ms <= 1_000);
    }

    #[tokio::test]
    async fn test_isolation_between_interpreters() {
        let runtime = FakeRuntime::new();
        let limits = ExecLimits::default();

        let mut a = runtime.spawn().await.unwrap();
        let mut b = runtime.spawn().await.unwrap();

        a.execute("x = 1", &limits).await.unwrap();
        let outputs = b.execute("print(x)", &limits).await.unwrap();
        assert_eq!(outputs.error_kind, Some(ExecErrorKind::Runtime));
    }

    #[tokio::test]
    async fn test_spawn_shutdown_accounting() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        assert_eq!(runtime.spawn_count(), 1);
        assert_eq!(runtime.shutdown_count(), 0);

        interp.shutdown().await;
        interp.shutdown().await;
        assert_eq!(runtime.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_truncation() {
        let runtime = FakeRuntime::new();
        let mut interp = runtime.spawn().await.unwrap();
        let limits = ExecLimits::default().with_output_truncate_bytes(4);

        let outputs = interp.execute("print(123456789)", &limits).await.unwrap();
        assert!(outputs.stdout.ends_with(super::super::TRUNCATION_MARKER));
        assert_eq!(outputs.error_kind, Some(ExecErrorKind::OutputOverflow));
    }
}
