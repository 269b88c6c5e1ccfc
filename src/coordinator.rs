//! Task coordination: bounded concurrency over a pool of reasoning
//! workers.
//!
//! A global semaphore of `C` permits caps in-flight tasks end-to-end;
//! one permit covers a task's whole recursion tree, so sub-invocations
//! never acquire more. Workers pull queued tasks in arrival order.
//! Cancellation is cooperative: the token is checked at every I/O
//! suspension point down the tree, and child sessions are closed before
//! the task resolves.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::llm::UsageRecord;
use crate::reasoning::LevelOutcome;
use crate::recursion::RecursionController;

/// One unit of work for the coordinator.
#[derive(Debug, Clone)]
pub struct Task {
    pub query: String,
    pub context_text: Option<String>,
    pub options: TaskOptions,
}

impl Task {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context_text: None,
            options: TaskOptions::default(),
        }
    }

    pub fn with_context(mut self, context_text: impl Into<String>) -> Self {
        self.context_text = Some(context_text.into());
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// Per-task overrides over the coordinator's base configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub max_depth: Option<u32>,
    pub execute_timeout_ms: Option<u64>,
    /// End-to-end deadline; none by default
    pub task_timeout_ms: Option<u64>,
    pub root_model: Option<String>,
}

/// Typed failure carried on a task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TaskError {
    Cancelled,
    Timeout,
    ModelUnavailable(String),
    InvalidRequest(String),
    Authentication(String),
    Internal(String),
}

impl TaskError {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::Cancelled => Self::Cancelled,
            Error::TaskTimeout { .. } => Self::Timeout,
            Error::ModelUnavailable(detail)
            | Error::RateLimited(detail)
            | Error::TransientNetwork(detail) => Self::ModelUnavailable(detail.clone()),
            Error::InvalidRequest(detail) => Self::InvalidRequest(detail.clone()),
            Error::Authentication(detail) => Self::Authentication(detail.clone()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::ModelUnavailable(detail) => write!(f, "model_unavailable: {detail}"),
            Self::InvalidRequest(detail) => write!(f, "invalid_request: {detail}"),
            Self::Authentication(detail) => write!(f, "authentication: {detail}"),
            Self::Internal(detail) => write!(f, "internal: {detail}"),
        }
    }
}

/// What a completed task hands back.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub answer: String,
    pub usage_total: UsageRecord,
    pub per_level_usage: Vec<UsageRecord>,
    pub wallclock_ms: u64,
    /// Root recursion id; absent when the task failed before its root
    /// level started
    pub recursion_id: Option<String>,
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failure(error: TaskError, wallclock_ms: u64) -> Self {
        Self {
            answer: String::new(),
            usage_total: UsageRecord::default(),
            per_level_usage: Vec::new(),
            wallclock_ms,
            recursion_id: None,
            error: Some(error),
        }
    }
}

/// Awaitable handle for one submitted task.
pub struct TaskHandle {
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Cancel the whole tree of this task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the task to resolve.
    pub async fn wait(self) -> TaskResult {
        self.result_rx.await.unwrap_or_else(|_| {
            TaskResult::failure(
                TaskError::Internal("Worker dropped before resolving the task".to_string()),
                0,
            )
        })
    }
}

/// Coordinator sizing.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Reasoning workers pulling from the queue
    pub worker_pool_size: usize,
    /// Global in-flight permit count (whole trees, not levels)
    pub max_concurrency: usize,
    /// Queue bound; keeps shed load from accumulating without limit
    pub queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 3,
            max_concurrency: 5,
            queue_capacity: 64,
        }
    }
}

struct QueuedTask {
    task: Task,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
    result_tx: oneshot::Sender<TaskResult>,
}

/// Async entry point for batch or server workloads.
pub struct TaskCoordinator {
    controller: Arc<RecursionController>,
    queue_tx: mpsc::Sender<QueuedTask>,
    semaphore: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskCoordinator {
    pub fn new(controller: RecursionController, config: CoordinatorConfig) -> Self {
        let controller = Arc::new(controller);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

        let workers = (0..config.worker_pool_size.max(1))
            .map(|worker| {
                let controller = Arc::clone(&controller);
                let queue_rx = Arc::clone(&queue_rx);
                tokio::spawn(worker_loop(worker, controller, queue_rx))
            })
            .collect();

        Self {
            controller,
            queue_tx,
            semaphore,
            workers,
        }
    }

    /// Enqueue one task. Suspends while the permit pool is saturated;
    /// the returned handle resolves when the task's tree completes.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("Coordinator semaphore closed".to_string()))?;

        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();

        self.queue_tx
            .send(QueuedTask {
                task,
                cancel: cancel.clone(),
                permit,
                result_tx,
            })
            .await
            .map_err(|_| Error::Internal("Coordinator queue closed".to_string()))?;

        Ok(TaskHandle { cancel, result_rx })
    }

    /// Enqueue a batch in order; handles come back in the same order.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskHandle>> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            handles.push(self.submit(task).await?);
        }
        Ok(handles)
    }

    /// The base controller this coordinator multiplexes over.
    pub fn controller(&self) -> &Arc<RecursionController> {
        &self.controller
    }

    /// Stop accepting tasks and wait for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.queue_tx);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!("Worker terminated abnormally: {err}");
            }
        }
        info!("Coordinator shut down");
    }
}

async fn worker_loop(
    worker: usize,
    controller: Arc<RecursionController>,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
) {
    loop {
        // Hold the receiver lock only for the dequeue so idle workers
        // take tasks in arrival order.
        let queued = { queue_rx.lock().await.recv().await };
        let Some(queued) = queued else {
            debug!(worker, "Queue closed, worker exiting");
            break;
        };
        process(worker, &controller, queued).await;
    }
}

async fn process(worker: usize, base: &Arc<RecursionController>, queued: QueuedTask) {
    let QueuedTask {
        task,
        cancel,
        permit,
        result_tx,
    } = queued;
    let started = Instant::now();

    let result = if cancel.is_cancelled() {
        TaskResult::failure(TaskError::Cancelled, 0)
    } else {
        let controller = controller_for(base, &task.options);
        let outcome = run_with_deadline(&controller, &task, &cancel).await;
        let wallclock_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) => result_from_outcome(outcome, wallclock_ms),
            Err(err) => {
                debug!(worker, "Task failed: {err}");
                TaskResult::failure(TaskError::from_error(&err), wallclock_ms)
            }
        }
    };

    let _ = result_tx.send(result);
    // The permit covered the whole tree; release it only after every
    // level has unwound.
    drop(permit);
}

fn controller_for(base: &Arc<RecursionController>, options: &TaskOptions) -> Arc<RecursionController> {
    if options.max_depth.is_none()
        && options.execute_timeout_ms.is_none()
        && options.root_model.is_none()
    {
        return Arc::clone(base);
    }

    let mut controller = (**base).clone();
    if let Some(max_depth) = options.max_depth {
        controller = controller.with_max_depth(max_depth);
    }
    if let Some(timeout_ms) = options.execute_timeout_ms {
        controller = controller.with_execute_timeout_ms(Some(timeout_ms));
    }
    if let Some(root_model) = &options.root_model {
        controller = controller.with_root_model(root_model.clone());
    }
    Arc::new(controller)
}

async fn run_with_deadline(
    controller: &Arc<RecursionController>,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<LevelOutcome> {
    let fut = controller.reason(&task.query, task.context_text.as_deref(), cancel);

    let Some(deadline_ms) = task.options.task_timeout_ms else {
        return fut.await;
    };

    tokio::pin!(fut);
    match tokio::time::timeout(Duration::from_millis(deadline_ms), &mut fut).await {
        Ok(outcome) => outcome,
        Err(_) => {
            // Signal and let the tree unwind cooperatively so every
            // child environment closes before the result resolves. An
            // in-flight sandbox execution still runs to its wall timeout.
            cancel.cancel();
            let _ = fut.await;
            Err(Error::TaskTimeout {
                duration_ms: deadline_ms,
            })
        }
    }
}

fn result_from_outcome(outcome: LevelOutcome, wallclock_ms: u64) -> TaskResult {
    let usage_total = UsageRecord::total_of(&outcome.per_call_usage);
    TaskResult {
        answer: outcome.answer,
        usage_total,
        per_level_usage: outcome.per_call_usage,
        wallclock_ms,
        recursion_id: Some(outcome.recursion_id),
        error: None,
    }
}
