//! Asynchronous evaluation of residuals.
//!
//! An [Evaluator] schedules [Task]s on one of three backends and hands back a [Handle]
//! immediately. Results are collected with [Evaluator::fetch], which is the only place the
//! submitting thread blocks. All backends satisfy the same contract, so methods never know
//! where their residuals are computed.
//!
//! - [inline::InlineBackend] runs the task on the submitting thread
//! - [pool::PoolBackend] runs it on a local pool of worker threads
//! - [futures::FuturesBackend] runs it as a detached future on a tokio runtime
//!
//! The backend is chosen once, by [probe], when the evaluator is created.

use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::{RefineError, Result};
use crate::refinable::Task;
use crate::routines::settings::EvaluatorSettings;

pub mod futures;
pub mod inline;
pub mod pool;
pub mod worker;

use worker::WorkerConfig;

/// A type-erased job as seen by a backend
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes jobs somewhere
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Schedule `job`; must not wait for it to finish
    fn spawn(&self, job: Job) -> Result<()>;
    /// Tear down and recreate the workers; queued jobs are abandoned
    fn restart(&self) -> Result<()>;
    fn shutdown(&self);
}

/// The available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pick the best available backend at start
    Auto,
    Inline,
    Pool,
    Futures,
}

/// Failure captured on a worker
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub worker: String,
    pub message: String,
    pub trace: String,
}

impl From<WorkerFailure> for RefineError {
    fn from(failure: WorkerFailure) -> Self {
        RefineError::Evaluation {
            worker: failure.worker,
            message: failure.message,
            trace: failure.trace,
        }
    }
}

type Outcome = std::result::Result<f64, WorkerFailure>;

/// Handle to a submitted task
#[derive(Debug)]
pub struct Handle {
    receiver: Receiver<Outcome>,
}

/// How long [Evaluator::fetch_default] waits, and how often
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchPolicy {
    /// Length of a single wait; `None` waits forever
    pub timeout: Option<Duration>,
    /// Number of timed waits before the fetch is declared stalled
    pub retries: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            timeout: Some(Duration::from_secs(2)),
            retries: 50,
        }
    }
}

impl From<&EvaluatorSettings> for FetchPolicy {
    fn from(settings: &EvaluatorSettings) -> Self {
        FetchPolicy {
            timeout: match settings.timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            retries: settings.retries.max(1),
        }
    }
}

/// Submits tasks to a backend and fetches their results
pub struct Evaluator {
    kind: BackendKind,
    backend: Box<dyn Backend>,
    policy: FetchPolicy,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Evaluator {
    /// Create an evaluator on the backend selected by [probe]
    pub fn new(settings: &EvaluatorSettings) -> Result<Self> {
        let config = worker_config(settings);
        let threads = thread_count(settings);
        let policy = FetchPolicy::from(settings);
        let (kind, backend) = probe(
            settings.backend,
            settings.prefer_futures,
            threads,
            policy.timeout.is_some(),
            &config,
        )?;
        tracing::info!("Evaluating residuals on the {} backend", backend.name());
        Ok(Evaluator {
            kind,
            backend,
            policy,
        })
    }

    /// An evaluator that runs every task on the calling thread
    pub fn inline() -> Self {
        Evaluator {
            kind: BackendKind::Inline,
            backend: Box::new(inline::InlineBackend),
            policy: FetchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The backend in use; never [BackendKind::Auto]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    /// Schedule `task` and return a handle to its result
    pub fn submit(&self, task: Task) -> Result<Handle> {
        let (sender, receiver) = mpsc::channel();
        self.backend.spawn(Box::new(move || {
            // The receiver is gone if the fetch gave up on this task
            let _ = sender.send(run_task(task));
        }))?;
        Ok(Handle { receiver })
    }

    /// Wait for the result behind `handle`
    ///
    /// With a `timeout`, waits at most `retries` times that long before failing with
    /// [RefineError::Stalled]. Without one, blocks until the result arrives.
    pub fn fetch(&self, handle: Handle, timeout: Option<Duration>) -> Result<f64> {
        let outcome = match timeout {
            None => handle.receiver.recv().map_err(|_| abandoned())?,
            Some(timeout) => {
                let mut attempts = 0;
                loop {
                    match handle.receiver.recv_timeout(timeout) {
                        Ok(outcome) => break outcome,
                        Err(RecvTimeoutError::Timeout) => {
                            attempts += 1;
                            if attempts >= self.policy.retries {
                                tracing::error!(
                                    "No result after {} attempts of {:?}",
                                    attempts,
                                    timeout
                                );
                                return Err(RefineError::Stalled { attempts, timeout });
                            }
                            tracing::debug!("Still waiting for a result (attempt {})", attempts);
                        }
                        Err(RecvTimeoutError::Disconnected) => return Err(abandoned()),
                    }
                }
            }
        };
        outcome.map_err(RefineError::from)
    }

    /// [Evaluator::fetch] with the timeout of the configured [FetchPolicy]
    pub fn fetch_default(&self, handle: Handle) -> Result<f64> {
        self.fetch(handle, self.policy.timeout)
    }

    /// Submit every task, then fetch every result, in order
    ///
    /// Returns only once the whole batch is in.
    pub fn evaluate_all(&self, tasks: Vec<Task>) -> Result<Vec<f64>> {
        let handles = tasks
            .into_iter()
            .map(|task| self.submit(task))
            .collect::<Result<Vec<Handle>>>()?;
        handles
            .into_iter()
            .map(|handle| self.fetch_default(handle))
            .collect()
    }

    /// [Evaluator::evaluate_all], restarting the backend when a fetch stalls
    ///
    /// The stall is still returned; the restart only makes the evaluator usable again.
    pub fn evaluate_or_restart(&self, tasks: Vec<Task>) -> Result<Vec<f64>> {
        match self.evaluate_all(tasks) {
            Err(err @ RefineError::Stalled { .. }) => {
                tracing::warn!("Evaluation stalled, restarting the evaluator");
                if let Err(restart) = self.restart() {
                    tracing::error!("Failed to restart the evaluator: {}", restart);
                }
                Err(err)
            }
            other => other,
        }
    }

    pub fn restart(&self) -> Result<()> {
        self.backend.restart()
    }

    pub fn shutdown(&self) {
        self.backend.shutdown()
    }
}

fn abandoned() -> RefineError {
    RefineError::PoolUnavailable("task was abandoned before it completed".into())
}

fn run_task(task: Task) -> Outcome {
    let worker = std::thread::current()
        .name()
        .unwrap_or("unnamed worker")
        .to_string();
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(residual)) => Ok(residual),
        Ok(Err(report)) => Err(WorkerFailure {
            worker,
            message: report.to_string(),
            trace: format!("{:?}", report),
        }),
        Err(payload) => {
            let message = if let Some(message) = payload.downcast_ref::<&str>() {
                message.to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                String::from("unknown panic payload")
            };
            Err(WorkerFailure {
                worker,
                message: format!("panicked: {}", message),
                trace: Backtrace::force_capture().to_string(),
            })
        }
    }
}

fn worker_config(settings: &EvaluatorSettings) -> WorkerConfig {
    WorkerConfig {
        tolerance: settings.tolerance,
        log_level: tracing::level_filters::LevelFilter::current().to_string(),
    }
}

fn thread_count(settings: &EvaluatorSettings) -> usize {
    match settings.threads {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    }
}

/// Select and start a backend
///
/// Inside a worker the answer is always inline. Otherwise an explicit choice is honoured, and
/// `Auto` tries the futures runtime (when preferred), then a thread pool (when more than one
/// thread is available, or when fetches are `timed`), then falls back to inline execution.
///
/// Inline execution runs a task inside [Evaluator::submit], so a fetch timeout can never fire
/// on it; a task that does not return blocks the caller.
pub fn probe(
    requested: BackendKind,
    prefer_futures: bool,
    threads: usize,
    timed: bool,
    config: &WorkerConfig,
) -> Result<(BackendKind, Box<dyn Backend>)> {
    if worker::in_worker() {
        return Ok((BackendKind::Inline, Box::new(inline::InlineBackend)));
    }
    match requested {
        BackendKind::Inline => Ok((BackendKind::Inline, Box::new(inline::InlineBackend))),
        BackendKind::Pool => Ok((
            BackendKind::Pool,
            Box::new(pool::PoolBackend::new(threads, config.clone())?),
        )),
        BackendKind::Futures => Ok((
            BackendKind::Futures,
            Box::new(futures::FuturesBackend::new(threads, config.clone())?),
        )),
        BackendKind::Auto => {
            if prefer_futures {
                match futures::FuturesBackend::new(threads, config.clone()) {
                    Ok(backend) => return Ok((BackendKind::Futures, Box::new(backend))),
                    Err(err) => tracing::warn!("Futures runtime unavailable: {}", err),
                }
            }
            if threads > 1 || timed {
                match pool::PoolBackend::new(threads, config.clone()) {
                    Ok(backend) => return Ok((BackendKind::Pool, Box::new(backend))),
                    Err(err) => tracing::warn!("Worker pool unavailable: {}", err),
                }
            }
            Ok((BackendKind::Inline, Box::new(inline::InlineBackend)))
        }
    }
}

lazy_static! {
    static ref GLOBAL: Mutex<Option<Arc<Evaluator>>> = Mutex::new(None);
}

/// The process-wide evaluator, created on first use
pub fn global(settings: &EvaluatorSettings) -> Result<Arc<Evaluator>> {
    let mut guard = GLOBAL
        .lock()
        .map_err(|_| RefineError::PoolUnavailable("global evaluator lock poisoned".into()))?;
    if let Some(evaluator) = guard.as_ref() {
        return Ok(evaluator.clone());
    }
    let evaluator = Arc::new(Evaluator::new(settings)?);
    *guard = Some(evaluator.clone());
    Ok(evaluator)
}

/// Restart the workers of the process-wide evaluator, if it exists
pub fn restart_global() -> Result<()> {
    let guard = GLOBAL
        .lock()
        .map_err(|_| RefineError::PoolUnavailable("global evaluator lock poisoned".into()))?;
    match guard.as_ref() {
        Some(evaluator) => evaluator.restart(),
        None => Ok(()),
    }
}

/// Shut down and forget the process-wide evaluator
pub fn shutdown_global() {
    if let Ok(mut guard) = GLOBAL.lock() {
        if let Some(evaluator) = guard.take() {
            evaluator.shutdown();
        }
    }
}

/// Shuts the process-wide evaluator down when dropped
///
/// Keep one alive in `main` (or the host's equivalent) for the lifetime of the process.
#[derive(Debug)]
#[must_use = "the evaluator is shut down as soon as the guard is dropped"]
pub struct EvaluatorGuard {
    _private: (),
}

impl EvaluatorGuard {
    /// Create the process-wide evaluator and a guard that tears it down
    pub fn init(settings: &EvaluatorSettings) -> Result<(Arc<Evaluator>, EvaluatorGuard)> {
        let evaluator = global(settings)?;
        Ok((evaluator, EvaluatorGuard { _private: () }))
    }
}

impl Drop for EvaluatorGuard {
    fn drop(&mut self) {
        shutdown_global();
    }
}
