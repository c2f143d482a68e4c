use std::sync::Mutex;

use tokio::runtime::{Builder, Runtime};

use super::worker::{self, WorkerConfig};
use super::{Backend, Job};
use crate::error::{RefineError, Result};

/// Dispatches jobs to the blocking pool of a tokio runtime
///
/// Each job becomes a detached future; its result travels back through the handle created by
/// the evaluator, so the submitting thread never enters the runtime.
pub struct FuturesBackend {
    threads: usize,
    config: WorkerConfig,
    runtime: Mutex<Option<Runtime>>,
}

impl FuturesBackend {
    pub fn new(threads: usize, config: WorkerConfig) -> Result<Self> {
        let runtime = build_runtime(threads, &config)?;
        tracing::debug!("Started futures runtime with up to {} workers", threads);
        Ok(FuturesBackend {
            threads,
            config,
            runtime: Mutex::new(Some(runtime)),
        })
    }
}

fn build_runtime(threads: usize, config: &WorkerConfig) -> Result<Runtime> {
    let config = config.clone();
    Builder::new_current_thread()
        .max_blocking_threads(threads.max(1))
        .thread_name("refine-future")
        .on_thread_start(move || worker::initialize(&config))
        .build()
        .map_err(|e| RefineError::PoolUnavailable(e.to_string()))
}

impl Backend for FuturesBackend {
    fn name(&self) -> &'static str {
        "futures"
    }

    fn spawn(&self, job: Job) -> Result<()> {
        let guard = self
            .runtime
            .lock()
            .map_err(|_| RefineError::PoolUnavailable("runtime lock poisoned".into()))?;
        match guard.as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(job);
                Ok(())
            }
            None => Err(RefineError::PoolUnavailable(
                "futures runtime was shut down".into(),
            )),
        }
    }

    fn restart(&self) -> Result<()> {
        let fresh = build_runtime(self.threads, &self.config)?;
        let mut guard = self
            .runtime
            .lock()
            .map_err(|_| RefineError::PoolUnavailable("runtime lock poisoned".into()))?;
        if let Some(old) = guard.replace(fresh) {
            old.shutdown_background();
        }
        tracing::warn!("Futures runtime restarted");
        Ok(())
    }

    fn shutdown(&self) {
        if let Ok(mut guard) = self.runtime.lock() {
            if let Some(old) = guard.take() {
                old.shutdown_background();
                tracing::debug!("Futures runtime shut down");
            }
        }
    }
}
