use std::sync::{Arc, RwLock};

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::worker::{self, WorkerConfig};
use super::{Backend, Job};
use crate::error::{RefineError, Result};

/// A local pool of worker threads
pub struct PoolBackend {
    threads: usize,
    config: WorkerConfig,
    pool: RwLock<Option<Arc<ThreadPool>>>,
}

impl PoolBackend {
    pub fn new(threads: usize, config: WorkerConfig) -> Result<Self> {
        let pool = build_pool(threads, &config)?;
        tracing::debug!("Started worker pool with {} threads", pool.current_num_threads());
        Ok(PoolBackend {
            threads,
            config,
            pool: RwLock::new(Some(Arc::new(pool))),
        })
    }

    fn current(&self) -> Result<Arc<ThreadPool>> {
        let guard = self
            .pool
            .read()
            .map_err(|_| RefineError::PoolUnavailable("pool lock poisoned".into()))?;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| RefineError::PoolUnavailable("pool was shut down".into()))
    }
}

fn build_pool(threads: usize, config: &WorkerConfig) -> Result<ThreadPool> {
    let config = config.clone();
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("refine-worker-{}", i))
        .start_handler(move |_| worker::initialize(&config))
        .build()
        .map_err(|e| RefineError::PoolUnavailable(e.to_string()))
}

impl Backend for PoolBackend {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn spawn(&self, job: Job) -> Result<()> {
        self.current()?.spawn(job);
        Ok(())
    }

    /// Replace the pool with a fresh one
    ///
    /// Jobs still queued on the old pool run to completion on its threads, but nobody waits for
    /// them; a wedged thread is left behind.
    fn restart(&self) -> Result<()> {
        let fresh = Arc::new(build_pool(self.threads, &self.config)?);
        let mut guard = self
            .pool
            .write()
            .map_err(|_| RefineError::PoolUnavailable("pool lock poisoned".into()))?;
        *guard = Some(fresh);
        tracing::warn!("Worker pool restarted");
        Ok(())
    }

    fn shutdown(&self) {
        if let Ok(mut guard) = self.pool.write() {
            if guard.take().is_some() {
                tracing::debug!("Worker pool shut down");
            }
        }
    }
}
