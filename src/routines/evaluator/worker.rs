//! Worker-local configuration.
//!
//! Worker threads do not see configuration the submitting thread changed after the pool was
//! built, so every backend runs [initialize] as a start hook on each of its threads.
//!
//! The worker's log level is applied as a thread default wrapping the subscriber the thread
//! started with: events above the level are dropped on that worker only.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::{DefaultGuard, Interest};
use tracing::{Dispatch, Event, Metadata, Subscriber};

/// Configuration every worker re-initializes on start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Numerical tolerance available to residual computations
    pub tolerance: f64,
    /// Log level the worker was started with
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            tolerance: 1e-12,
            log_level: String::from("info"),
        }
    }
}

impl WorkerConfig {
    /// The configured log level; unparsable values fall back to `info`
    pub fn level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::INFO)
    }
}

thread_local! {
    static WORKER: RefCell<Option<WorkerConfig>> = RefCell::new(None);
    static LOGGING: RefCell<Option<DefaultGuard>> = RefCell::new(None);
}

/// Forwards to the subscriber the worker started with, dropping what exceeds `level`
struct WorkerSubscriber {
    inner: Dispatch,
    level: LevelFilter,
}

impl Subscriber for WorkerSubscriber {
    fn register_callsite(&self, _: &'static Metadata<'static>) -> Interest {
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.level >= *metadata.level() && self.inner.enabled(metadata)
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(self.level)
    }

    fn new_span(&self, span: &Attributes<'_>) -> Id {
        self.inner.new_span(span)
    }

    fn record(&self, span: &Id, values: &Record<'_>) {
        self.inner.record(span, values)
    }

    fn record_follows_from(&self, span: &Id, follows: &Id) {
        self.inner.record_follows_from(span, follows)
    }

    fn event(&self, event: &Event<'_>) {
        self.inner.event(event)
    }

    fn enter(&self, span: &Id) {
        self.inner.enter(span)
    }

    fn exit(&self, span: &Id) {
        self.inner.exit(span)
    }

    fn clone_span(&self, id: &Id) -> Id {
        self.inner.clone_span(id)
    }

    fn try_close(&self, id: Id) -> bool {
        self.inner.try_close(id)
    }
}

/// Mark the current thread as a worker and store its configuration
pub fn initialize(config: &WorkerConfig) {
    WORKER.with(|worker| *worker.borrow_mut() = Some(config.clone()));
    LOGGING.with(|logging| {
        // Restore the starting subscriber before wrapping it again
        logging.borrow_mut().take();
        let inner = tracing::dispatcher::get_default(|current| current.clone());
        let guard = tracing::subscriber::set_default(WorkerSubscriber {
            inner,
            level: config.level(),
        });
        *logging.borrow_mut() = Some(guard);
    });
    tracing::trace!(
        "Worker {:?} initialized with tolerance {:e}",
        std::thread::current().name(),
        config.tolerance
    );
}

/// Whether the current thread belongs to an evaluator backend
///
/// Work submitted from inside a worker must run inline: pools are never nested.
pub fn in_worker() -> bool {
    WORKER.with(|worker| worker.borrow().is_some())
}

/// The configuration of the current worker, if any
pub fn current() -> Option<WorkerConfig> {
    WORKER.with(|worker| worker.borrow().clone())
}

/// The numerical tolerance of the current worker, or the default outside workers
pub fn tolerance() -> f64 {
    current().unwrap_or_default().tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_thread_local() {
        let config = WorkerConfig {
            tolerance: 1e-6,
            log_level: "debug".into(),
        };
        let handle = std::thread::spawn(move || {
            assert!(!in_worker());
            initialize(&config);
            assert!(in_worker());
            tolerance()
        });
        assert_eq!(handle.join().unwrap(), 1e-6);
        assert!(!in_worker());
        assert_eq!(tolerance(), 1e-12);
    }

    #[test]
    fn test_worker_applies_its_log_level() {
        let config = WorkerConfig {
            tolerance: 1e-12,
            log_level: "warn".into(),
        };
        let handle = std::thread::spawn(move || {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(LevelFilter::TRACE)
                .with_test_writer()
                .finish();
            let _outer = tracing::subscriber::set_default(subscriber);
            let before = tracing::enabled!(tracing::Level::DEBUG);
            initialize(&config);
            let debug = tracing::enabled!(tracing::Level::DEBUG);
            let warn = tracing::enabled!(tracing::Level::WARN);
            // Initializing twice keeps a single wrapper
            initialize(&config);
            let again = tracing::enabled!(tracing::Level::DEBUG);
            LOGGING.with(|logging| logging.borrow_mut().take());
            (before, debug, warn, again)
        });
        assert_eq!(handle.join().unwrap(), (true, false, true, false));
    }

    #[test]
    fn test_unparsable_level_falls_back_to_info() {
        let config = WorkerConfig {
            log_level: "chatty".into(),
            ..WorkerConfig::default()
        };
        assert_eq!(config.level(), LevelFilter::INFO);
        assert_eq!(WorkerConfig::default().level(), LevelFilter::INFO);
    }
}
