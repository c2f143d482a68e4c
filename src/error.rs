//! Error types for the refinement engine.
//!
//! Configuration errors are raised before any evaluation is submitted, evaluation errors carry
//! the text captured on the worker that failed, and a stalled fetch aborts the run.
//! Cancellation is not an error and has no variant here.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while setting up or running a refinement.
#[derive(Debug, Error)]
pub enum RefineError {
    /// No refinable parameters were supplied.
    #[error("no refinable parameters were supplied")]
    EmptyParameters,

    /// A bound is not finite or its lower value is not below its upper value.
    #[error("invalid bounds at index {index}: lower ({lower}) must be finite and below upper ({upper})")]
    InvalidBounds {
        /// Index of the offending bound pair
        index: usize,
        /// The lower bound value
        lower: f64,
        /// The upper bound value
        upper: f64,
    },

    /// A solution vector does not match the number of bounds.
    #[error("dimension mismatch: expected {expected} values, got {got}")]
    DimensionMismatch {
        /// Number of refinable parameters
        expected: usize,
        /// Length of the supplied vector
        got: usize,
    },

    /// No registered method carries the requested index.
    #[error("no refinement method registered under index {0}")]
    UnknownMethod(usize),

    /// Two enabled methods are registered under the same index.
    #[error("method index {index} is registered twice ({name})")]
    DuplicateIndex {
        /// The shared index
        index: usize,
        /// Name of the second entry carrying it
        name: &'static str,
    },

    /// An option value is of the wrong type or otherwise unusable.
    #[error("invalid value for option '{name}': {reason}")]
    InvalidOption {
        /// Name of the option
        name: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The numerical routine behind a method rejected its input.
    #[error("numerical routine failed in {method}: {message}")]
    Numerical {
        /// Name of the method that failed
        method: &'static str,
        /// Message reported by the routine
        message: String,
    },

    /// The residual computation failed on a worker.
    #[error("residual evaluation failed on {worker}: {message}\n{trace}")]
    Evaluation {
        /// Name of the worker thread
        worker: String,
        /// Short description of the failure
        message: String,
        /// Error chain or backtrace captured on the worker
        trace: String,
    },

    /// A result did not arrive within the retry budget.
    #[error("evaluation stalled: no result after {attempts} attempts of {timeout:?}")]
    Stalled {
        /// Number of timed waits performed
        attempts: usize,
        /// Length of each wait
        timeout: Duration,
    },

    /// The worker pool could not be created or was shut down.
    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// A specialized `Result` type for refinement operations.
pub type Result<T> = std::result::Result<T, RefineError>;

impl RefineError {
    /// Returns `true` for errors raised before any evaluation was submitted.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            RefineError::EmptyParameters
                | RefineError::InvalidBounds { .. }
                | RefineError::DimensionMismatch { .. }
                | RefineError::UnknownMethod(_)
                | RefineError::DuplicateIndex { .. }
                | RefineError::InvalidOption { .. }
                | RefineError::Numerical { .. }
        )
    }

    /// Returns `true` if the error was raised by a worker while computing a residual.
    pub fn is_evaluation_error(&self) -> bool {
        matches!(self, RefineError::Evaluation { .. })
    }

    /// Returns `true` if a fetch ran out of its retry budget.
    pub fn is_stall(&self) -> bool {
        matches!(self, RefineError::Stalled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RefineError::InvalidBounds {
            index: 2,
            lower: 5.0,
            upper: 3.0,
        };
        assert_eq!(
            err.to_string(),
            "invalid bounds at index 2: lower (5) must be finite and below upper (3)"
        );
    }

    #[test]
    fn test_error_categories() {
        assert!(RefineError::UnknownMethod(42).is_config_error());
        assert!(RefineError::EmptyParameters.is_config_error());
        assert!(RefineError::DuplicateIndex { index: 1, name: "b" }.is_config_error());

        let stall = RefineError::Stalled {
            attempts: 50,
            timeout: Duration::from_secs(2),
        };
        assert!(stall.is_stall());
        assert!(!stall.is_config_error());

        let eval = RefineError::Evaluation {
            worker: "refine-worker-0".into(),
            message: "boom".into(),
            trace: String::new(),
        };
        assert!(eval.is_evaluation_error());
        assert!(!eval.is_stall());
    }
}
