//! diffrefine is a library with the refinement engine needed to fit mixture models to
//! diffraction patterns.
//!
//! A host describes its model through the [refinable::Refinable] trait, picks one of the
//! registered methods by index and runs it with [entrypoints::refine]. The method asks for
//! candidate solutions, the residuals are computed in parallel by the
//! [routines::evaluator::Evaluator], and the results are folded into a
//! [structs::history::RefinementHistory] until the method converges, stagnates, runs out of
//! budget or is cancelled.
//!
//! # Methods
//!
//! | Index | Method | Kind |
//! |-------|--------|------|
//! | 0 | L-BFGS-B | bounded quasi-Newton local search |
//! | 1 | Brute force | grid evaluation |
//! | 2 | Basin hopping | global, stochastic |
//! | 3 | CMA-ES | evolution strategy |
//! | 4 | MPSO | multi-swarm particle swarm |
//! | 5 | PSO-CMA-ES | cooperating evolution strategies |
//!
//! Method options are declared by every method and can be overridden per index in the
//! settings, see [routines::settings::Settings].

/// Provides the various refinement methods
pub mod algorithms;
/// Entry points for running refinements
pub mod entrypoints;
/// Error types of the refinement engine
pub mod error;
/// The contract between the engine and the model being refined
pub mod refinable;
/// Routines shared by the methods: evaluation, settings, logging, output and sampling
pub mod routines;
/// Core data structures
pub mod structs;

pub use crate::entrypoints::{refine, refine_internal, Handles};

/// A collection of commonly used items
pub mod prelude {
    pub use crate::algorithms;
    pub use crate::algorithms::{dispatch_method, registry, Outcome, RefineMethod, Status};
    pub use crate::entrypoints::{refine, refine_internal, Handles};
    pub use crate::error::{RefineError, Result};
    pub use crate::refinable::{FnRefinable, Refinable, Task, TaskSource};
    pub use crate::routines::context::{Progress, RefineContext};
    pub use crate::routines::evaluator::{self, BackendKind, Evaluator, EvaluatorGuard};
    pub use crate::routines::output::RefineResult;
    pub use crate::routines::parameter_space::ParameterSpace;
    pub use crate::routines::settings::{self, Settings};
    pub use crate::structs::bounds::{Bounds, Solution};
    pub use crate::structs::cancel::Cancellable;
    pub use crate::structs::history::{Record, RefineStatus, RefinementHistory};
    pub use crate::structs::options::{MethodOptions, OptionKind, OptionValue, RefineMethodOption};
}
