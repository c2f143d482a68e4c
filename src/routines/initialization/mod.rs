//! Starting populations drawn within the bounds.

pub mod sobol;
