//! Population strategies driven one generation at a time.
pub mod cmaes;
pub mod swarm;
