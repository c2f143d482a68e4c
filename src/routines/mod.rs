// The state shared by a method and the driver
pub mod context;
// Trend and spread statistics for stopping rules
pub mod convergence;
// Residual evaluation on workers
pub mod evaluator;
// Routines for initialization
pub mod initialization;
// Routines for logging
pub mod logger;
// Routines for output
pub mod output;
// Sampling of the parameter space
pub mod parameter_space;
// Routines for settings
pub mod settings;
// Ask/tell strategies used by the population methods
pub mod strategy;
