use std::sync::Arc;

use ndarray::Array2;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::refinable::TaskSource;
use crate::routines::evaluator::Evaluator;
use crate::routines::parameter_space::ParameterSpace;
use crate::structs::bounds::{Bounds, Solution};
use crate::structs::cancel::Cancellable;
use crate::structs::history::{Record, RefinementHistory};

/// A progress report sent to the host after every update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// Iteration of the attached record, or the number of updates so far
    pub iteration: usize,
    /// Residual of the solution just recorded
    pub residual: f64,
    /// Best residual so far
    pub best_residual: f64,
    /// The current status line
    pub message: String,
}

/// Everything a method needs while it runs
///
/// The context owns the path from a candidate to a recorded result: candidates are clipped
/// into the bounds, evaluated on the [Evaluator], recorded into the optional [ParameterSpace]
/// and folded into the [RefinementHistory] through [RefineContext::update].
pub struct RefineContext<'a> {
    source: &'a dyn TaskSource,
    bounds: Bounds,
    history: &'a mut RefinementHistory,
    evaluator: Arc<Evaluator>,
    cancel: Cancellable,
    progress: Option<UnboundedSender<Progress>>,
    space: Option<ParameterSpace>,
    evaluations: usize,
    seed: u64,
}

impl<'a> RefineContext<'a> {
    pub fn new(
        source: &'a dyn TaskSource,
        bounds: Bounds,
        history: &'a mut RefinementHistory,
        evaluator: Arc<Evaluator>,
    ) -> Self {
        RefineContext {
            source,
            bounds,
            history,
            evaluator,
            cancel: Cancellable::new(),
            progress: None,
            space: None,
            evaluations: 0,
            seed: 22,
        }
    }

    pub fn with_cancel(mut self, cancel: Cancellable) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_sampler(mut self, space: ParameterSpace) -> Self {
        self.space = Some(space);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn history(&self) -> &RefinementHistory {
        self.history
    }

    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }

    /// Seed for the random number generators of stochastic methods
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of residuals computed so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn space(&self) -> Option<&ParameterSpace> {
        self.space.as_ref()
    }

    pub fn take_space(&mut self) -> Option<ParameterSpace> {
        self.space.take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The solution a method starts from
    ///
    /// The last recorded solution if any, then the initial one, and the center of the domain
    /// when the history is empty. Always within the bounds.
    pub fn start_solution(&self) -> Solution {
        self.history
            .last_solution()
            .or(self.history.initial_solution())
            .filter(|solution| solution.len() == self.bounds.len())
            .map(|solution| self.bounds.clip(solution))
            .unwrap_or_else(|| self.bounds.center())
    }

    /// The solution a method starts from, with its residual
    ///
    /// Uses the last recorded residual when there is one, and evaluates and records the start
    /// solution otherwise.
    pub fn start_state(&mut self) -> Result<(Solution, f64)> {
        let solution = self.start_solution();
        if let Some(residual) = self.history.last_residual() {
            return Ok((solution, residual));
        }
        let residual = self.evaluate_one(&solution)?;
        self.update(&solution, residual, None);
        Ok((solution, residual))
    }

    /// Compute the residual of every solution
    ///
    /// Solutions are clipped into the bounds before they are submitted. The call returns only
    /// once every result is in, in the order of `solutions`. A stalled fetch restarts the
    /// evaluator and aborts the batch.
    pub fn evaluate_batch(&mut self, solutions: &[Solution]) -> Result<Vec<f64>> {
        let mut clipped = Vec::with_capacity(solutions.len());
        for solution in solutions {
            self.bounds.check_dimension(solution)?;
            clipped.push(self.bounds.clip(solution));
        }
        let tasks = clipped.iter().map(|s| self.source.task(s)).collect();

        let residuals = self.evaluator.evaluate_or_restart(tasks)?;

        self.evaluations += residuals.len();
        if let Some(space) = self.space.as_mut() {
            for (solution, residual) in clipped.iter().zip(residuals.iter()) {
                space.record(solution, *residual);
            }
        }
        Ok(residuals)
    }

    /// Clip every row of `population` into the bounds, in place, and compute its residual
    pub fn evaluate_rows(&mut self, population: &mut Array2<f64>) -> Result<Vec<f64>> {
        let mut solutions = Vec::with_capacity(population.nrows());
        for mut row in population.rows_mut() {
            let mut solution = row.to_owned();
            self.bounds.clip_inplace(&mut solution);
            row.assign(&solution);
            solutions.push(solution);
        }
        self.evaluate_batch(&solutions)
    }

    pub fn evaluate_one(&mut self, solution: &Solution) -> Result<f64> {
        let residuals = self.evaluate_batch(std::slice::from_ref(solution))?;
        Ok(residuals[0])
    }

    /// Fold a result into the history and report progress
    pub fn update(&mut self, solution: &Solution, residual: f64, record: Option<Record>) {
        let solution = self.bounds.clip(solution);
        let iteration = record
            .as_ref()
            .map_or(self.history.updates() + 1, |r| r.iteration());
        self.history.update(&solution, residual, record);
        self.report(iteration, residual);
    }

    /// Fold a whole batch into the history
    ///
    /// `record` is attached to the last entry of the batch.
    pub fn update_batch(
        &mut self,
        solutions: &[Solution],
        residuals: &[f64],
        mut record: Option<Record>,
    ) {
        let last = solutions.len().min(residuals.len());
        for (i, (solution, residual)) in solutions.iter().zip(residuals.iter()).enumerate() {
            let record = if i + 1 == last { record.take() } else { None };
            self.update(solution, *residual, record);
        }
    }

    /// Set the status line shown to the user
    pub fn set_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.history.set_message(message);
    }

    /// Make the initial state the last state again
    pub fn restore_initial(&mut self) {
        self.history.reset_last_to_initial();
    }

    fn report(&self, iteration: usize, residual: f64) {
        if let Some(progress) = &self.progress {
            let report = Progress {
                iteration,
                residual,
                best_residual: self.history.best_residual().unwrap_or(residual),
                message: self.history.message().to_string(),
            };
            // The host may have stopped listening
            let _ = progress.send(report);
        }
    }
}
