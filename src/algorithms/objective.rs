//! Adapter between the refinement context and the argmin solvers.
//!
//! argmin drives its solvers through `&self` cost and gradient calls, so the context sits
//! behind a [RefCell]. Failures and cancellation cannot travel through argmin's error type
//! without losing their meaning; they are parked in the [Probe] and the solver is stopped with
//! a plain error, which the calling method then translates back.

use std::cell::{Cell, RefCell};

use argmin::core::{CostFunction, Error, Gradient};
use ndarray::Array1;

use crate::error::RefineError;
use crate::routines::context::RefineContext;
use crate::structs::bounds::Solution;
use crate::structs::history::Record;

/// Shared state of one argmin run
pub(crate) struct Probe<'c, 'a> {
    context: RefCell<&'c mut RefineContext<'a>>,
    failure: RefCell<Option<RefineError>>,
    cancelled: Cell<bool>,
    calls: Cell<usize>,
    best: RefCell<Option<(Solution, f64)>>,
    last: RefCell<Option<(Solution, f64)>>,
    epsilon: f64,
    record: bool,
}

impl<'c, 'a> Probe<'c, 'a> {
    /// `epsilon` is the finite-difference step as a fraction of each range
    pub fn new(context: &'c mut RefineContext<'a>, epsilon: f64) -> Self {
        Probe {
            context: RefCell::new(context),
            failure: RefCell::new(None),
            cancelled: Cell::new(false),
            calls: Cell::new(0),
            best: RefCell::new(None),
            last: RefCell::new(None),
            epsilon,
            record: true,
        }
    }

    /// Whether every cost evaluation is folded into the history
    pub fn recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn objective(&self) -> Objective<'_, 'c, 'a> {
        Objective { probe: self }
    }

    /// Take the error that stopped the solver, if any
    pub fn take_failure(&self) -> Option<RefineError> {
        self.failure.borrow_mut().take()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Number of cost evaluations
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Best clipped point evaluated during the run
    pub fn best(&self) -> Option<(Solution, f64)> {
        self.best.borrow().clone()
    }

    /// Forget the best point, to start a new local run
    pub fn reset_best(&self) {
        self.best.replace(None);
    }

    /// Run `f` with the context
    pub fn with_context<T>(&self, f: impl FnOnce(&mut RefineContext<'a>) -> T) -> T {
        let mut context = self.context.borrow_mut();
        f(&mut **context)
    }

    fn stop(&self, err: RefineError) -> Error {
        let message = err.to_string();
        self.failure.replace(Some(err));
        Error::msg(message)
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if self.context.borrow().is_cancelled() {
            self.cancelled.set(true);
            return Err(Error::msg("refinement cancelled"));
        }
        Ok(())
    }

    /// Quadratic penalty on the normalized distance between `x` and its clipped image
    fn penalty(&self, x: &Array1<f64>, clipped: &Solution, residual: f64) -> (f64, Array1<f64>) {
        let ranges = self.context.borrow().bounds().ranges();
        let scale = 1.0 + residual.abs();
        let outside = (x - clipped) / &ranges;
        let value = scale * outside.mapv(|d| d * d).sum();
        let gradient = &outside / &ranges * (2.0 * scale);
        (value, gradient)
    }

    fn remember(&self, solution: &Solution, residual: f64) {
        let improved = match &*self.best.borrow() {
            Some((_, best)) => residual < *best,
            None => true,
        };
        if improved {
            self.best.replace(Some((solution.clone(), residual)));
        }
        self.last.replace(Some((solution.clone(), residual)));
    }

    fn residual_at(&self, x: &Array1<f64>) -> Result<(Solution, f64), Error> {
        self.check_cancel()?;
        let clipped = self.context.borrow().bounds().clip(x);
        if let Some((point, residual)) = &*self.last.borrow() {
            if *point == clipped {
                return Ok((clipped, *residual));
            }
        }
        let residual = self
            .context
            .borrow_mut()
            .evaluate_one(&clipped)
            .map_err(|err| self.stop(err))?;
        let call = self.calls.get();
        self.calls.set(call + 1);
        if self.record {
            self.context.borrow_mut().update(
                &clipped,
                residual,
                Some(Record::new(call).with("residual", residual)),
            );
        }
        self.remember(&clipped, residual);
        Ok((clipped, residual))
    }

    fn cost(&self, x: &Array1<f64>) -> Result<f64, Error> {
        let (clipped, residual) = self.residual_at(x)?;
        let (penalty, _) = self.penalty(x, &clipped, residual);
        Ok(residual + penalty)
    }

    /// Finite-difference gradient at the clipped point
    ///
    /// The probes of all parameters are evaluated as one batch. A probe that would leave the
    /// bounds steps backwards instead.
    fn gradient(&self, x: &Array1<f64>) -> Result<Array1<f64>, Error> {
        let (clipped, residual) = self.residual_at(x)?;
        let (lower, upper, ranges) = {
            let context = self.context.borrow();
            let bounds = context.bounds();
            (bounds.lower(), bounds.upper(), bounds.ranges())
        };

        let mut steps = Array1::<f64>::zeros(clipped.len());
        let probes: Vec<Solution> = (0..clipped.len())
            .map(|i| {
                let h = self.epsilon * ranges[i];
                steps[i] = if clipped[i] + h <= upper[i] || clipped[i] - h < lower[i] {
                    h
                } else {
                    -h
                };
                let mut probe = clipped.clone();
                probe[i] += steps[i];
                probe
            })
            .collect();

        let residuals = self
            .context
            .borrow_mut()
            .evaluate_batch(&probes)
            .map_err(|err| self.stop(err))?;
        for (probe, r) in probes.iter().zip(residuals.iter()) {
            self.remember(probe, *r);
        }
        // The base point stays the last evaluated point for the cache
        self.last.replace(Some((clipped.clone(), residual)));

        let mut gradient = Array1::from_iter(
            residuals
                .iter()
                .zip(steps.iter())
                .map(|(r, h)| (r - residual) / h),
        );
        let (_, penalty) = self.penalty(x, &clipped, residual);
        gradient += &penalty;
        Ok(gradient)
    }
}

/// The argmin problem backed by a [Probe]
pub(crate) struct Objective<'p, 'c, 'a> {
    probe: &'p Probe<'c, 'a>,
}

impl CostFunction for Objective<'_, '_, '_> {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        self.probe.cost(param)
    }
}

impl Gradient for Objective<'_, '_, '_> {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        self.probe.gradient(param)
    }
}

/// How an argmin run ended
pub(crate) enum RunEnd<T> {
    Done(T),
    Cancelled,
    /// The solver gave up after making progress
    Halted(String),
}

/// Translate the result of an argmin run
///
/// Errors parked in the probe are returned as they are. A solver error before any evaluation
/// means the solver rejected its input and becomes [RefineError::Numerical]; later ones end the
/// run early, keeping what was found.
pub(crate) fn settle<T>(
    probe: &Probe<'_, '_>,
    method: &'static str,
    result: Result<T, Error>,
) -> Result<RunEnd<T>, RefineError> {
    match result {
        Ok(value) => Ok(RunEnd::Done(value)),
        Err(err) => {
            if let Some(failure) = probe.take_failure() {
                return Err(failure);
            }
            if probe.cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            if probe.calls() == 0 {
                return Err(numerical(method)(err));
            }
            tracing::warn!("{} stopped early: {}", method, err);
            Ok(RunEnd::Halted(err.to_string()))
        }
    }
}

/// Wrap a solver setup error
pub(crate) fn numerical(method: &'static str) -> impl Fn(Error) -> RefineError {
    move |err| RefineError::Numerical {
        method,
        message: err.to_string(),
    }
}

/// Vertices of a starting simplex around `start`
///
/// Every vertex moves one parameter by `step` times its range, backwards when that would
/// leave the bounds.
pub(crate) fn initial_simplex(start: &Solution, lower: &Array1<f64>, upper: &Array1<f64>, step: f64) -> Vec<Array1<f64>> {
    let mut vertices = Vec::with_capacity(start.len() + 1);
    vertices.push(start.to_owned());
    for i in 0..start.len() {
        let h = step * (upper[i] - lower[i]);
        let mut vertex = start.to_owned();
        vertex[i] = if start[i] + h <= upper[i] {
            start[i] + h
        } else {
            start[i] - h
        };
        vertices.push(vertex);
    }
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinable::{FnRefinable, Refinable};
    use crate::routines::evaluator::Evaluator;
    use crate::structs::bounds::Bounds;
    use crate::structs::history::RefinementHistory;
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn test_simplex_stays_inside() {
        let simplex = initial_simplex(&array![0.0, 1.0], &array![0.0, 0.0], &array![1.0, 1.0], 0.1);
        assert_eq!(simplex.len(), 3);
        assert_eq!(simplex[1], array![0.1, 1.0]);
        assert_eq!(simplex[2], array![0.0, 0.9]);
    }

    #[test]
    fn test_gradient_is_one_sided_at_bounds() {
        let model = FnRefinable::new(vec![(0.0, 1.0), (0.0, 1.0)], array![0.5, 0.5], |x: &Solution| {
            3.0 * x[0] + x[1] * x[1]
        });
        let bounds = Bounds::new(model.bounds()).unwrap();
        let mut history = RefinementHistory::new();
        let mut context =
            RefineContext::new(&model, bounds, &mut history, Arc::new(Evaluator::inline()));
        let probe = Probe::new(&mut context, 1e-6);
        let objective = probe.objective();

        let gradient = objective.gradient(&array![1.0, 0.5]).unwrap();
        assert_relative_eq!(gradient[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(gradient[1], 1.0, epsilon = 1e-4);

        // Outside the bounds the penalty pushes back in
        let outside = objective.gradient(&array![1.5, 0.5]).unwrap();
        assert!(outside[0] > gradient[0]);
        assert!(objective.cost(&array![1.5, 0.5]).unwrap() > objective.cost(&array![1.0, 0.5]).unwrap());
        assert_eq!(probe.calls(), 1);
        // The backward probe of the first parameter is the lowest point seen
        assert!(probe.best().unwrap().1 < 3.25);
    }
}
