//! The boundary between the refinement engine and the model being refined.
//!
//! The engine never touches the live model while a method runs. For every candidate it asks the
//! model for a self-contained snapshot ([Refinable::data_object]), ships that snapshot to a
//! worker and computes the residual there with [Refinable::residual], which has no access to the
//! live model. Only when the host asks for it is a solution written back with
//! [Refinable::apply_solution].

use crate::structs::bounds::Solution;

/// A unit of work submitted to the evaluator
pub type Task = Box<dyn FnOnce() -> eyre::Result<f64> + Send + 'static>;

/// A model whose free parameters can be refined against an observed pattern
pub trait Refinable {
    /// Everything a worker needs to compute the residual of one solution
    type Data: Send + 'static;

    /// The `(min, max)` range of every refinable parameter, in order
    fn bounds(&self) -> Vec<(f64, f64)>;

    /// The solution currently applied to the model
    fn initial_solution(&self) -> Solution;

    /// Build the snapshot needed to evaluate `solution`, without mutating the model
    fn data_object(&self, solution: &Solution) -> Self::Data;

    /// Compute the residual of a snapshot
    fn residual(data: Self::Data) -> eyre::Result<f64>;

    /// Write `solution` back onto the live model
    fn apply_solution(&mut self, solution: &Solution);

    /// Names of the refinable parameters, used as column headers in output files
    fn parameter_names(&self) -> Vec<String> {
        (0..self.bounds().len()).map(|i| format!("p{}", i)).collect()
    }
}

/// Object-safe view of a [Refinable], used by the refinement context
pub trait TaskSource {
    fn task(&self, solution: &Solution) -> Task;
}

impl<R: Refinable> TaskSource for R {
    fn task(&self, solution: &Solution) -> Task {
        into_task(self.data_object(solution), R::residual)
    }
}

fn into_task<D: Send + 'static>(data: D, residual: fn(D) -> eyre::Result<f64>) -> Task {
    Box::new(move || residual(data))
}

/// A [Refinable] built from a plain residual closure
///
/// Useful for tests, benchmarks and hosts whose residual does not depend on a larger model.
/// The closure is cloned into every snapshot, so it should be cheap to clone.
#[derive(Debug, Clone)]
pub struct FnRefinable<F> {
    bounds: Vec<(f64, f64)>,
    solution: Solution,
    residual: F,
}

impl<F> FnRefinable<F>
where
    F: Fn(&Solution) -> f64 + Clone + Send + 'static,
{
    pub fn new(bounds: Vec<(f64, f64)>, solution: Solution, residual: F) -> Self {
        FnRefinable {
            bounds,
            solution,
            residual,
        }
    }

    /// The solution currently applied
    pub fn solution(&self) -> &Solution {
        &self.solution
    }
}

impl<F> Refinable for FnRefinable<F>
where
    F: Fn(&Solution) -> f64 + Clone + Send + 'static,
{
    type Data = (F, Solution);

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.bounds.clone()
    }

    fn initial_solution(&self) -> Solution {
        self.solution.clone()
    }

    fn data_object(&self, solution: &Solution) -> Self::Data {
        (self.residual.clone(), solution.clone())
    }

    fn residual((residual, solution): Self::Data) -> eyre::Result<f64> {
        Ok(residual(&solution))
    }

    fn apply_solution(&mut self, solution: &Solution) {
        self.solution = solution.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_task_uses_snapshot() {
        let model = FnRefinable::new(vec![(0.0, 1.0)], array![0.5], |x: &Solution| {
            x[0] * 2.0
        });
        let task = model.task(&array![0.25]);
        assert_eq!(task().unwrap(), 0.5);
        // Building a task never touches the applied solution
        assert_eq!(model.solution(), &array![0.5]);
    }

    #[test]
    fn test_default_parameter_names() {
        let model = FnRefinable::new(vec![(0.0, 1.0), (0.0, 1.0)], array![0.5, 0.5], |_: &Solution| 0.0);
        assert_eq!(model.parameter_names(), vec!["p0", "p1"]);
    }
}
