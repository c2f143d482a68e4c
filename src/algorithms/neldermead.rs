use argmin::core::{Executor, State};
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;

use crate::algorithms::objective::{initial_simplex, numerical, settle, Probe, RunEnd};
use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "Nelder-Mead";
pub const DESCRIPTION: &str = "Downhill simplex search from the current solution";

pub const OPTIONS: &[RefineMethodOption] = &[
    RefineMethodOption {
        name: "maxiter",
        label: "Maximum iterations",
        description: "Upper limit on the number of simplex updates",
        kind: OptionKind::Int {
            min: 1,
            max: 100_000,
            default: 500,
        },
    },
    RefineMethodOption {
        name: "step",
        label: "Initial size",
        description: "Edge of the starting simplex, as a fraction of each parameter range",
        kind: OptionKind::Float {
            min: 1e-6,
            max: 1.0,
            default: 0.05,
        },
    },
    RefineMethodOption {
        name: "sd_tol",
        label: "Tolerance",
        description: "Stop when the spread of the simplex residuals falls below this value",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1.0,
            default: 1e-10,
        },
    },
];

pub struct NelderMeadMethod {
    options: MethodOptions,
}

impl NelderMeadMethod {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(NelderMeadMethod { options })
    }
}

impl RefineMethod for NelderMeadMethod {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn options(&self) -> &MethodOptions {
        &self.options
    }

    fn run(&mut self, context: &mut RefineContext<'_>) -> Result<Outcome> {
        let maxiter = self.options.count("maxiter")?;
        let step = self.options.float("step")?;
        let sd_tol = self.options.float("sd_tol")?;

        let start = context.start_solution();
        let bounds = context.bounds().clone();
        let simplex = initial_simplex(&start, &bounds.lower(), &bounds.upper(), step);
        let solver = NelderMead::<Array1<f64>, f64>::new(simplex)
            .with_sd_tolerance(sd_tol)
            .map_err(numerical(NAME))?;

        let probe = Probe::new(context, 1e-6);
        let result = Executor::new(probe.objective(), solver)
            .configure(|state| state.max_iters(maxiter as u64))
            .run();

        let outcome = match settle(&probe, NAME, result)? {
            RunEnd::Done(result) => {
                let iterations = result.state.get_iter() as usize;
                let status = if iterations >= maxiter {
                    Status::MaxGenerations
                } else {
                    Status::Converged
                };
                Outcome::new(status, iterations)
            }
            RunEnd::Cancelled => Outcome::new(Status::Cancelled, probe.calls()),
            RunEnd::Halted(reason) => Outcome::new(Status::Other(reason), probe.calls()),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinable::FnRefinable;
    use crate::routines::evaluator::Evaluator;
    use crate::structs::bounds::{Bounds, Solution};
    use crate::structs::history::RefinementHistory;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn test_minimum_on_the_bound() {
        // The unconstrained minimum at x = -1 lies outside the domain
        let model = FnRefinable::new(vec![(0.0, 4.0)], array![3.0], |x: &Solution| {
            (x[0] + 1.0).powi(2)
        });
        let bounds = Bounds::new(vec![(0.0, 4.0)]).unwrap();
        let mut history = RefinementHistory::new();
        {
            let mut context =
                RefineContext::new(&model, bounds, &mut history, Arc::new(Evaluator::inline()));
            let mut method = NelderMeadMethod::boxed(MethodOptions::defaults(OPTIONS));
            method.run(&mut context).unwrap();
        }
        let best = history.best_solution().unwrap();
        assert!(best[0] >= 0.0);
        assert!((history.best_residual().unwrap() - 1.0).abs() < 1e-4);
    }
}
