use argmin::core::{Executor, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS as ArgminLBFGS;
use ndarray::Array1;

use crate::algorithms::objective::{numerical, settle, Probe, RunEnd};
use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "L-BFGS-B";
pub const DESCRIPTION: &str =
    "Bounded quasi-Newton local search with finite-difference gradients evaluated in parallel";

pub const OPTIONS: &[RefineMethodOption] = &[
    RefineMethodOption {
        name: "maxiter",
        label: "Maximum iterations",
        description: "Upper limit on the number of quasi-Newton iterations",
        kind: OptionKind::Int {
            min: 1,
            max: 100_000,
            default: 200,
        },
    },
    RefineMethodOption {
        name: "memory",
        label: "History size",
        description: "Number of correction pairs kept to approximate the Hessian",
        kind: OptionKind::Int {
            min: 1,
            max: 50,
            default: 10,
        },
    },
    RefineMethodOption {
        name: "epsilon",
        label: "Gradient step",
        description: "Finite-difference step, as a fraction of each parameter range",
        kind: OptionKind::Float {
            min: 1e-12,
            max: 0.1,
            default: 1e-6,
        },
    },
    RefineMethodOption {
        name: "tol",
        label: "Tolerance",
        description: "Stop when the gradient norm or the change in residual falls below this value",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1.0,
            default: 1e-8,
        },
    },
];

/// L-BFGS local refinement
///
/// The solver works on the unbounded cost `residual(clip(x)) + penalty(x)`, where the penalty
/// grows quadratically with the distance of `x` outside the bounds. Residuals are only ever
/// computed at clipped points.
pub struct LBFGSB {
    options: MethodOptions,
}

impl LBFGSB {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(LBFGSB { options })
    }
}

impl RefineMethod for LBFGSB {
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
        let memory = self.options.count("memory")?;
        let epsilon = self.options.float("epsilon")?;
        let tol = self.options.float("tol")?;

        let start = context.start_solution();
        context.set_message(format!("{}: refining {} parameters", NAME, start.len()));

        let linesearch: MoreThuenteLineSearch<Array1<f64>, Array1<f64>, f64> =
            MoreThuenteLineSearch::new();
        let solver = ArgminLBFGS::new(linesearch, memory)
            .with_tolerance_grad(tol)
            .and_then(|solver| solver.with_tolerance_cost(tol))
            .map_err(numerical(NAME))?;

        let probe = Probe::new(context, epsilon);
        let result = Executor::new(probe.objective(), solver)
            .configure(|state| state.param(start).max_iters(maxiter as u64))
            .run();

        let outcome = match settle(&probe, NAME, result)? {
            RunEnd::Done(result) => {
                let iterations = result.state.get_iter() as usize;
                tracing::info!(
                    "{} finished after {} iterations, best cost {:.6e}",
                    NAME,
                    iterations,
                    result.state.get_best_cost()
                );
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
    fn test_quadratic_interior_minimum() {
        let model = FnRefinable::new(
            vec![(-5.0, 5.0), (-5.0, 5.0)],
            array![3.0, -4.0],
            |x: &Solution| (x[0] - 1.0).powi(2) + 2.0 * (x[1] + 0.5).powi(2),
        );
        let bounds = Bounds::new(vec![(-5.0, 5.0), (-5.0, 5.0)]).unwrap();
        let mut history = RefinementHistory::new();
        history.set_initial(array![3.0, -4.0], 28.5);
        {
            let mut context =
                RefineContext::new(&model, bounds, &mut history, Arc::new(Evaluator::inline()));
            let mut method = LBFGSB::boxed(MethodOptions::defaults(OPTIONS));
            let outcome = method.run(&mut context).unwrap();
            assert_ne!(outcome.status, Status::Cancelled);
        }

        assert!(history.best_residual().unwrap() < 1e-6);
        let best = history.best_solution().unwrap();
        assert!((best[0] - 1.0).abs() < 1e-3);
        assert!((best[1] + 0.5).abs() < 1e-3);
    }
}
