use ndarray::Array2;

use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::routines::convergence::{std_dev, Stagnation};
use crate::routines::strategy::cmaes::CmaStrategy;
use crate::structs::bounds::Solution;
use crate::structs::history::Record;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "CMA-ES";
pub const DESCRIPTION: &str =
    "Covariance matrix adaptation evolution strategy, stopped on stagnation";

pub const OPTIONS: &[RefineMethodOption] = &[
    RefineMethodOption {
        name: "ngen",
        label: "Generations",
        description: "Maximum number of generations",
        kind: OptionKind::Int {
            min: 1,
            max: 100_000,
            default: 200,
        },
    },
    RefineMethodOption {
        name: "lambda",
        label: "Population",
        description: "Candidates per generation, 0 picks 4 + 3 ln(n)",
        kind: OptionKind::Int {
            min: 0,
            max: 10_000,
            default: 0,
        },
    },
    RefineMethodOption {
        name: "sigma",
        label: "Initial step",
        description: "Initial step size of the search distribution",
        kind: OptionKind::Float {
            min: 1e-6,
            max: 10.0,
            default: 0.5,
        },
    },
    RefineMethodOption {
        name: "stagn_ngen",
        label: "Stagnation window",
        description: "Generations over which the progress trend is measured",
        kind: OptionKind::Int {
            min: 3,
            max: 1000,
            default: 20,
        },
    },
    RefineMethodOption {
        name: "stagn_tol",
        label: "Stagnation tolerance",
        description: "Largest trend slope still considered flat",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1e3,
            default: 1e-3,
        },
    },
];

pub struct CMAES {
    options: MethodOptions,
}

impl CMAES {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(CMAES { options })
    }
}

/// The bounded solutions of a raw population, one per row
pub(crate) fn population_solutions(strategy: &CmaStrategy, population: &Array2<f64>) -> Vec<Solution> {
    population
        .rows()
        .into_iter()
        .map(|row| strategy.solution(&row.to_owned()))
        .collect()
}

/// Spread and best of the finite residuals of one generation
pub(crate) fn generation_stats(residuals: &[f64]) -> (f64, f64) {
    let finite: Vec<f64> = residuals.iter().copied().filter(|r| r.is_finite()).collect();
    let best = finite.iter().copied().fold(f64::INFINITY, f64::min);
    (std_dev(&finite), best)
}

impl RefineMethod for CMAES {
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
        let ngen = self.options.count("ngen")?;
        let lambda = Some(self.options.count("lambda")?).filter(|&l| l > 0);
        let sigma = self.options.float("sigma")?;
        let mut stagnation = Stagnation::new(
            self.options.count("stagn_ngen")?,
            self.options.float("stagn_tol")?,
        );

        let start = context.start_solution();
        let mut strategy =
            CmaStrategy::new(context.bounds(), &start, sigma, lambda, context.seed())?;
        tracing::info!(
            "{}: lambda = {}, mu = {}, {} generations at most",
            NAME,
            strategy.lambda(),
            strategy.mu(),
            ngen
        );

        let mut best = f64::INFINITY;
        for generation in 0..ngen {
            if context.is_cancelled() {
                tracing::warn!("{} cancelled in generation {}", NAME, generation);
                return Ok(Outcome::new(Status::Cancelled, generation));
            }
            let span = tracing::info_span!("", "{}", format!("Generation {}", generation));
            let _enter = span.enter();

            let population = strategy.ask();
            let solutions = population_solutions(&strategy, &population);
            let residuals = context.evaluate_batch(&solutions)?;
            strategy.tell(&population, &residuals)?;

            let (spread, generation_best) = generation_stats(&residuals);
            best = best.min(generation_best);
            context.set_message(format!(
                "{}: generation {}, best {:.6e}",
                NAME, generation, best
            ));
            context.update_batch(
                &solutions,
                &residuals,
                Some(
                    Record::new(generation)
                        .with("best", generation_best)
                        .with("std", spread)
                        .with("sigma", strategy.sigma()),
                ),
            );

            stagnation.push(spread, best);
            if stagnation.is_stagnant() {
                let (spread_slope, best_slope) = stagnation.slopes();
                tracing::info!(
                    "{} stagnated after {} generations (slopes {:.3e}, {:.3e})",
                    NAME,
                    generation + 1,
                    spread_slope,
                    best_slope
                );
                return Ok(Outcome::new(Status::Stagnated, generation + 1));
            }
        }

        Ok(Outcome::new(Status::MaxGenerations, ngen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinable::FnRefinable;
    use crate::routines::evaluator::Evaluator;
    use crate::structs::bounds::Bounds;
    use crate::structs::history::RefinementHistory;
    use crate::structs::options::OptionValue;
    use ndarray::array;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_finds_shifted_minimum() {
        let model = FnRefinable::new(
            vec![(-5.0, 5.0), (-5.0, 5.0)],
            array![0.0, 0.0],
            |x: &Solution| (x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2),
        );
        let bounds = Bounds::new(vec![(-5.0, 5.0), (-5.0, 5.0)]).unwrap();
        let mut history = RefinementHistory::new();
        {
            let mut context =
                RefineContext::new(&model, bounds, &mut history, Arc::new(Evaluator::inline()));
            let mut overrides = HashMap::new();
            overrides.insert("stagn_tol".to_string(), OptionValue::Float(0.0));
            let mut method = CMAES::boxed(MethodOptions::new(OPTIONS, &overrides).unwrap());
            let outcome = method.run(&mut context).unwrap();
            assert_eq!(outcome.status, Status::MaxGenerations);
        }
        assert!(history.best_residual().unwrap() < 1e-4);
        assert_eq!(history.records().len(), 200);
    }

    #[test]
    fn test_generation_stats_skip_failures() {
        let (spread, best) = generation_stats(&[1.0, f64::NAN, 3.0, f64::INFINITY]);
        assert_eq!(spread, 1.0);
        assert_eq!(best, 1.0);
    }
}
