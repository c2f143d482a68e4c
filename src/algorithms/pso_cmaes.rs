use crate::algorithms::cmaes::{generation_stats, population_solutions};
use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::routines::convergence::Stagnation;
use crate::routines::initialization::sobol;
use crate::routines::strategy::cmaes::CmaStrategy;
use crate::structs::bounds::Solution;
use crate::structs::history::Record;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "PSO-CMA-ES";
pub const DESCRIPTION: &str =
    "Several CMA-ES instances that share their global best like the particles of a swarm";

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
        name: "nswarms",
        label: "Instances",
        description: "Number of CMA-ES instances evaluated together",
        kind: OptionKind::Int {
            min: 1,
            max: 100,
            default: 4,
        },
    },
    RefineMethodOption {
        name: "lambda",
        label: "Population",
        description: "Candidates per instance and generation, 0 picks 4 + 3 ln(n)",
        kind: OptionKind::Int {
            min: 0,
            max: 10_000,
            default: 0,
        },
    },
    RefineMethodOption {
        name: "sigma",
        label: "Initial step",
        description: "Initial step size of every instance",
        kind: OptionKind::Float {
            min: 1e-6,
            max: 10.0,
            default: 0.5,
        },
    },
    RefineMethodOption {
        name: "ngen_comm",
        label: "Communication interval",
        description: "Generations between two pulls toward the global best",
        kind: OptionKind::Int {
            min: 1,
            max: 1000,
            default: 5,
        },
    },
    RefineMethodOption {
        name: "bias",
        label: "Bias",
        description: "Fraction of the way every instance moves toward the global best",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1.0,
            default: 0.2,
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

pub struct PSOCMAES {
    options: MethodOptions,
}

impl PSOCMAES {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(PSOCMAES { options })
    }
}

impl RefineMethod for PSOCMAES {
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
        let nswarms = self.options.count("nswarms")?;
        let lambda = Some(self.options.count("lambda")?).filter(|&l| l > 0);
        let sigma = self.options.float("sigma")?;
        let ngen_comm = self.options.count("ngen_comm")?;
        let bias = self.options.float("bias")?;
        let mut stagnation = Stagnation::new(
            self.options.count("stagn_ngen")?,
            self.options.float("stagn_tol")?,
        );

        let bounds = context.bounds().clone();
        let seed = context.seed();
        let centers = sobol::generate(nswarms, &bounds, seed as u32);
        let mut strategies = Vec::with_capacity(nswarms);
        for k in 0..nswarms {
            let center = if k == 0 {
                context.start_solution()
            } else {
                centers.row(k).to_owned()
            };
            strategies.push(CmaStrategy::new(
                &bounds,
                &center,
                sigma,
                lambda,
                seed.wrapping_add(k as u64),
            )?);
        }

        let mut global: Option<(Solution, f64)> = None;
        let mut best = f64::INFINITY;
        for generation in 0..ngen {
            if context.is_cancelled() {
                tracing::warn!("{} cancelled in generation {}", NAME, generation);
                return Ok(Outcome::new(Status::Cancelled, generation));
            }
            let span = tracing::info_span!("", "{}", format!("Generation {}", generation));
            let _enter = span.enter();

            let populations: Vec<_> = strategies.iter_mut().map(|s| s.ask()).collect();
            let mut solutions = Vec::new();
            for (strategy, population) in strategies.iter().zip(populations.iter()) {
                solutions.extend(population_solutions(strategy, population));
            }
            let residuals = context.evaluate_batch(&solutions)?;

            let mut offset = 0;
            for (strategy, population) in strategies.iter_mut().zip(populations.iter()) {
                let n = population.nrows();
                strategy.tell(population, &residuals[offset..offset + n])?;
                offset += n;
            }

            for (solution, &residual) in solutions.iter().zip(residuals.iter()) {
                if residual < global.as_ref().map_or(f64::INFINITY, |(_, r)| *r) {
                    global = Some((solution.clone(), residual));
                }
            }

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
                        .with("std", spread),
                ),
            );

            if (generation + 1) % ngen_comm == 0 {
                if let Some((target, _)) = &global {
                    tracing::debug!("Pulling {} instances toward the global best", strategies.len());
                    for strategy in strategies.iter_mut() {
                        strategy.rotate_and_bias(target, bias)?;
                    }
                }
            }

            stagnation.push(spread, best);
            if stagnation.is_stagnant() {
                tracing::info!("{} stagnated after {} generations", NAME, generation + 1);
                return Ok(Outcome::new(Status::Stagnated, generation + 1));
            }
        }

        Ok(Outcome::new(Status::MaxGenerations, ngen))
    }
}
