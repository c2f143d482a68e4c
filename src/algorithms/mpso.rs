use std::collections::BTreeSet;

use ndarray::Array1;
use ndarray_stats::QuantileExt;
use rand::prelude::*;

use crate::algorithms::cmaes::generation_stats;
use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::routines::convergence::welch_p_value;
use crate::routines::initialization::sobol;
use crate::routines::strategy::swarm::{PsoParams, Swarm};
use crate::structs::bounds::{Bounds, Solution};
use crate::structs::history::Record;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "MPSO";
pub const DESCRIPTION: &str =
    "Multi-swarm particle swarm optimization with exclusion of redundant swarms";

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
        label: "Swarms",
        description: "Number of swarms at the start of the run",
        kind: OptionKind::Int {
            min: 1,
            max: 100,
            default: 3,
        },
    },
    RefineMethodOption {
        name: "nparticles",
        label: "Particles",
        description: "Particles per swarm",
        kind: OptionKind::Int {
            min: 2,
            max: 1000,
            default: 10,
        },
    },
    RefineMethodOption {
        name: "max_active",
        label: "Active swarms",
        description: "Largest number of swarms allowed to explore at the same time",
        kind: OptionKind::Int {
            min: 1,
            max: 100,
            default: 5,
        },
    },
    RefineMethodOption {
        name: "conv_factor",
        label: "Convergence spread",
        description: "A swarm whose residual spread falls below this value has converged",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1e6,
            default: 1e-3,
        },
    },
    RefineMethodOption {
        name: "alpha",
        label: "Exclusion level",
        description: "Two converged swarms with a t-test p-value above this level are redundant",
        kind: OptionKind::Float {
            min: 0.0,
            max: 1.0,
            default: 0.05,
        },
    },
    RefineMethodOption {
        name: "inertia",
        label: "Inertia",
        description: "Weight of the previous velocity",
        kind: OptionKind::Float {
            min: 0.0,
            max: 2.0,
            default: 0.7298,
        },
    },
    RefineMethodOption {
        name: "cognitive",
        label: "Cognitive weight",
        description: "Pull toward the best position of each particle",
        kind: OptionKind::Float {
            min: 0.0,
            max: 5.0,
            default: 1.49618,
        },
    },
    RefineMethodOption {
        name: "social",
        label: "Social weight",
        description: "Pull toward the best position of the swarm",
        kind: OptionKind::Float {
            min: 0.0,
            max: 5.0,
            default: 1.49618,
        },
    },
];

/// Multi-swarm PSO
///
/// All swarms are evaluated in one batch per generation. After every generation the set of
/// swarms is adjusted: a swarm whose residual spread is above `conv_factor` is active, the worst
/// active swarm is dropped while too many are active, and a fresh Sobol-seeded swarm joins when
/// none is. Converged swarms whose residuals cannot be told apart by Welch's t-test sit on the
/// same basin, and the weaker one of each such pair is sent back out with new positions.
pub struct MPSO {
    options: MethodOptions,
}

impl MPSO {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(MPSO { options })
    }
}

/// Hands out Sobol sequences with a fresh seed for every new swarm
struct Seeder {
    bounds: Bounds,
    particles: usize,
    next: u32,
}

impl Seeder {
    fn swarm<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Swarm {
        let positions = sobol::generate(self.particles, &self.bounds, self.next);
        self.next = self.next.wrapping_add(1);
        Swarm::new(positions, &self.bounds, rng)
    }
}

/// Indices of the converged swarms that duplicate a better converged swarm
fn redundant_swarms(swarms: &[Swarm], active: &[bool], alpha: f64) -> BTreeSet<usize> {
    let mut redundant = BTreeSet::new();
    for i in 0..swarms.len() {
        for j in (i + 1)..swarms.len() {
            if active[i] || active[j] {
                continue;
            }
            let a = swarms[i].fitness().as_slice().unwrap_or(&[]);
            let b = swarms[j].fitness().as_slice().unwrap_or(&[]);
            if welch_p_value(a, b) > alpha {
                let weaker = if swarms[i].best_fitness() <= swarms[j].best_fitness() {
                    j
                } else {
                    i
                };
                redundant.insert(weaker);
            }
        }
    }
    redundant
}

impl RefineMethod for MPSO {
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
        let nparticles = self.options.count("nparticles")?;
        let max_active = self.options.count("max_active")?;
        let conv_factor = self.options.float("conv_factor")?;
        let alpha = self.options.float("alpha")?;
        let params = PsoParams {
            inertia: self.options.float("inertia")?,
            cognitive: self.options.float("cognitive")?,
            social: self.options.float("social")?,
        };

        let bounds = context.bounds().clone();
        let start = context.start_solution();
        let mut rng = StdRng::seed_from_u64(context.seed());
        let mut seeder = Seeder {
            bounds: bounds.clone(),
            particles: nparticles,
            next: context.seed() as u32,
        };

        let mut swarms: Vec<Swarm> = Vec::with_capacity(nswarms);
        for k in 0..nswarms {
            if k == 0 {
                let mut positions = sobol::generate(nparticles, &bounds, seeder.next);
                seeder.next = seeder.next.wrapping_add(1);
                positions.row_mut(0).assign(&start);
                swarms.push(Swarm::new(positions, &bounds, &mut rng));
            } else {
                swarms.push(seeder.swarm(&mut rng));
            }
        }

        for generation in 0..ngen {
            if context.is_cancelled() {
                tracing::warn!("{} cancelled in generation {}", NAME, generation);
                return Ok(Outcome::new(Status::Cancelled, generation));
            }
            let span = tracing::info_span!("", "{}", format!("Generation {}", generation));
            let _enter = span.enter();

            let solutions: Vec<Solution> = swarms
                .iter()
                .flat_map(|swarm| swarm.positions().rows().into_iter().map(|row| row.to_owned()))
                .collect();
            let residuals = context.evaluate_batch(&solutions)?;
            let mut offset = 0;
            for swarm in swarms.iter_mut() {
                let n = swarm.len();
                swarm.tell(&residuals[offset..offset + n])?;
                offset += n;
            }

            let (spread, generation_best) = generation_stats(&residuals);
            context.set_message(format!(
                "{}: generation {}, {} swarm(s), best {:.6e}",
                NAME,
                generation,
                swarms.len(),
                generation_best
            ));
            context.update_batch(
                &solutions,
                &residuals,
                Some(
                    Record::new(generation)
                        .with("best", generation_best)
                        .with("std", spread)
                        .with("swarms", swarms.len() as f64),
                ),
            );

            let mut active: Vec<bool> = swarms
                .iter()
                .map(|swarm| swarm.fitness_std() > conv_factor)
                .collect();
            let count = active.iter().filter(|a| **a).count();
            if count > max_active && swarms.len() > 1 {
                // Drop the active swarm with the worst best residual
                let bests = Array1::from_iter(swarms.iter().zip(active.iter()).map(
                    |(swarm, &is_active)| {
                        if is_active {
                            swarm.best_fitness()
                        } else {
                            f64::NEG_INFINITY
                        }
                    },
                ));
                if let Ok(worst) = bests.argmax_skipnan() {
                    tracing::debug!("Dropping swarm {} of {}", worst, swarms.len());
                    swarms.remove(worst);
                    active.remove(worst);
                }
            } else if count == 0 {
                tracing::debug!("All swarms converged, adding a new swarm");
                swarms.push(seeder.swarm(&mut rng));
                active.push(true);
            }

            for index in redundant_swarms(&swarms, &active, alpha) {
                tracing::debug!("Swarm {} duplicates a better swarm, reinitializing", index);
                swarms[index] = seeder.swarm(&mut rng);
            }

            for swarm in swarms.iter_mut() {
                swarm.step(&bounds, &params, &mut rng);
            }
        }

        Ok(Outcome::new(Status::MaxGenerations, ngen))
    }
}
