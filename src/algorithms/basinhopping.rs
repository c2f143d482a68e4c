use argmin::core::Executor;
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;
use rand::prelude::*;

use crate::algorithms::objective::{initial_simplex, numerical, settle, Probe, RunEnd};
use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::structs::history::Record;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "Basin hopping";
pub const DESCRIPTION: &str =
    "Random jumps followed by a bounded local descent, accepted by the Metropolis criterion";

pub const OPTIONS: &[RefineMethodOption] = &[
    RefineMethodOption {
        name: "niter",
        label: "Hops",
        description: "Number of perturb-and-descend steps",
        kind: OptionKind::Int {
            min: 1,
            max: 10_000,
            default: 100,
        },
    },
    RefineMethodOption {
        name: "temperature",
        label: "Temperature",
        description: "Residual scale of the Metropolis acceptance test",
        kind: OptionKind::Float {
            min: 1e-9,
            max: 1e9,
            default: 1.0,
        },
    },
    RefineMethodOption {
        name: "stepsize",
        label: "Step size",
        description: "Largest random jump, as a fraction of each parameter range",
        kind: OptionKind::Float {
            min: 1e-6,
            max: 1.0,
            default: 0.1,
        },
    },
    RefineMethodOption {
        name: "local_iter",
        label: "Local iterations",
        description: "Iteration budget of every local descent",
        kind: OptionKind::Int {
            min: 1,
            max: 10_000,
            default: 50,
        },
    },
];

pub struct BasinHopping {
    options: MethodOptions,
}

impl BasinHopping {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(BasinHopping { options })
    }
}

impl RefineMethod for BasinHopping {
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
        let niter = self.options.count("niter")?;
        let temperature = self.options.float("temperature")?;
        let stepsize = self.options.float("stepsize")?;
        let local_iter = self.options.count("local_iter")?;

        let mut rng = StdRng::seed_from_u64(context.seed());
        let (mut current, mut current_residual) = context.start_state()?;
        let bounds = context.bounds().clone();
        let (lower, upper, ranges) = (bounds.lower(), bounds.upper(), bounds.ranges());

        // Local descents are not accepted states, only hops are recorded
        let probe = Probe::new(context, 1e-6).recording(false);
        let mut accepted = 0;

        for iteration in 0..niter {
            if probe.with_context(|context| context.is_cancelled()) {
                return Ok(Outcome::new(Status::Cancelled, iteration));
            }
            let span = tracing::info_span!("", "{}", format!("Hop {}", iteration));
            let _enter = span.enter();

            let jump = Array1::from_shape_fn(current.len(), |i| {
                rng.gen_range(-1.0..=1.0) * stepsize * ranges[i]
            });
            let perturbed = bounds.clip(&(&current + &jump));

            probe.reset_best();
            let simplex = initial_simplex(&perturbed, &lower, &upper, stepsize / 2.0);
            let solver = NelderMead::<Array1<f64>, f64>::new(simplex)
                .with_sd_tolerance(1e-10)
                .map_err(numerical(NAME))?;
            let result = Executor::new(probe.objective(), solver)
                .configure(|state| state.max_iters(local_iter as u64))
                .run();
            match settle(&probe, NAME, result)? {
                RunEnd::Cancelled => return Ok(Outcome::new(Status::Cancelled, iteration)),
                RunEnd::Done(_) | RunEnd::Halted(_) => {}
            }

            let Some((candidate, residual)) = probe.best() else {
                continue;
            };
            let accept = residual < current_residual
                || rng.gen::<f64>() < (-(residual - current_residual) / temperature).exp();
            if accept {
                accepted += 1;
                current = candidate;
                current_residual = residual;
                probe.with_context(|context| {
                    context.update(
                        &current,
                        current_residual,
                        Some(
                            Record::new(iteration)
                                .with("residual", current_residual)
                                .with("accepted", accepted as f64),
                        ),
                    )
                });
            }
            tracing::debug!(
                "Hop {}: candidate {:.6e}, {}",
                iteration,
                residual,
                if accept { "accepted" } else { "rejected" }
            );
        }

        Ok(Outcome::new(Status::MaxGenerations, niter))
    }
}
