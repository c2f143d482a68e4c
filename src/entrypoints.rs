use std::sync::Arc;
use std::time::Instant;

use eyre::{Result, WrapErr};
use tokio::sync::mpsc::UnboundedSender;

use crate::algorithms::{dispatch_method, Outcome, Status};
use crate::refinable::{Refinable, TaskSource};
use crate::routines::context::{Progress, RefineContext};
use crate::routines::evaluator::{self, Evaluator};
use crate::routines::logger;
use crate::routines::output::RefineResult;
use crate::routines::parameter_space::ParameterSpace;
use crate::routines::settings::Settings;
use crate::structs::bounds::Bounds;
use crate::structs::cancel::Cancellable;
use crate::structs::history::{RefineStatus, RefinementHistory};

/// Optional connections between a host and a running refinement
#[derive(Default)]
pub struct Handles {
    /// Token the host keeps to stop the run
    pub cancel: Option<Cancellable>,
    /// Receives a [Progress] report after every update
    pub progress: Option<UnboundedSender<Progress>>,
    /// Evaluator to use instead of the process-wide one
    pub evaluator: Option<Arc<Evaluator>>,
}

/// Primary entrypoint
///
/// Sets up logging, runs the method selected by `settings.config.method` against `model` and
/// writes the output files (if configured). The best solution found is written back onto the
/// model unless the method keeps the pre-run solution in place.
pub fn refine<R: Refinable>(model: &mut R, settings: Settings) -> Result<RefineResult> {
    logger::setup_log(&settings)?;
    tracing::info!("Starting diffrefine");

    match settings.output.write {
        true => tracing::info!("Output files will be written to {}", settings.output.path),
        false => tracing::info!(
            "Output files will not be written - set `output.write = true` in the configuration file to enable output files"
        ),
    }

    let result = refine_internal(model, settings, Handles::default())?;
    result.write_outputs()?;
    Ok(result)
}

/// Alternative entrypoint, meant for hosts that embed the engine
///
/// Does not install a log subscriber and does not write any output files. Configuration errors
/// are returned before anything is evaluated. Errors raised while the method runs end the run
/// with [RefineStatus::Error]; they are logged and attached to the returned result (see
/// [RefineResult::failure]), with the history as it was after the last complete batch.
pub fn refine_internal<R: Refinable>(
    model: &mut R,
    settings: Settings,
    handles: Handles,
) -> Result<RefineResult> {
    let now = Instant::now();
    settings.validate()?;

    let bounds = Bounds::new(model.bounds())?;
    let initial = model.initial_solution();
    bounds
        .check_dimension(&initial)
        .wrap_err("The initial solution does not match the bounds")?;
    let initial = bounds.clip(&initial);

    let index = settings.config.method;
    let mut method = dispatch_method(index, &settings.method_options(index))?;
    tracing::info!(
        "Refining {} parameter(s) with {} (method {})",
        bounds.len(),
        method.name(),
        index
    );
    for (name, value) in method.options().iter() {
        tracing::debug!("{} = {}", name, value);
    }

    let evaluator = match handles.evaluator {
        Some(evaluator) => evaluator,
        None => evaluator::global(&settings.evaluator)?,
    };

    let mut cancel = handles.cancel.unwrap_or_default();
    if let Some(stop_file) = &settings.config.stop_file {
        cancel = cancel.with_stop_file(stop_file);
        cancel
            .clear_stop_file()
            .wrap_err("Unable to remove the previous stop file")?;
    }

    let mut space = settings
        .sampling
        .enabled
        .then(|| ParameterSpace::new(&bounds, settings.sampling.density, settings.sampling.memory_budget));

    // The starting point is evaluated before the method runs
    let initial_residual = evaluator.evaluate_or_restart(vec![model.task(&initial)])?[0];
    if let Some(space) = space.as_mut() {
        space.record(&initial, initial_residual);
    }
    tracing::info!("Initial residual: {:.6e}", initial_residual);

    let mut history = RefinementHistory::new();
    history.set_initial(initial, initial_residual);
    history.set_status(RefineStatus::Running);

    let (run, evaluations, space) = {
        let mut context = RefineContext::new(&*model, bounds, &mut history, evaluator)
            .with_cancel(cancel)
            .with_seed(settings.config.seed);
        if let Some(progress) = handles.progress {
            context = context.with_progress(progress);
        }
        if let Some(space) = space {
            context = context.with_sampler(space);
        }
        let run = method.run(&mut context);
        (run, context.evaluations() + 1, context.take_space())
    };

    let mut failure = None;
    let outcome = match run {
        Ok(outcome) if outcome.cancelled() => {
            tracing::warn!("Refinement stopped after {} iteration(s)", outcome.iterations);
            history.set_status(RefineStatus::Stopped);
            outcome
        }
        Ok(outcome) => {
            tracing::info!("{}: {}", method.name(), outcome.status);
            history.set_status(RefineStatus::Finished);
            outcome
        }
        Err(err) => {
            tracing::error!("An error has occurred during the refinement: {}", err);
            history.set_status(RefineStatus::Error);
            history.set_message(err.to_string());
            let outcome = Outcome::new(Status::Other(err.to_string()), 0);
            failure = Some(err);
            outcome
        }
    };

    if failure.is_none() && method.applies_best() && history.apply_best(model) {
        tracing::info!(
            "Best residual {:.6e} applied to the model",
            history.best_residual().unwrap_or(f64::NAN)
        );
    }

    let elapsed = now.elapsed();
    tracing::info!(
        "Refinement complete after {:.2?} and {} evaluation(s)",
        elapsed,
        evaluations
    );

    let result = RefineResult::new(
        index,
        method.name(),
        outcome,
        evaluations,
        elapsed,
        model.parameter_names(),
        history,
        space,
        settings,
    );
    Ok(match failure {
        Some(err) => result.with_error(err),
        None => result,
    })
}
