use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use diffrefine::prelude::*;
use diffrefine::routines::evaluator::FetchPolicy;
use eyre::{bail, Result};
use ndarray::array;
use tokio::sync::mpsc;

/// Settings for a quiet run that writes nothing
fn quiet(method: usize) -> Settings {
    let mut settings = Settings::new();
    settings.set_method(method);
    settings.log.write = false;
    settings.output.write = false;
    settings.config.stop_file = None;
    settings
}

fn inline() -> Handles {
    Handles {
        evaluator: Some(Arc::new(Evaluator::inline())),
        ..Handles::default()
    }
}

/// A two-phase mixture whose weight fractions should sum to one
struct Mixture {
    fractions: Solution,
    observed: Vec<f64>,
    /// Sum of fractions above which the residual fails
    limit: f64,
}

impl Mixture {
    fn new(fractions: Solution) -> Self {
        Mixture {
            fractions,
            observed: vec![3.0, 3.5],
            limit: f64::INFINITY,
        }
    }
}

impl Refinable for Mixture {
    type Data = (Solution, Vec<f64>, f64);

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(0.0, 1.0), (0.0, 1.0)]
    }

    fn initial_solution(&self) -> Solution {
        self.fractions.clone()
    }

    fn data_object(&self, solution: &Solution) -> Self::Data {
        (solution.clone(), self.observed.clone(), self.limit)
    }

    fn residual((fractions, observed, limit): Self::Data) -> Result<f64> {
        let total = fractions.sum();
        if total > limit {
            bail!("weight fractions sum to {:.3}", total);
        }
        let calculated = [fractions[0] * 10.0, fractions[1] * 5.0];
        Ok(calculated
            .iter()
            .zip(observed.iter())
            .map(|(c, o)| (c - o).powi(2))
            .sum::<f64>()
            + (total - 1.0).powi(2))
    }

    fn apply_solution(&mut self, solution: &Solution) {
        self.fractions = solution.clone();
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["quartz".into(), "calcite".into()]
    }
}

#[test]
fn test_refine_applies_best() -> Result<()> {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let mut settings = quiet(0);
    settings.set_method_option(0, "maxiter", OptionValue::Int(100));

    let result = refine_internal(&mut model, settings, inline())?;
    assert_eq!(result.status(), RefineStatus::Finished);
    assert_eq!(result.method(), "L-BFGS-B");
    assert_eq!(result.parameter_names(), ["quartz", "calcite"]);

    let history = result.history();
    assert_eq!(history.initial_solution(), Some(&array![0.5, 0.5]));
    assert!(history.best_residual().unwrap() < history.initial_residual().unwrap());
    // The model now carries the best solution
    assert_eq!(&model.fractions, history.best_solution().unwrap());
    Ok(())
}

#[test]
fn test_brute_force_keeps_model() -> Result<()> {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let result = refine_internal(&mut model, quiet(1), inline())?;
    assert_eq!(result.outcome().status, Status::Exhausted);
    // One initial evaluation and an 11 x 11 grid
    assert_eq!(result.evaluations(), 122);
    assert_eq!(model.fractions, array![0.5, 0.5]);
    Ok(())
}

#[test]
fn test_cancelled_run_is_stopped() -> Result<()> {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let cancel = Cancellable::new();
    cancel.cancel();
    let handles = Handles {
        cancel: Some(cancel),
        ..inline()
    };
    let result = refine_internal(&mut model, quiet(3), handles)?;
    assert_eq!(result.status(), RefineStatus::Stopped);
    assert!(result.error().is_none());
    assert_eq!(result.evaluations(), 1);
    Ok(())
}

#[test]
fn test_evaluation_error_ends_run() -> Result<()> {
    let mut model = Mixture {
        limit: 1.5,
        ..Mixture::new(array![0.1, 0.1])
    };
    // The grid corners sum to 2
    let result = refine_internal(&mut model, quiet(1), inline())?;
    assert_eq!(result.status(), RefineStatus::Error);
    assert!(result.error().unwrap().contains("weight fractions sum to"));
    assert!(result.failure().unwrap().is_evaluation_error());
    assert_eq!(result.history().status(), RefineStatus::Error);
    // Nothing is applied after a failure
    assert_eq!(model.fractions, array![0.1, 0.1]);
    Ok(())
}

#[test]
fn test_configuration_errors_come_first() {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let err = refine_internal(&mut model, quiet(42), inline()).unwrap_err();
    let err = err.downcast::<RefineError>().unwrap();
    assert!(matches!(err, RefineError::UnknownMethod(42)));

    let mut model = FnRefinable::new(vec![(1.0, 0.0)], array![0.5], |_: &Solution| 0.0);
    let err = refine_internal(&mut model, quiet(3), inline()).unwrap_err();
    assert!(err.downcast::<RefineError>().unwrap().is_config_error());
}

#[test]
fn test_progress_reports() -> Result<()> {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let mut settings = quiet(3);
    settings.set_method_option(3, "ngen", OptionValue::Int(4));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handles = Handles {
        progress: Some(tx),
        ..inline()
    };
    refine_internal(&mut model, settings, handles)?;

    let mut reports = Vec::new();
    while let Ok(report) = rx.try_recv() {
        reports.push(report);
    }
    // Six candidates per generation
    assert_eq!(reports.len(), 24);
    assert!(reports
        .windows(2)
        .all(|pair| pair[1].best_residual <= pair[0].best_residual));
    assert!(reports[23].message.starts_with("CMA-ES"));
    Ok(())
}

#[test]
fn test_sampling_records_every_evaluation() -> Result<()> {
    let mut model = Mixture::new(array![0.5, 0.5]);
    let mut settings = quiet(1);
    settings.sampling.enabled = true;
    settings.sampling.density = 11;
    let result = refine_internal(&mut model, settings, inline())?;
    let space = result.space().unwrap();
    assert_eq!(space.samples(), 122);
    assert_eq!(space.density(), 11);
    // The grid points fall on the cell centers
    assert_eq!(space.filled(), 121);
    Ok(())
}

#[test]
fn test_settings_from_toml() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.toml");
    let output = dir.path().join("out");
    std::fs::write(
        &path,
        format!(
            r#"
[config]
method = 4
seed = 7

[evaluator]
backend = "inline"
retries = 5

[log]
write = false

[output]
write = true
path = "{}"

[methods.4]
nswarms = 2
alpha = 0.1
"#,
            output.to_string_lossy().replace('\\', "/")
        ),
    )?;

    let settings = settings::read(path.to_string_lossy())?;
    assert_eq!(settings.config.method, 4);
    assert_eq!(settings.config.seed, 7);
    assert_eq!(settings.evaluator.backend, BackendKind::Inline);
    assert_eq!(settings.evaluator.retries, 5);
    assert_eq!(settings.method_options(4)["nswarms"], OptionValue::Int(2));
    assert_eq!(settings.method_options(4)["alpha"], OptionValue::Float(0.1));
    // A copy is written next to the outputs
    assert!(output.join("settings.json").exists());
    Ok(())
}

#[test]
fn test_unknown_settings_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "[config]\nmethods = 4\n")?;
    assert!(settings::read(path.to_string_lossy()).is_err());
    Ok(())
}

#[test]
fn test_fetch_stalls_after_retry_budget() {
    let evaluator = Evaluator::new(&diffrefine::routines::settings::EvaluatorSettings {
        backend: BackendKind::Pool,
        threads: 2,
        ..Default::default()
    })
    .unwrap()
    .with_policy(FetchPolicy {
        timeout: Some(Duration::from_millis(5)),
        retries: 4,
    });
    let handle = evaluator
        .submit(Box::new(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<f64, eyre::Report>(1.0)
        }))
        .unwrap();
    let err = evaluator.fetch_default(handle).unwrap_err();
    assert!(err.is_stall());
    assert!(matches!(err, RefineError::Stalled { attempts: 4, .. }));
    evaluator.shutdown();
}

#[test]
fn test_stalled_initial_evaluation_restarts_evaluator() {
    let evaluator = Arc::new(
        Evaluator::new(&diffrefine::routines::settings::EvaluatorSettings {
            backend: BackendKind::Pool,
            threads: 1,
            ..Default::default()
        })
        .unwrap()
        .with_policy(FetchPolicy {
            timeout: Some(Duration::from_millis(5)),
            retries: 2,
        }),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut model = FnRefinable::new(vec![(0.0, 1.0)], array![0.5], move |x: &Solution| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_secs(1));
        }
        x[0]
    });
    let handles = Handles {
        evaluator: Some(evaluator.clone()),
        ..Handles::default()
    };
    let err = refine_internal(&mut model, quiet(0), handles).unwrap_err();
    assert!(err.downcast::<RefineError>().unwrap().is_stall());

    // The wedged worker belongs to the old pool
    let results = evaluator
        .evaluate_all(vec![Box::new(|| Ok::<f64, eyre::Report>(2.0))])
        .unwrap();
    assert_eq!(results, vec![2.0]);
    evaluator.shutdown();
}
