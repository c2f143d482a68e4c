use ndarray::Array1;

use crate::algorithms::{Outcome, RefineMethod, Status};
use crate::error::Result;
use crate::routines::context::RefineContext;
use crate::structs::bounds::{Bounds, Solution};
use crate::structs::history::Record;
use crate::structs::options::{MethodOptions, OptionKind, RefineMethodOption};

pub const NAME: &str = "Brute force";
pub const DESCRIPTION: &str =
    "Evaluates a regular grid over the parameter space and keeps the best point";

pub const OPTIONS: &[RefineMethodOption] = &[RefineMethodOption {
    name: "num_samples",
    label: "Samples per axis",
    description: "Number of evenly spaced values evaluated along every parameter",
    kind: OptionKind::Int {
        min: 2,
        max: 1000,
        default: 11,
    },
}];

/// Exhaustive grid evaluation
///
/// One parameter is sampled along a line and two parameters on a full grid. With more than
/// two parameters only the 2-D cross sections through the center of the domain are evaluated,
/// one per pair of parameters; all other parameters stay at their center value. The solution
/// in place before the run is restored afterwards, the best point is kept in the history.
pub struct BruteForce {
    options: MethodOptions,
}

impl BruteForce {
    pub fn boxed(options: MethodOptions) -> Box<dyn RefineMethod> {
        Box::new(BruteForce { options })
    }
}

/// The batches of grid points, one per line or cross section
pub fn grid_batches(bounds: &Bounds, samples: usize) -> Vec<Vec<Solution>> {
    let axes: Vec<Array1<f64>> = bounds
        .iter()
        .map(|&(lower, upper)| Array1::linspace(lower, upper, samples))
        .collect();
    let center = bounds.center();

    match bounds.len() {
        1 => vec![axes[0].iter().map(|&x| Array1::from_elem(1, x)).collect()],
        n => {
            let mut batches = Vec::with_capacity(n * (n - 1) / 2);
            for i in 0..n {
                for j in (i + 1)..n {
                    let mut batch = Vec::with_capacity(samples * samples);
                    for &a in axes[i].iter() {
                        for &b in axes[j].iter() {
                            let mut point = center.clone();
                            point[i] = a;
                            point[j] = b;
                            batch.push(point);
                        }
                    }
                    batches.push(batch);
                }
            }
            batches
        }
    }
}

impl RefineMethod for BruteForce {
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
        let samples = self.options.count("num_samples")?;
        let batches = grid_batches(context.bounds(), samples);
        let total: usize = batches.iter().map(Vec::len).sum();
        tracing::info!(
            "{}: {} points in {} batch(es)",
            NAME,
            total,
            batches.len()
        );

        let mut status = Status::Exhausted;
        let mut completed = 0;
        for (iteration, batch) in batches.iter().enumerate() {
            if context.is_cancelled() {
                status = Status::Cancelled;
                break;
            }
            context.set_message(format!(
                "{}: batch {} of {}",
                NAME,
                iteration + 1,
                batches.len()
            ));
            let residuals = context.evaluate_batch(batch)?;
            let best = residuals.iter().copied().fold(f64::INFINITY, f64::min);
            context.update_batch(
                batch,
                &residuals,
                Some(Record::new(iteration).with("best", best)),
            );
            completed += 1;
        }

        context.restore_initial();
        Ok(Outcome::new(status, completed))
    }

    fn applies_best(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_shapes() {
        let one = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let batches = grid_batches(&one, 11);
        assert_eq!(batches.len(), 1);
        let values: Vec<f64> = batches[0].iter().map(|p| p[0]).collect();
        assert_eq!(values, (0..=10).map(f64::from).collect::<Vec<_>>());

        let two = Bounds::new(vec![(0.0, 1.0), (0.0, 1.0)]).unwrap();
        let batches = grid_batches(&two, 4);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 16);

        let four = Bounds::new(vec![(0.0, 1.0); 4]).unwrap();
        let batches = grid_batches(&four, 3);
        assert_eq!(batches.len(), 6);
        // Parameters outside the pair stay at the center
        for point in &batches[0] {
            assert_eq!(point[2], 0.5);
            assert_eq!(point[3], 0.5);
        }
    }
}
