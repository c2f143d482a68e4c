use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{RefineError, Result};

/// A candidate parameter vector, one entry per refinable parameter
pub type Solution = Array1<f64>;

/// The `(min, max)` range of every refinable parameter
///
/// Bounds are validated once on construction and stay immutable for the duration of a refinement.
/// Every [Solution] that is stored or handed to a worker passes through [Bounds::clip] first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    bounds: Vec<(f64, f64)>,
}

impl Bounds {
    /// Create a new set of bounds
    ///
    /// Fails if no bounds are given, or if any pair is not finite or has `min >= max`.
    pub fn new(bounds: Vec<(f64, f64)>) -> Result<Self> {
        if bounds.is_empty() {
            return Err(RefineError::EmptyParameters);
        }
        for (index, &(lower, upper)) in bounds.iter().enumerate() {
            if !lower.is_finite() || !upper.is_finite() || lower >= upper {
                return Err(RefineError::InvalidBounds {
                    index,
                    lower,
                    upper,
                });
            }
        }
        Ok(Bounds { bounds })
    }

    /// Number of refinable parameters
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn as_slice(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.bounds.iter()
    }

    pub fn lower(&self) -> Array1<f64> {
        self.bounds.iter().map(|(lower, _)| *lower).collect()
    }

    pub fn upper(&self) -> Array1<f64> {
        self.bounds.iter().map(|(_, upper)| *upper).collect()
    }

    /// The midpoint of every range
    pub fn center(&self) -> Array1<f64> {
        self.bounds
            .iter()
            .map(|(lower, upper)| lower + (upper - lower) / 2.0)
            .collect()
    }

    /// The width (`max - min`) of every range
    pub fn ranges(&self) -> Array1<f64> {
        self.bounds
            .iter()
            .map(|(lower, upper)| upper - lower)
            .collect()
    }

    /// Check that `solution` has one entry per parameter
    pub fn check_dimension(&self, solution: &Solution) -> Result<()> {
        if solution.len() != self.len() {
            return Err(RefineError::DimensionMismatch {
                expected: self.len(),
                got: solution.len(),
            });
        }
        Ok(())
    }

    /// Clip every component of `solution` into its range, in place
    ///
    /// A NaN component is replaced by the center of its range.
    pub fn clip_inplace(&self, solution: &mut Solution) {
        Zip::from(solution)
            .and(&Array1::from(self.bounds.clone()))
            .for_each(|x, &(lower, upper)| {
                *x = if x.is_nan() {
                    lower + (upper - lower) / 2.0
                } else {
                    x.clamp(lower, upper)
                };
            });
    }

    /// Return a copy of `solution` with every component clipped into its range
    pub fn clip(&self, solution: &Solution) -> Solution {
        let mut clipped = solution.clone();
        self.clip_inplace(&mut clipped);
        clipped
    }

    /// Whether every component of `solution` lies within its range
    pub fn contains(&self, solution: &Solution) -> bool {
        solution.len() == self.len()
            && solution
                .iter()
                .zip(self.bounds.iter())
                .all(|(x, (lower, upper))| x >= lower && x <= upper)
    }

    /// Map a unit-cube point (every component in `[0, 1]`) into the bounded space
    pub fn scale_unit(&self, unit: &Solution) -> Solution {
        Zip::from(unit)
            .and(&Array1::from(self.bounds.clone()))
            .map_collect(|u, &(lower, upper)| lower + u * (upper - lower))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::prelude::*;

    #[test]
    fn test_bounds_validation() {
        assert!(matches!(
            Bounds::new(vec![]),
            Err(RefineError::EmptyParameters)
        ));
        assert!(matches!(
            Bounds::new(vec![(0.0, 1.0), (2.0, 2.0)]),
            Err(RefineError::InvalidBounds { index: 1, .. })
        ));
        assert!(matches!(
            Bounds::new(vec![(f64::NEG_INFINITY, 1.0)]),
            Err(RefineError::InvalidBounds { index: 0, .. })
        ));
        assert!(Bounds::new(vec![(-1.0, 1.0)]).is_ok());
    }

    #[test]
    fn test_center_and_ranges() {
        let bounds = Bounds::new(vec![(0.0, 10.0), (-2.0, 2.0)]).unwrap();
        assert_eq!(bounds.center(), array![5.0, 0.0]);
        assert_eq!(bounds.ranges(), array![10.0, 4.0]);
    }

    #[test]
    fn test_clip_in_bounds_is_noop() {
        let bounds = Bounds::new(vec![(0.0, 10.0), (-2.0, 2.0)]).unwrap();
        let x = array![3.0, -1.5];
        assert_eq!(bounds.clip(&x), x);
    }

    #[test]
    fn test_clip_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let n = rng.gen_range(1..6);
            let raw: Vec<(f64, f64)> = (0..n)
                .map(|_| {
                    let lower = rng.gen_range(-100.0..100.0);
                    (lower, lower + rng.gen_range(0.01..50.0))
                })
                .collect();
            let bounds = Bounds::new(raw).unwrap();
            let x: Solution = (0..n).map(|_| rng.gen_range(-500.0..500.0)).collect();
            let once = bounds.clip(&x);
            assert!(bounds.contains(&once));
            assert_eq!(bounds.clip(&once), once);
        }
    }

    #[test]
    fn test_clip_replaces_nan_with_center() {
        let bounds = Bounds::new(vec![(0.0, 4.0)]).unwrap();
        assert_eq!(bounds.clip(&array![f64::NAN]), array![2.0]);
    }

    #[test]
    fn test_dimension_check() {
        let bounds = Bounds::new(vec![(0.0, 1.0), (0.0, 1.0)]).unwrap();
        assert!(bounds.check_dimension(&array![0.5]).is_err());
        assert!(bounds.check_dimension(&array![0.5, 0.5]).is_ok());
    }
}
