use ndarray::Array2;
use sobol_burley::sample;

use crate::structs::bounds::Bounds;

/// Generates a 2-dimensional array containing a Sobol sequence within the given bounds.
///
/// This function samples the space using a Sobol sequence of `points` points, distributed along `bounds.len()` dimensions.
///
/// It is used to seed the swarms of the particle methods, so that a fresh swarm covers the domain evenly instead of
/// clustering by chance.
///
/// # Arguments
///
/// * `points` - The number of points in the Sobol sequence.
/// * `bounds` - The minimum and maximum value of every parameter.
/// * `seed` - The seed for the Sobol sequence generator.
///
/// # Returns
///
/// A 2D array where each row is a point in the Sobol sequence, and each column corresponds to a parameter.
/// The value of each parameter is scaled to be within the corresponding bound.
pub fn generate(points: usize, bounds: &Bounds, seed: u32) -> Array2<f64> {
    let ranges = bounds.as_slice();
    Array2::from_shape_fn((points, ranges.len()), |(i, j)| {
        let unscaled = sample(i as u32, j as u32, seed) as f64;
        let (lower, upper) = ranges[j];
        lower + unscaled * (upper - lower)
    })
}
