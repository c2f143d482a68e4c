//! Covariance matrix adaptation evolution strategy with an ask/tell interface.
//!
//! The strategy samples in an unbounded raw space. A raw vector `y` maps into the bounds through
//! `x = lo + (hi - lo) * (1 + sin y) / 2`, so every candidate lands inside the domain no matter
//! how far the distribution wanders.

use linfa_linalg::eigh::Eigh;
use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::error::{RefineError, Result};
use crate::structs::bounds::{Bounds, Solution};

/// Smallest eigenvalue kept after a decomposition
const EIGEN_FLOOR: f64 = 1e-20;

/// Map a raw vector into the bounds
pub fn to_bounded(bounds: &Bounds, raw: &Array1<f64>) -> Solution {
    Array1::from_iter(
        raw.iter()
            .zip(bounds.iter())
            .map(|(y, (lo, hi))| lo + (hi - lo) * (1.0 + y.sin()) / 2.0),
    )
}

/// Map a solution inside the bounds back into raw space
pub fn to_raw(bounds: &Bounds, solution: &Solution) -> Array1<f64> {
    Array1::from_iter(solution.iter().zip(bounds.iter()).map(|(x, (lo, hi))| {
        let t = (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0);
        t.asin()
    }))
}

/// The state of one CMA-ES instance
#[derive(Debug, Clone)]
pub struct CmaStrategy {
    bounds: Bounds,
    dimension: usize,
    lambda: usize,
    mu: usize,
    weights: Array1<f64>,
    mu_eff: f64,
    c_c: f64,
    c_sigma: f64,
    c_1: f64,
    c_mu: f64,
    d_sigma: f64,
    chi_n: f64,
    centroid: Array1<f64>,
    sigma: f64,
    covariance: Array2<f64>,
    p_c: Array1<f64>,
    p_sigma: Array1<f64>,
    /// Eigenvectors of the covariance, one per column
    basis: Array2<f64>,
    /// Square roots of the eigenvalues of the covariance
    scales: Array1<f64>,
    generation: usize,
    rng: StdRng,
}

impl CmaStrategy {
    /// Create a strategy centred on `start`
    ///
    /// `sigma` is the initial step size in raw space; `lambda` overrides the default population
    /// size `4 + floor(3 ln n)`.
    pub fn new(
        bounds: &Bounds,
        start: &Solution,
        sigma: f64,
        lambda: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        bounds.check_dimension(start)?;
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(RefineError::Numerical {
                method: "CMA-ES",
                message: format!("initial step size must be positive, got {}", sigma),
            });
        }
        let dimension = bounds.len();
        let n = dimension as f64;
        let lambda = lambda
            .unwrap_or(4 + (3.0 * n.ln()).floor() as usize)
            .max(2);
        let mu = lambda / 2;

        let raw_weights =
            Array1::from_shape_fn(mu, |i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln());
        let weights = &raw_weights / raw_weights.sum();
        let mu_eff = 1.0 / weights.mapv(|w| w * w).sum();

        let c_sigma = (mu_eff + 2.0) / (n + mu_eff + 5.0);
        let d_sigma = 1.0 + 2.0 * (((mu_eff - 1.0) / (n + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let c_c = (4.0 + mu_eff / n) / (n + 4.0 + 2.0 * mu_eff / n);
        let c_1 = 2.0 / ((n + 1.3).powi(2) + mu_eff);
        let c_mu =
            (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((n + 2.0).powi(2) + mu_eff)).min(1.0 - c_1);
        let chi_n = n.sqrt() * (1.0 - 1.0 / (4.0 * n) + 1.0 / (21.0 * n * n));

        Ok(CmaStrategy {
            bounds: bounds.clone(),
            dimension,
            lambda,
            mu,
            weights,
            mu_eff,
            c_c,
            c_sigma,
            c_1,
            c_mu,
            d_sigma,
            chi_n,
            centroid: to_raw(bounds, start),
            sigma,
            covariance: Array2::eye(dimension),
            p_c: Array1::zeros(dimension),
            p_sigma: Array1::zeros(dimension),
            basis: Array2::eye(dimension),
            scales: Array1::ones(dimension),
            generation: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn lambda(&self) -> usize {
        self.lambda
    }

    pub fn mu(&self) -> usize {
        self.mu
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// The centroid in raw space
    pub fn centroid(&self) -> &Array1<f64> {
        &self.centroid
    }

    /// The centroid mapped into the bounds
    pub fn centroid_solution(&self) -> Solution {
        to_bounded(&self.bounds, &self.centroid)
    }

    /// Map a raw candidate into the bounds
    pub fn solution(&self, raw: &Array1<f64>) -> Solution {
        to_bounded(&self.bounds, raw)
    }

    /// Draw `lambda` raw candidates, one per row
    pub fn ask(&mut self) -> Array2<f64> {
        let bd = &self.basis * &self.scales;
        let mut population = Array2::zeros((self.lambda, self.dimension));
        for mut row in population.rows_mut() {
            let z: Array1<f64> =
                Array1::from_shape_fn(self.dimension, |_| self.rng.sample(StandardNormal));
            row.assign(&(&self.centroid + &(bd.dot(&z) * self.sigma)));
        }
        population
    }

    /// Update the distribution from the fitness of a full population
    ///
    /// Lower fitness is better. Non-finite fitness values rank last.
    pub fn tell(&mut self, population: &Array2<f64>, fitness: &[f64]) -> Result<()> {
        if population.nrows() != fitness.len() || population.nrows() < self.mu {
            return Err(RefineError::DimensionMismatch {
                expected: self.lambda,
                got: fitness.len(),
            });
        }

        let mut order: Vec<usize> = (0..fitness.len()).collect();
        order.sort_by(|&a, &b| rank(fitness[a]).total_cmp(&rank(fitness[b])));

        let old = self.centroid.clone();
        let mut centroid = Array1::zeros(self.dimension);
        for (w, &i) in self.weights.iter().zip(order.iter()) {
            centroid.scaled_add(*w, &population.row(i));
        }
        let shift = (&centroid - &old) / self.sigma;

        // C^-1/2 from the current decomposition
        let inv_scales = self.scales.mapv(|d| 1.0 / d);
        let whitened = self.basis.dot(&(self.basis.t().dot(&shift) * &inv_scales));

        self.p_sigma = &self.p_sigma * (1.0 - self.c_sigma)
            + &whitened * (self.c_sigma * (2.0 - self.c_sigma) * self.mu_eff).sqrt();

        let decay = 1.0 - (1.0 - self.c_sigma).powi(2 * (self.generation as i32 + 1));
        let ps_norm = self.p_sigma.dot(&self.p_sigma).sqrt();
        let h_sigma = if ps_norm / decay.sqrt()
            < (1.4 + 2.0 / (self.dimension as f64 + 1.0)) * self.chi_n
        {
            1.0
        } else {
            0.0
        };

        self.p_c = &self.p_c * (1.0 - self.c_c)
            + &shift * (h_sigma * (self.c_c * (2.0 - self.c_c) * self.mu_eff).sqrt());

        let mut rank_mu = Array2::zeros((self.dimension, self.dimension));
        for (w, &i) in self.weights.iter().zip(order.iter()) {
            let y = (&population.row(i) - &old) / self.sigma;
            rank_mu.scaled_add(*w, &outer(&y, &y));
        }

        let delta_h = (1.0 - h_sigma) * self.c_c * (2.0 - self.c_c);
        let base = 1.0 - self.c_1 - self.c_mu + self.c_1 * delta_h;
        self.covariance = &self.covariance * base
            + outer(&self.p_c, &self.p_c) * self.c_1
            + rank_mu * self.c_mu;

        self.sigma *= ((self.c_sigma / self.d_sigma) * (ps_norm / self.chi_n - 1.0)).exp();
        self.sigma = self.sigma.clamp(1e-12, 1e6);
        self.centroid = centroid;
        self.generation += 1;

        self.decompose()
    }

    /// Pull the distribution toward `target`
    ///
    /// The centroid moves a fraction `bias` of the way to `target`, and the covariance ellipsoid
    /// turns its principal axis toward the direction of `target` by the same fraction.
    pub fn rotate_and_bias(&mut self, target: &Solution, bias: f64) -> Result<()> {
        self.bounds.check_dimension(target)?;
        let bias = bias.clamp(0.0, 1.0);
        let direction = to_raw(&self.bounds, target) - &self.centroid;
        let norm = direction.dot(&direction).sqrt();
        if norm < f64::EPSILON || bias == 0.0 {
            return Ok(());
        }

        self.centroid.scaled_add(bias, &direction);

        let unit = &direction / norm;
        let largest = self.scales.fold(0.0_f64, |acc, d| acc.max(d * d));
        self.covariance = &self.covariance * (1.0 - bias) + outer(&unit, &unit) * (bias * largest);
        self.p_c.fill(0.0);
        self.p_sigma.fill(0.0);
        self.decompose()
    }

    fn decompose(&mut self) -> Result<()> {
        // Symmetrize against rounding drift
        let symmetric = (&self.covariance + &self.covariance.t()) * 0.5;
        let (values, vectors) = symmetric.eigh().map_err(|e| RefineError::Numerical {
            method: "CMA-ES",
            message: e.to_string(),
        })?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(RefineError::Numerical {
                method: "CMA-ES",
                message: "covariance matrix is not finite".into(),
            });
        }
        self.scales = values.mapv(|v| v.max(EIGEN_FLOOR).sqrt());
        self.basis = vectors;
        self.covariance = symmetric;
        Ok(())
    }
}

fn rank(fitness: f64) -> f64 {
    if fitness.is_finite() {
        fitness
    } else {
        f64::INFINITY
    }
}

fn outer<S, T>(a: &ndarray::ArrayBase<S, ndarray::Ix1>, b: &ndarray::ArrayBase<T, ndarray::Ix1>) -> Array2<f64>
where
    S: ndarray::Data<Elem = f64>,
    T: ndarray::Data<Elem = f64>,
{
    let column = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    column.dot(&row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn sphere(x: &Solution) -> f64 {
        x.iter().map(|v| (v - 1.0).powi(2)).sum()
    }

    #[test]
    fn test_bound_transform_roundtrip() {
        let bounds = Bounds::new(vec![(0.0, 10.0), (-5.0, -1.0)]).unwrap();
        let x = array![2.5, -4.0];
        let back = to_bounded(&bounds, &to_raw(&bounds, &x));
        assert_relative_eq!(back[0], 2.5, epsilon = 1e-12);
        assert_relative_eq!(back[1], -4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_candidates_are_always_within_bounds() {
        let bounds = Bounds::new(vec![(0.0, 1.0), (100.0, 200.0), (-1.0, 1.0)]).unwrap();
        let mut strategy =
            CmaStrategy::new(&bounds, &array![0.5, 150.0, 0.0], 50.0, Some(32), 3).unwrap();
        for row in strategy.ask().rows() {
            assert!(bounds.contains(&strategy.solution(&row.to_owned())));
        }
    }

    #[test]
    fn test_converges_on_sphere() {
        let bounds = Bounds::new(vec![(-5.0, 5.0); 3]).unwrap();
        let mut strategy = CmaStrategy::new(&bounds, &array![-3.0, 4.0, 2.0], 0.5, None, 7).unwrap();
        for _ in 0..200 {
            let population = strategy.ask();
            let fitness: Vec<f64> = population
                .rows()
                .into_iter()
                .map(|row| sphere(&strategy.solution(&row.to_owned())))
                .collect();
            strategy.tell(&population, &fitness).unwrap();
        }
        let best = strategy.centroid_solution();
        assert!(sphere(&best) < 1e-4, "centroid {:?}", best);
        assert_eq!(strategy.generation(), 200);
    }

    #[test]
    fn test_tell_rejects_partial_population() {
        let bounds = Bounds::new(vec![(0.0, 1.0); 2]).unwrap();
        let mut strategy = CmaStrategy::new(&bounds, &array![0.5, 0.5], 0.3, Some(8), 1).unwrap();
        let population = strategy.ask();
        let err = strategy.tell(&population, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, RefineError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_rotate_and_bias_moves_centroid() {
        let bounds = Bounds::new(vec![(0.0, 1.0); 2]).unwrap();
        let mut strategy = CmaStrategy::new(&bounds, &array![0.5, 0.5], 0.3, None, 1).unwrap();
        let target = array![0.9, 0.5];
        let before = strategy.centroid_solution();
        strategy.rotate_and_bias(&target, 0.5).unwrap();
        let after = strategy.centroid_solution();
        assert!(after[0] > before[0] && after[0] < target[0]);
        assert_relative_eq!(after[1], 0.5, epsilon = 1e-12);
        // The principal axis now leans toward the first parameter
        let c = strategy.covariance();
        assert!(c[[0, 0]] > c[[1, 1]]);
    }

    #[test]
    fn test_invalid_step_size() {
        let bounds = Bounds::new(vec![(0.0, 1.0)]).unwrap();
        assert!(CmaStrategy::new(&bounds, &array![0.5], 0.0, None, 1).is_err());
    }
}
