use std::collections::VecDeque;

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Least-squares slope of `values` against their position
///
/// Returns `0.0` for fewer than two values.
pub fn slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    sxy / sxx
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Two-sided p-value of Welch's unequal-variance t-test
///
/// Non-finite values are ignored. With fewer than two values on either side the samples are
/// treated as distinguishable (`0.0`). When both samples have no spread the p-value is `1.0`
/// for equal means and `0.0` otherwise.
pub fn welch_p_value(a: &[f64], b: &[f64]) -> f64 {
    let a: Vec<f64> = a.iter().copied().filter(|v| v.is_finite()).collect();
    let b: Vec<f64> = b.iter().copied().filter(|v| v.is_finite()).collect();
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }
    let (mean_a, var_a) = mean_and_variance(&a);
    let (mean_b, var_b) = mean_and_variance(&b);
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (sa, sb) = (var_a / na, var_b / nb);

    let se2 = sa + sb;
    if se2 <= 0.0 {
        let scale = mean_a.abs().max(mean_b.abs()).max(1.0);
        return if (mean_a - mean_b).abs() <= f64::EPSILON * scale {
            1.0
        } else {
            0.0
        };
    }

    let t = (mean_a - mean_b) / se2.sqrt();
    let df = se2 * se2 / (sa * sa / (na - 1.0) + sb * sb / (nb - 1.0));
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0),
        Err(_) => 0.0,
    }
}

/// Mean and unbiased sample variance
fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

/// Stagnation detector for population methods
///
/// Every generation pushes the spread of the population fitness and the best fitness found so
/// far. After `ngen` generations, a linear trend is fitted to the last `ngen - 1` values of both
/// series; the run is stagnant when neither trend is steeper than `tol`.
#[derive(Debug, Clone)]
pub struct Stagnation {
    ngen: usize,
    tol: f64,
    spread: VecDeque<f64>,
    best: VecDeque<f64>,
    generations: usize,
}

impl Stagnation {
    pub fn new(ngen: usize, tol: f64) -> Self {
        let ngen = ngen.max(3);
        Stagnation {
            ngen,
            tol,
            spread: VecDeque::with_capacity(ngen),
            best: VecDeque::with_capacity(ngen),
            generations: 0,
        }
    }

    /// Record the statistics of one generation
    pub fn push(&mut self, spread: f64, best: f64) {
        let window = self.ngen - 1;
        if self.spread.len() == window {
            self.spread.pop_front();
            self.best.pop_front();
        }
        self.spread.push_back(spread);
        self.best.push_back(best);
        self.generations += 1;
    }

    pub fn generations(&self) -> usize {
        self.generations
    }

    /// Slopes of the spread and best-fitness trends over the current window
    pub fn slopes(&self) -> (f64, f64) {
        let spread: Vec<f64> = self.spread.iter().copied().collect();
        let best: Vec<f64> = self.best.iter().copied().collect();
        (slope(&spread), slope(&best))
    }

    pub fn is_stagnant(&self) -> bool {
        if self.generations < self.ngen {
            return false;
        }
        let (spread, best) = self.slopes();
        spread.abs() < self.tol && best.abs() < self.tol
    }
}
