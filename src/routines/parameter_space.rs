//! Sampling of the parameter space around a solution.
//!
//! Every evaluated solution can be recorded into a [ParameterSpace]. For a single parameter the
//! samples are bucketed onto a 1-D grid; for more parameters they are bucketed onto the 2-D
//! cross sections through the center of the domain, one per pair of parameters. Each cell keeps
//! the sample closest to its center, which is enough to draw residual maps afterwards.

use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::structs::bounds::{Bounds, Solution};

/// Smallest number of cells per axis
pub const MIN_DENSITY: usize = 3;

/// The sample kept by a grid cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    /// The sampled solution
    pub point: Solution,
    /// Its residual
    pub residual: f64,
    /// Normalized distance between the sample and the cell center
    pub distance: f64,
}

/// Grid of the best-placed samples around the center of the domain
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpace {
    bounds: Bounds,
    density: usize,
    pairs: Vec<(usize, usize)>,
    cells: Vec<Option<Cell>>,
    samples: usize,
}

impl ParameterSpace {
    /// Create an empty grid with `density` cells per axis
    ///
    /// The density is lowered until the grid fits in `memory_budget` bytes, but never below
    /// [MIN_DENSITY].
    pub fn new(bounds: &Bounds, density: usize, memory_budget: usize) -> Self {
        let n = bounds.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let density = fit_density(n, pairs.len(), density, memory_budget);
        let size = if n == 1 {
            density
        } else {
            pairs.len() * density * density
        };
        tracing::debug!(
            "Parameter space grid: {} cross section(s) of density {}",
            pairs.len().max(1),
            density
        );
        ParameterSpace {
            bounds: bounds.clone(),
            density,
            pairs,
            cells: vec![None; size],
            samples: 0,
        }
    }

    /// Record an evaluated solution
    ///
    /// Returns `true` if the sample now occupies its cell.
    pub fn record(&mut self, solution: &Solution, residual: f64) -> bool {
        if solution.len() != self.bounds.len() || residual.is_nan() {
            return false;
        }
        self.samples += 1;
        let z = self.normalize(solution);

        let (slot, distance) = if self.pairs.is_empty() {
            let index = self.axis_index(z[0]);
            (index, (z[0] - self.cell_center(index)).abs())
        } else {
            let (a, b) = closest_pair(&z);
            let pair = self
                .pairs
                .iter()
                .position(|&p| p == (a, b))
                .unwrap_or_default();
            let row = self.axis_index(z[a]);
            let col = self.axis_index(z[b]);
            let out_of_plane: f64 = z
                .iter()
                .enumerate()
                .filter(|(k, _)| *k != a && *k != b)
                .map(|(_, zk)| zk * zk)
                .sum();
            let distance = ((z[a] - self.cell_center(row)).powi(2)
                + (z[b] - self.cell_center(col)).powi(2)
                + out_of_plane)
                .sqrt();
            (
                pair * self.density * self.density + row * self.density + col,
                distance,
            )
        };

        let closer = match &self.cells[slot] {
            Some(cell) => distance < cell.distance,
            None => true,
        };
        if closer {
            self.cells[slot] = Some(Cell {
                point: solution.clone(),
                residual,
                distance,
            });
        }
        closer
    }

    /// Number of cells per axis
    pub fn density(&self) -> usize {
        self.density
    }

    /// The parameter pairs spanning the cross sections; empty for a single parameter
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Number of 2-D grids held; zero for a single parameter
    pub fn cross_sections(&self) -> usize {
        self.pairs.len()
    }

    /// Number of samples offered to [ParameterSpace::record]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Number of occupied cells
    pub fn filled(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_some()).count()
    }

    pub fn cells(&self) -> &[Option<Cell>] {
        &self.cells
    }

    /// A cell of the 1-D grid of a single-parameter problem
    pub fn cell_1d(&self, index: usize) -> Option<&Cell> {
        if !self.pairs.is_empty() || index >= self.density {
            return None;
        }
        self.cells[index].as_ref()
    }

    /// A cell of the cross section `pair`
    pub fn cell(&self, pair: usize, row: usize, col: usize) -> Option<&Cell> {
        if pair >= self.pairs.len() || row >= self.density || col >= self.density {
            return None;
        }
        self.cells[pair * self.density * self.density + row * self.density + col].as_ref()
    }

    /// Residuals of the 1-D grid, NaN where no sample landed
    pub fn residual_line(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.density, |i| {
            self.cell_1d(i).map_or(f64::NAN, |cell| cell.residual)
        })
    }

    /// Residuals of cross section `pair`, NaN where no sample landed
    pub fn residual_grid(&self, pair: usize) -> Array2<f64> {
        Array2::from_shape_fn((self.density, self.density), |(row, col)| {
            self.cell(pair, row, col)
                .map_or(f64::NAN, |cell| cell.residual)
        })
    }

    /// Value of parameter `parameter` at the center of grid index `index`
    pub fn axis_value(&self, parameter: usize, index: usize) -> f64 {
        let (lower, upper) = self.bounds.as_slice()[parameter];
        lower + (upper - lower) * (self.cell_center(index) + 0.5)
    }

    fn normalize(&self, solution: &Solution) -> Array1<f64> {
        (solution - &self.bounds.center()) / &self.bounds.ranges()
    }

    fn axis_index(&self, z: f64) -> usize {
        let scaled = ((z + 0.5) * (self.density - 1) as f64).round();
        scaled.clamp(0.0, (self.density - 1) as f64) as usize
    }

    fn cell_center(&self, index: usize) -> f64 {
        index as f64 / (self.density - 1) as f64 - 0.5
    }
}

/// The pair of parameters deviating least from the center
///
/// The point is projected onto the cross section spanned by these two parameters; the
/// remaining deviations make up its out-of-plane distance.
fn closest_pair(z: &Array1<f64>) -> (usize, usize) {
    let mut order: Vec<usize> = (0..z.len()).collect();
    order.sort_by(|&a, &b| {
        z[a].abs()
            .partial_cmp(&z[b].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    let (a, b) = (order[0], order[1]);
    (a.min(b), a.max(b))
}

fn fit_density(n: usize, pairs: usize, requested: usize, memory_budget: usize) -> usize {
    let cell_bytes = (n + 2) * std::mem::size_of::<f64>();
    let footprint = |density: usize| {
        if n == 1 {
            density * cell_bytes
        } else {
            density * density * pairs * cell_bytes
        }
    };
    let mut density = requested.max(MIN_DENSITY);
    while density > MIN_DENSITY && footprint(density) > memory_budget {
        density -= 1;
    }
    if density < requested {
        tracing::debug!(
            "Parameter space density lowered from {} to {} to fit {} bytes",
            requested,
            density,
            memory_budget
        );
    }
    density
}
