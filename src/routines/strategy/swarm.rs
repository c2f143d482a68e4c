use ndarray::{Array1, Array2};
use rand::Rng;

use crate::error::{RefineError, Result};
use crate::routines::convergence::std_dev;
use crate::structs::bounds::{Bounds, Solution};

/// Coefficients of the velocity update
#[derive(Debug, Clone, Copy)]
pub struct PsoParams {
    /// Weight of the previous velocity
    pub inertia: f64,
    /// Pull toward the particle's own best position
    pub cognitive: f64,
    /// Pull toward the swarm's best position
    pub social: f64,
}

impl Default for PsoParams {
    fn default() -> Self {
        PsoParams {
            inertia: 0.7298,
            cognitive: 1.49618,
            social: 1.49618,
        }
    }
}

/// A particle swarm with personal and global bests
///
/// Positions are stored one particle per row and are kept inside the bounds after every move.
#[derive(Debug, Clone)]
pub struct Swarm {
    positions: Array2<f64>,
    velocities: Array2<f64>,
    personal: Array2<f64>,
    personal_fitness: Array1<f64>,
    fitness: Array1<f64>,
    best: Option<(Solution, f64)>,
}

impl Swarm {
    /// Create a swarm at `positions` with small random velocities
    pub fn new<R: Rng + ?Sized>(positions: Array2<f64>, bounds: &Bounds, rng: &mut R) -> Self {
        let ranges = bounds.ranges();
        let (particles, dimension) = positions.dim();
        let velocities = Array2::from_shape_fn((particles, dimension), |(_, j)| {
            rng.gen_range(-0.1..0.1) * ranges[j]
        });
        Swarm {
            personal: positions.clone(),
            positions,
            velocities,
            personal_fitness: Array1::from_elem(particles, f64::INFINITY),
            fitness: Array1::from_elem(particles, f64::INFINITY),
            best: None,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.nrows() == 0
    }

    /// Current particle positions, one per row
    pub fn positions(&self) -> &Array2<f64> {
        &self.positions
    }

    /// Fitness of the current positions
    pub fn fitness(&self) -> &Array1<f64> {
        &self.fitness
    }

    /// Best position ever visited by the swarm
    pub fn best(&self) -> Option<(&Solution, f64)> {
        self.best.as_ref().map(|(solution, fitness)| (solution, *fitness))
    }

    pub fn best_fitness(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |(_, f)| *f)
    }

    /// Spread of the current fitness values, ignoring non-finite entries
    pub fn fitness_std(&self) -> f64 {
        let finite: Vec<f64> = self.fitness.iter().copied().filter(|f| f.is_finite()).collect();
        std_dev(&finite)
    }

    /// Store the fitness of the current positions and update the bests
    pub fn tell(&mut self, fitness: &[f64]) -> Result<()> {
        if fitness.len() != self.len() {
            return Err(RefineError::DimensionMismatch {
                expected: self.len(),
                got: fitness.len(),
            });
        }
        for (i, &f) in fitness.iter().enumerate() {
            let f = if f.is_nan() { f64::INFINITY } else { f };
            self.fitness[i] = f;
            if f < self.personal_fitness[i] {
                self.personal_fitness[i] = f;
                self.personal.row_mut(i).assign(&self.positions.row(i));
            }
            if f < self.best_fitness() {
                self.best = Some((self.positions.row(i).to_owned(), f));
            }
        }
        Ok(())
    }

    /// Move every particle once
    pub fn step<R: Rng + ?Sized>(&mut self, bounds: &Bounds, params: &PsoParams, rng: &mut R) {
        let Some((global, _)) = self.best.clone() else {
            return;
        };
        let ranges = bounds.ranges();
        let (particles, dimension) = self.positions.dim();
        for i in 0..particles {
            for j in 0..dimension {
                let x = self.positions[[i, j]];
                let r1: f64 = rng.gen();
                let r2: f64 = rng.gen();
                let v = params.inertia * self.velocities[[i, j]]
                    + params.cognitive * r1 * (self.personal[[i, j]] - x)
                    + params.social * r2 * (global[j] - x);
                self.velocities[[i, j]] = v.clamp(-ranges[j], ranges[j]);
            }
            let mut moved = &self.positions.row(i) + &self.velocities.row(i);
            bounds.clip_inplace(&mut moved);
            self.positions.row_mut(i).assign(&moved);
        }
    }
}
