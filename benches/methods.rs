use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use diffrefine::prelude::*;
use diffrefine::routines::initialization::sobol;
use diffrefine::routines::strategy::cmaes::CmaStrategy;
use ndarray::Array1;

fn rosenbrock(x: &Solution) -> f64 {
    x.windows(2)
        .into_iter()
        .map(|w| 100.0 * (w[1] - w[0] * w[0]).powi(2) + (1.0 - w[0]).powi(2))
        .sum()
}

/// Benchmark the Sobol initialization routine using 1000 points in 10 dimensions
fn benchmark_sobol(c: &mut Criterion) {
    let bounds = Bounds::new(vec![(0.0, 1.0); 10]).unwrap();
    c.bench_function("sobol", |b| {
        b.iter(|| {
            let _ = sobol::generate(black_box(1000), black_box(&bounds), black_box(22));
        });
    });
}

/// One ask/tell cycle of the CMA-ES strategy in 8 dimensions
fn benchmark_cmaes_generation(c: &mut Criterion) {
    let bounds = Bounds::new(vec![(-2.0, 2.0); 8]).unwrap();
    let start = Array1::zeros(8);
    let mut strategy = CmaStrategy::new(&bounds, &start, 0.5, None, 22).unwrap();
    c.bench_function("cmaes_generation", |b| {
        b.iter(|| {
            let population = strategy.ask();
            let fitness: Vec<f64> = population
                .rows()
                .into_iter()
                .map(|row| rosenbrock(&strategy.solution(&row.to_owned())))
                .collect();
            strategy.tell(&population, black_box(&fitness)).unwrap();
        });
    });
}

/// Recording 10 000 samples into the cross sections of a 6-parameter space
fn benchmark_parameter_space(c: &mut Criterion) {
    let bounds = Bounds::new(vec![(0.0, 1.0); 6]).unwrap();
    let samples = sobol::generate(10_000, &bounds, 7);
    c.bench_function("parameter_space", |b| {
        b.iter(|| {
            let mut space = ParameterSpace::new(&bounds, 50, 64 * 1024 * 1024);
            for row in samples.rows() {
                let point = row.to_owned();
                let residual = rosenbrock(&point);
                space.record(black_box(&point), residual);
            }
            space.filled()
        });
    });
}

/// A full brute-force run over 3 parameters on the inline evaluator
fn benchmark_brute_force(c: &mut Criterion) {
    let model = FnRefinable::new(
        vec![(-2.0, 2.0); 3],
        Array1::zeros(3),
        rosenbrock as fn(&Solution) -> f64,
    );
    let bounds = Bounds::new(model.bounds()).unwrap();
    let evaluator = Arc::new(Evaluator::inline());
    c.bench_function("brute_force", |b| {
        b.iter(|| {
            let mut history = RefinementHistory::new();
            let mut context =
                RefineContext::new(&model, bounds.clone(), &mut history, evaluator.clone());
            let mut method = dispatch_method(1, &HashMap::new()).unwrap();
            method.run(&mut context).unwrap()
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(std::time::Duration::from_secs(10)) // Measure for 10 seconds
        .noise_threshold(0.10); // Performance changes less than 10% will be ignored
    targets = benchmark_sobol, benchmark_cmaes_generation, benchmark_parameter_space, benchmark_brute_force
}
criterion_main!(benches);
