use std::convert::Infallible;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use dram_mimo::{
    estimate_densities, propagate_intervals, Calibration, ChainSampler, Dataset, DramSettings,
    ModelFunc, ModelSpec, NoCheckpoint, Parameters, RunStart,
};
use rand::SeedableRng;

struct Linear;

impl ModelFunc for Linear {
    type Extra = ();
    type Error = Infallible;

    fn response(&self, params: &[f64], xdata: &[f64], _extra: &()) -> Result<Vec<f64>, Infallible> {
        Ok(xdata.iter().map(|x| params[0] * x + params[1]).collect())
    }
}

fn calibration(num_sets: usize, num_points: usize) -> Calibration<Linear> {
    let x: Vec<f64> = (0..num_points).map(|i| i as f64 / num_points as f64).collect();
    let datasets = (0..num_sets)
        .map(|s| {
            let slope = 0.8 + 0.4 * s as f64;
            let y = x
                .iter()
                .enumerate()
                .map(|(i, x)| slope * x * (1. + 0.05 * ((13 * i + s) as f64).sin()))
                .collect();
            Dataset::new(x.clone(), y)
        })
        .collect();
    let models = (0..num_sets).map(|_| ModelSpec::new(Linear, ())).collect();
    Calibration::new(datasets, models).unwrap()
}

fn sampler(num_sets: usize, num_iterations: usize) -> ChainSampler<Linear> {
    let settings = DramSettings {
        num_iterations,
        checkpoint_every: None,
        display_every: None,
        ..Default::default()
    };
    ChainSampler::new(calibration(num_sets, 101), Parameters::new(vec![1.0, 0.01]), settings).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    for num_sets in [1, 2] {
        let sampler = sampler(num_sets, 1000);
        c.bench_function(&format!("chain 1000 iterations, {} datasets", num_sets), |b| {
            b.iter(|| {
                sampler
                    .sample_seeded(black_box(RunStart::default()), &mut NoCheckpoint)
                    .unwrap()
            })
        });
    }

    let sampler = sampler(2, 2000);
    let chain = sampler
        .sample_seeded(RunStart::default(), &mut NoCheckpoint)
        .unwrap()
        .chain
        .burn_in(500)
        .unwrap();

    c.bench_function("densities 1500 rows", |b| {
        b.iter(|| estimate_densities(black_box(&chain)).unwrap())
    });

    c.bench_function("intervals 500 samples", |b| {
        b.iter_batched(
            || rand::rngs::StdRng::seed_from_u64(42),
            |mut rng| propagate_intervals(&mut rng, sampler.calibration(), &chain, 500).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
