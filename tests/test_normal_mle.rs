//! Maximum-likelihood fit of a normal distribution.
//!
//! The sample is drawn from N(5, 2²) with a seeded generator and rescaled so
//! its mean is 5 and its (population) standard deviation is 2, which makes the
//! MLE exactly `(μ, σ) = (5, 2)`. The fit runs
//! from `(1, 1)` with `σ` bounded below, sequentially and on three workers, in
//! both difference modes.

use optim_parallel::{minimize_parallel, ParallelMinimizer, ParallelOptions, RunResult};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256Plus;

const MU: f64 = 5.0;
const SIGMA: f64 = 2.0;

// ─────────────────────────────────────────────────────────────────────────────
// Data and likelihood
// ─────────────────────────────────────────────────────────────────────────────

/// Seeded normal draws, re-standardised to mean `MU` and population
/// standard deviation `SIGMA` so the MLE is exact.
fn sample(n: usize) -> Vec<f64> {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let normal = Normal::new(MU, SIGMA).unwrap();
    let raw: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let mean = raw.iter().sum::<f64>() / n as f64;
    let var = raw.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n as f64;
    let sd = var.sqrt();
    raw.iter().map(|u| MU + SIGMA * (u - mean) / sd).collect()
}

/// Negative log-likelihood of `data` under `N(x[0], x[1]²)`, up to a constant.
fn negll(data: &[f64], x: &[f64]) -> f64 {
    let (mu, sigma) = (x[0], x[1]);
    let n = data.len() as f64;
    let ss: f64 = data.iter().map(|d| (d - mu).powi(2)).sum();
    n * sigma.ln() + ss / (2.0 * sigma * sigma)
}

fn bounds() -> Vec<(f64, f64)> {
    vec![(f64::NEG_INFINITY, f64::INFINITY), (0.0001, f64::INFINITY)]
}

fn fit(parallel: bool, workers: usize, forward: bool) -> RunResult {
    let data = sample(200);
    ParallelMinimizer::from_fn(move |x: &[f64]| negll(&data, x), vec![1.0, 1.0], bounds())
        .options(ParallelOptions {
            max_workers: Some(workers),
            forward,
            parallel,
            ..Default::default()
        })
        .minimize()
        .unwrap()
}

fn assert_near_mle(result: &RunResult, label: &str) {
    assert!(
        (result.x[0] - MU).abs() < 1e-4,
        "{}: mu = {:.10}, expected {}",
        label,
        result.x[0],
        MU
    );
    assert!(
        (result.x[1] - SIGMA).abs() < 1e-4,
        "{}: sigma = {:.10}, expected {}",
        label,
        result.x[1],
        SIGMA
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_sample_moments() {
    let data = sample(200);
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let sd = (data.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / data.len() as f64).sqrt();
    assert!((mean - MU).abs() < 1e-12);
    assert!((sd - SIGMA).abs() < 1e-12);
}

#[test]
fn test_normal_mle_forward_serial_vs_three_workers() {
    let serial = fit(false, 1, true);
    let parallel = fit(true, 3, true);

    assert_near_mle(&serial, "serial");
    assert_near_mle(&parallel, "parallel");
    assert_eq!(serial.x, parallel.x, "serial and parallel fits differ");
    assert_eq!(serial.fun.to_bits(), parallel.fun.to_bits());
    assert_eq!(serial.nfev, parallel.nfev);
    assert_eq!(serial.nit, parallel.nit);
}

#[test]
fn test_normal_mle_central_serial_vs_three_workers() {
    let serial = fit(false, 1, false);
    let parallel = fit(true, 3, false);

    assert_near_mle(&serial, "serial_central");
    assert_near_mle(&parallel, "parallel_central");
    assert_eq!(serial.x, parallel.x, "serial and parallel fits differ");
    assert_eq!(serial.jac, parallel.jac);
}

#[test]
fn test_normal_mle_sigma_stays_in_bounds() {
    let data = sample(200);
    let result = minimize_parallel(
        move |x: &[f64]| {
            if x[1] < 0.0001 {
                return Err(format!("sigma {} below lower bound", x[1]).into());
            }
            Ok(negll(&data, x))
        },
        vec![1.0, 1.0],
        bounds(),
        ParallelOptions {
            max_workers: Some(3),
            loginfo: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert_near_mle(&result, "guarded");
    let log = result.log.unwrap();
    assert!(log.points().iter().all(|p| p[1] >= 0.0001));
}
