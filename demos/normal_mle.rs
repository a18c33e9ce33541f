//! Maximum-likelihood fit of a normal distribution with a parallel gradient.
//!
//! Run with: cargo run --example normal_mle
//!
//! Per-iteration progress is logged through `tracing`; control it with
//! `RUST_LOG`, e.g. `RUST_LOG=optim_parallel=debug`.

use optim_parallel::{ParallelMinimizer, ParallelOptions};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256Plus;
use tracing_subscriber::EnvFilter;

/// `n` draws from N(5, 2²) on a fixed seed.
fn sample(n: usize) -> Vec<f64> {
    let mut rng = Xoshiro256Plus::seed_from_u64(123_456_789);
    let normal = Normal::new(5.0, 2.0).expect("valid normal parameters");
    normal.sample_iter(&mut rng).take(n).collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data = sample(500);
    let negll = move |x: &[f64]| {
        let (mu, sigma) = (x[0], x[1]);
        let ss: f64 = data.iter().map(|d| (d - mu).powi(2)).sum();
        data.len() as f64 * sigma.ln() + ss / (2.0 * sigma * sigma)
    };

    let result = ParallelMinimizer::from_fn(
        negll,
        vec![1.0, 1.0],
        vec![(f64::NEG_INFINITY, f64::INFINITY), (0.0001, f64::INFINITY)],
    )
    .options(ParallelOptions {
        max_workers: Some(3),
        verbose: true,
        loginfo: true,
        time: true,
        ..Default::default()
    })
    .minimize();

    match result {
        Ok(result) => {
            println!("{result}");
            println!("mu    = {:.6}", result.x[0]);
            println!("sigma = {:.6}", result.x[1]);
            if let Some(log) = &result.log {
                println!("logged {} evaluations", log.len());
            }
        }
        Err(e) => {
            eprintln!("fit failed: {e}");
            std::process::exit(1);
        }
    }
}
