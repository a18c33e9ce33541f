//! The objective is never called outside the box.
//!
//! Each objective here records every point it sees and returns an error for
//! any point outside the bounds, so a single out-of-box perturbation fails the
//! run. Covers points sitting on a bound, boxes narrower than the
//! finite-difference step, and fixed dimensions (`lo == hi`).

use std::sync::{Arc, Mutex};

use optim_parallel::{BoxError, ParallelMinimizer, ParallelOptions};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

type Seen = Arc<Mutex<Vec<Vec<f64>>>>;

/// Wrap `func` so that it rejects out-of-box points and records every call.
fn guarded(
    func: fn(&[f64]) -> f64,
    bounds: Vec<(f64, f64)>,
) -> (
    impl Fn(&[f64]) -> Result<f64, BoxError> + Send + Sync + 'static,
    Seen,
) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let objective = move |x: &[f64]| -> Result<f64, BoxError> {
        sink.lock().unwrap().push(x.to_vec());
        for (i, (&xi, &(lo, hi))) in x.iter().zip(&bounds).enumerate() {
            if xi < lo || xi > hi {
                return Err(format!("x[{i}] = {xi:e} outside [{lo:e}, {hi:e}]").into());
            }
        }
        Ok(func(x))
    };
    (objective, seen)
}

fn run_guarded(
    func: fn(&[f64]) -> f64,
    x0: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    forward: bool,
) -> (optim_parallel::RunResult, Vec<Vec<f64>>) {
    let (objective, seen) = guarded(func, bounds.clone());
    let result = ParallelMinimizer::new(objective, x0, bounds)
        .options(ParallelOptions {
            max_workers: Some(3),
            forward,
            ..Default::default()
        })
        .minimize()
        .unwrap();
    let seen = seen.lock().unwrap().clone();
    (result, seen)
}

fn linear(x: &[f64]) -> f64 {
    x.iter().enumerate().map(|(i, &xi)| (i as f64 + 1.0) * xi).sum()
}

fn sphere_shifted(x: &[f64]) -> f64 {
    x.iter().map(|&xi| (xi - 3.0).powi(2)).sum()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_start_on_upper_bound() {
    // Minimum outside the box, start on the bound the minimum is beyond.
    let bounds = vec![(-1.0, 1.0); 3];
    for forward in [true, false] {
        let (result, seen) = run_guarded(sphere_shifted, vec![1.0; 3], bounds.clone(), forward);
        assert!(result.success, "forward={forward}: {result}");
        assert_eq!(result.x, vec![1.0; 3]);
        assert!(!seen.is_empty());
    }
}

#[test]
fn test_solution_on_lower_bound() {
    // Linear objective drives every coordinate to its lower bound.
    let bounds = vec![(-2.0, 2.0); 4];
    for forward in [true, false] {
        let (result, _) = run_guarded(linear, vec![0.5; 4], bounds.clone(), forward);
        assert!(result.success, "forward={forward}: {result}");
        for (i, &xi) in result.x.iter().enumerate() {
            assert_eq!(xi, -2.0, "forward={forward}: x[{i}] not at lower bound");
        }
    }
}

#[test]
fn test_box_narrower_than_step() {
    // Width 2e-9 is far below the default forward step (~1.5e-8).
    let bounds = vec![(1.0 - 1e-9, 1.0 + 1e-9), (-1.0, 1.0)];
    for forward in [true, false] {
        let (result, seen) = run_guarded(sphere_shifted, vec![1.0, 0.0], bounds.clone(), forward);
        assert!(result.x[0] >= bounds[0].0 && result.x[0] <= bounds[0].1);
        assert_eq!(result.x[1], 1.0, "forward={forward}");
        assert!(seen.iter().all(|p| p[0] >= bounds[0].0 && p[0] <= bounds[0].1));
    }
}

#[test]
fn test_fixed_dimension_never_perturbed() {
    let bounds = vec![(-5.0, 5.0), (0.25, 0.25), (-5.0, 5.0)];
    for forward in [true, false] {
        let (result, seen) = run_guarded(sphere_shifted, vec![0.0, 0.25, 0.0], bounds.clone(), forward);
        assert!(result.success, "forward={forward}: {result}");
        assert_eq!(result.jac[1], 0.0);
        assert!(seen.iter().all(|p| p[1] == 0.25));
        assert!((result.x[0] - 3.0).abs() < 1e-5);
        assert!((result.x[2] - 3.0).abs() < 1e-5);
    }
}

#[test]
fn test_every_logged_point_in_bounds() {
    let bounds = vec![(0.0, 1.0), (-1.0, 0.0)];
    let (objective, _) = guarded(sphere_shifted, bounds.clone());
    let result = ParallelMinimizer::new(objective, vec![0.0, 0.0], bounds.clone())
        .loginfo(true)
        .forward(false)
        .max_workers(2)
        .minimize()
        .unwrap();

    let log = result.log.unwrap();
    assert_eq!(log.len(), result.nfev);
    for point in log.points() {
        for (xi, (lo, hi)) in point.iter().zip(&bounds) {
            assert!(xi >= lo && xi <= hi, "{point:?} outside {bounds:?}");
        }
    }
}
