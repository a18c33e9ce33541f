//! Projected limited-memory BFGS for simple bound constraints.
//!
//! The solver never calls the objective directly. Every value and gradient it
//! needs comes from a [`GradientSource`], which is where the parallel
//! evaluation layer plugs in. Each iteration:
//!
//! 1. Stop if the projected gradient infinity-norm is `<= pgtol`.
//! 2. Two-loop recursion over the stored `(s, y)` pairs gives a direction;
//!    components that push an active variable further out of its box are zeroed.
//! 3. Backtracking (Armijo) search along the projected path `P(x + t d)`.
//! 4. Store the new correction pair if it has positive curvature.
//! 5. Stop if the relative reduction in `f` is `<= ftol`.
//!
//! A failed line search with a non-empty history drops the history and retries
//! from steepest descent once before giving up.

use std::collections::VecDeque;

use crate::error::{Result, ReturnCode};
use crate::types::SolverOptions;

/// Sufficient-decrease constant of the Armijo test.
const ARMIJO_C1: f64 = 1e-4;

/// Backtracking factor applied after a rejected trial step.
const BACKTRACK: f64 = 0.5;

/// Anything that can produce `(f(x), ∇f(x))` for the solver.
pub trait GradientSource {
    /// Objective value and gradient at `x`.
    fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)>;

    /// Number of objective evaluations spent so far (used for the `max_fun` limit).
    fn nfev(&self) -> usize;

    /// Upper bound on the objective evaluations one `evaluate` call can spend
    /// at a point of dimension `dim`.
    fn request_cost(&self, _dim: usize) -> usize {
        1
    }
}

/// Snapshot handed to the per-iteration observer.
#[derive(Debug, Clone, Copy)]
pub struct Iterate<'a> {
    pub x: &'a [f64],
    pub fun: f64,
    /// Infinity-norm of the projected gradient at `x`.
    pub pg_norm: f64,
    pub nit: usize,
    pub nfev: usize,
}

/// Final state of the solver.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub x: Vec<f64>,
    pub fun: f64,
    pub jac: Vec<f64>,
    pub nit: usize,
    pub status: ReturnCode,
}

/// Bound-constrained quasi-Newton solver.
#[derive(Debug, Clone, Default)]
pub struct QuasiNewtonSolver {
    options: SolverOptions,
}

/// Correction pairs `s = x_{k+1} - x_k`, `y = g_{k+1} - g_k`, oldest first.
struct History {
    pairs: VecDeque<(Vec<f64>, Vec<f64>, f64)>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            pairs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Store a pair if its curvature `s'y` is safely positive.
    fn push(&mut self, s: Vec<f64>, y: Vec<f64>) {
        let sy = dot(&s, &y);
        let yy = dot(&y, &y);
        if !(sy > f64::EPSILON * yy) || !sy.is_finite() {
            return;
        }
        if self.pairs.len() == self.capacity {
            self.pairs.pop_front();
        }
        self.pairs.push_back((s, y, 1.0 / sy));
    }

    /// `-H g` by the two-loop recursion, with `H0 = (s'y / y'y) I`.
    fn direction(&self, grad: &[f64]) -> Vec<f64> {
        let mut q = grad.to_vec();
        let mut alpha = vec![0.0; self.pairs.len()];
        for (i, (s, y, rho)) in self.pairs.iter().enumerate().rev() {
            alpha[i] = rho * dot(s, &q);
            axpy(-alpha[i], y, &mut q);
        }
        if let Some((s, y, _)) = self.pairs.back() {
            let gamma = dot(s, y) / dot(y, y);
            q.iter_mut().for_each(|v| *v *= gamma);
        }
        for (i, (s, y, rho)) in self.pairs.iter().enumerate() {
            let beta = rho * dot(y, &q);
            axpy(alpha[i] - beta, s, &mut q);
        }
        q.iter_mut().for_each(|v| *v = -*v);
        q
    }
}

impl QuasiNewtonSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    /// Minimize from `x0` (projected into `bounds` first).
    ///
    /// `observer` runs after every accepted iteration; returning `true` stops
    /// the run with [`ReturnCode::ForcedStop`].
    ///
    /// A line-search trial is only requested while its worst-case cost
    /// ([`GradientSource::request_cost`]) still fits in `max_fun`. The request
    /// at the starting point is always made.
    ///
    /// # Errors
    /// Only errors raised by `source` are returned; every non-converged ending
    /// is reported through [`SolverOutcome::status`].
    pub fn minimize<S, F>(
        &self,
        source: &mut S,
        x0: &[f64],
        bounds: &[(f64, f64)],
        mut observer: F,
    ) -> Result<SolverOutcome>
    where
        S: GradientSource + ?Sized,
        F: FnMut(&Iterate<'_>) -> bool,
    {
        let opts = &self.options;
        let mut x = project(x0, bounds);
        let (mut f, mut g) = source.evaluate(&x)?;
        let mut nit = 0;
        let mut history = History::new(opts.m);

        let finish = |x, fun, jac, nit, status| -> Result<SolverOutcome> {
            Ok(SolverOutcome { x, fun, jac, nit, status })
        };

        if !f.is_finite() || g.iter().any(|v| !v.is_finite()) {
            return finish(x, f, g, nit, ReturnCode::AbnormalTermination);
        }

        loop {
            let pg_norm = projected_gradient_norm(&x, &g, bounds);
            if pg_norm <= opts.pgtol {
                return finish(x, f, g, nit, ReturnCode::ConvergedPgtol);
            }
            if nit >= opts.max_iter {
                return finish(x, f, g, nit, ReturnCode::MaxIterExceeded);
            }

            let mut d = feasible_direction(&x, history.direction(&g), bounds);
            let mut slope = dot(&g, &d);
            if !(slope < 0.0) {
                history.clear();
                d = feasible_direction(&x, g.iter().map(|v| -v).collect(), bounds);
                slope = dot(&g, &d);
                if !(slope < 0.0) {
                    return finish(x, f, g, nit, ReturnCode::AbnormalTermination);
                }
            }

            let t0 = if history.is_empty() {
                (1.0 / norm(&d)).min(1.0)
            } else {
                1.0
            };

            let accepted = match self.line_search(source, &x, f, &g, &d, t0, bounds)? {
                Search::Accepted(point) => point,
                Search::Exhausted if !history.is_empty() => {
                    tracing::debug!(nit, "line search failed, resetting history");
                    history.clear();
                    continue;
                }
                Search::Exhausted => return finish(x, f, g, nit, ReturnCode::LineSearchFailed),
                Search::Budget => return finish(x, f, g, nit, ReturnCode::MaxFunExceeded),
            };
            let (x_new, f_new, g_new) = accepted;

            if g_new.iter().any(|v| !v.is_finite()) {
                return finish(x_new, f_new, g_new, nit + 1, ReturnCode::AbnormalTermination);
            }

            let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            history.push(s, y);

            let reduction = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);
            x = x_new;
            f = f_new;
            g = g_new;
            nit += 1;

            let snapshot = Iterate {
                x: &x,
                fun: f,
                pg_norm: projected_gradient_norm(&x, &g, bounds),
                nit,
                nfev: source.nfev(),
            };
            if observer(&snapshot) {
                return finish(x, f, g, nit, ReturnCode::ForcedStop);
            }
            if reduction <= opts.ftol {
                return finish(x, f, g, nit, ReturnCode::ConvergedFtol);
            }
        }
    }

    /// Backtrack along `P(x + t d)` until the Armijo condition holds.
    #[allow(clippy::too_many_arguments)]
    fn line_search<S: GradientSource + ?Sized>(
        &self,
        source: &mut S,
        x: &[f64],
        f: f64,
        g: &[f64],
        d: &[f64],
        t0: f64,
        bounds: &[(f64, f64)],
    ) -> Result<Search> {
        let mut t = t0;
        for _ in 0..self.options.max_ls {
            let trial: Vec<f64> = x
                .iter()
                .zip(d)
                .zip(bounds)
                .map(|((&xi, &di), &(lo, hi))| (xi + t * di).clamp(lo, hi))
                .collect();
            if trial == x {
                return Ok(Search::Exhausted);
            }
            if source.nfev() + source.request_cost(x.len()) > self.options.max_fun {
                return Ok(Search::Budget);
            }

            let (f_trial, g_trial) = source.evaluate(&trial)?;
            let moved: f64 = g
                .iter()
                .zip(trial.iter().zip(x))
                .map(|(gi, (a, b))| gi * (a - b))
                .sum();
            if f_trial <= f + ARMIJO_C1 * moved {
                return Ok(Search::Accepted((trial, f_trial, g_trial)));
            }
            t *= BACKTRACK;
        }
        Ok(Search::Exhausted)
    }
}

enum Search {
    Accepted((Vec<f64>, f64, Vec<f64>)),
    Exhausted,
    Budget,
}

fn project(x: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    x.iter()
        .zip(bounds)
        .map(|(&v, &(lo, hi))| v.clamp(lo, hi))
        .collect()
}

/// Zero direction components that would leave the box from an active bound.
fn feasible_direction(x: &[f64], mut d: Vec<f64>, bounds: &[(f64, f64)]) -> Vec<f64> {
    for ((di, &xi), &(lo, hi)) in d.iter_mut().zip(x).zip(bounds) {
        if (xi <= lo && *di < 0.0) || (xi >= hi && *di > 0.0) {
            *di = 0.0;
        }
    }
    d
}

/// Infinity-norm of `P(x - g) - x`.
pub fn projected_gradient_norm(x: &[f64], g: &[f64], bounds: &[(f64, f64)]) -> f64 {
    x.iter()
        .zip(g)
        .zip(bounds)
        .map(|((&xi, &gi), &(lo, hi))| ((xi - gi).clamp(lo, hi) - xi).abs())
        .fold(0.0, f64::max)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimError;

    /// Serial source over a closure returning `(f, grad)`, counting calls.
    struct FnSource<F> {
        f: F,
        calls: usize,
    }

    impl<F: FnMut(&[f64]) -> (f64, Vec<f64>)> GradientSource for FnSource<F> {
        fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
            self.calls += 1;
            Ok((self.f)(x))
        }
        fn nfev(&self) -> usize {
            self.calls
        }
    }

    fn rosenbrock(x: &[f64]) -> (f64, Vec<f64>) {
        let (a, b) = (x[0], x[1]);
        let f = 100.0 * (b - a * a).powi(2) + (1.0 - a).powi(2);
        let g = vec![
            -400.0 * a * (b - a * a) - 2.0 * (1.0 - a),
            200.0 * (b - a * a),
        ];
        (f, g)
    }

    #[test]
    fn test_rosenbrock_unbounded() {
        let mut source = FnSource { f: rosenbrock, calls: 0 };
        let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); 2];
        let out = QuasiNewtonSolver::default()
            .minimize(&mut source, &[-1.2, 1.0], &bounds, |_| false)
            .unwrap();
        assert!(out.status.is_success(), "{:?}", out.status);
        assert!((out.x[0] - 1.0).abs() < 1e-3, "{:?}", out.x);
        assert!((out.x[1] - 1.0).abs() < 1e-3, "{:?}", out.x);
    }

    #[test]
    fn test_active_bound() {
        // Minimum of (x - 3)^2 + (y + 1)^2 restricted to x <= 2, y >= 0 is (2, 0).
        let mut source = FnSource {
            f: |x: &[f64]| {
                let f = (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2);
                (f, vec![2.0 * (x[0] - 3.0), 2.0 * (x[1] + 1.0)])
            },
            calls: 0,
        };
        let bounds = vec![(f64::NEG_INFINITY, 2.0), (0.0, f64::INFINITY)];
        let out = QuasiNewtonSolver::default()
            .minimize(&mut source, &[0.0, 5.0], &bounds, |_| false)
            .unwrap();
        assert_eq!(out.status, ReturnCode::ConvergedPgtol);
        assert_eq!(out.x, vec![2.0, 0.0]);
    }

    #[test]
    fn test_start_is_projected() {
        let mut seen = Vec::new();
        let mut source = FnSource {
            f: |x: &[f64]| {
                seen.push(x.to_vec());
                (x[0] * x[0], vec![2.0 * x[0]])
            },
            calls: 0,
        };
        let out = QuasiNewtonSolver::default()
            .minimize(&mut source, &[10.0], &[(1.0, 4.0)], |_| false)
            .unwrap();
        assert_eq!(out.x, vec![1.0]);
        drop(source);
        assert_eq!(seen[0], vec![4.0]);
        assert!(seen.iter().all(|p| p[0] >= 1.0 && p[0] <= 4.0));
    }

    #[test]
    fn test_max_iter() {
        let mut source = FnSource { f: rosenbrock, calls: 0 };
        let solver = QuasiNewtonSolver::new(SolverOptions {
            max_iter: 2,
            ..Default::default()
        });
        let out = solver
            .minimize(&mut source, &[-1.2, 1.0], &[(-5.0, 5.0); 2], |_| false)
            .unwrap();
        assert_eq!(out.status, ReturnCode::MaxIterExceeded);
        assert_eq!(out.nit, 2);
    }

    #[test]
    fn test_max_fun() {
        let mut source = FnSource { f: rosenbrock, calls: 0 };
        let solver = QuasiNewtonSolver::new(SolverOptions {
            max_fun: 5,
            ..Default::default()
        });
        let out = solver
            .minimize(&mut source, &[-1.2, 1.0], &[(-5.0, 5.0); 2], |_| false)
            .unwrap();
        assert_eq!(out.status, ReturnCode::MaxFunExceeded);
        assert!(source.calls <= 5);
    }

    #[test]
    fn test_observer_forces_stop() {
        let mut source = FnSource { f: rosenbrock, calls: 0 };
        let mut iterations = Vec::new();
        let out = QuasiNewtonSolver::default()
            .minimize(&mut source, &[-1.2, 1.0], &[(-5.0, 5.0); 2], |it| {
                iterations.push(it.nit);
                it.nit == 3
            })
            .unwrap();
        assert_eq!(out.status, ReturnCode::ForcedStop);
        assert_eq!(out.nit, 3);
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[test]
    fn test_source_errors_propagate() {
        struct Failing;
        impl GradientSource for Failing {
            fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
                Err(OptimError::Objective {
                    point: x.to_vec(),
                    source: "nope".into(),
                })
            }
            fn nfev(&self) -> usize {
                0
            }
        }
        let err = QuasiNewtonSolver::default()
            .minimize(&mut Failing, &[0.0], &[(-1.0, 1.0)], |_| false)
            .unwrap_err();
        assert!(matches!(err, OptimError::Objective { .. }));
    }

    #[test]
    fn test_non_finite_start_is_abnormal() {
        let mut source = FnSource {
            f: |_: &[f64]| (f64::INFINITY, vec![0.0]),
            calls: 0,
        };
        let out = QuasiNewtonSolver::default()
            .minimize(&mut source, &[0.0], &[(-1.0, 1.0)], |_| false)
            .unwrap();
        assert_eq!(out.status, ReturnCode::AbnormalTermination);
    }

    #[test]
    fn test_projected_gradient_norm() {
        let bounds = vec![(0.0, 1.0), (0.0, 1.0)];
        // At the lower bound with positive gradient, the first component is blocked.
        assert_eq!(projected_gradient_norm(&[0.0, 0.5], &[3.0, 0.25], &bounds), 0.25);
        // Step is truncated by the box.
        assert_eq!(projected_gradient_norm(&[0.5, 0.5], &[-2.0, 0.0], &bounds), 0.5);
    }
}
