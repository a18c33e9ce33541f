//! Run orchestration: configuration, pool lifetime, solver driving, result packaging.
//!
//! A [`ParallelMinimizer`] holds everything needed to start a run. Each call to
//! [`ParallelMinimizer::minimize`] creates a fresh [`ParallelEvaluator`] (and
//! with it a fresh worker pool, cache and log), hands it to the
//! [`QuasiNewtonSolver`] as its gradient source, and drops it when the run ends,
//! whichever way it ends.

use std::sync::Arc;

use crate::error::{BoxError, OptimError, Result};
use crate::evaluator::ParallelEvaluator;
use crate::lbfgsb::{Iterate, QuasiNewtonSolver};
use crate::types::{
    validate_bounds, Bounds, CallbackFn, GradientFn, ObjectiveFn, ParallelOptions, RunResult,
    SolverOptions, Timing,
};

/// Builder and driver for a parallel L-BFGS-B run.
///
/// # Example
///
/// ```
/// use optim_parallel::ParallelMinimizer;
///
/// let result = ParallelMinimizer::from_fn(
///     |x: &[f64]| (x[0] - 2.0).powi(2) + (x[1] + 1.0).powi(2),
///     vec![0.0, 0.0],
///     vec![(-5.0, 5.0), (0.0, 5.0)],
/// )
/// .max_workers(2)
/// .minimize()
/// .unwrap();
///
/// assert!(result.success);
/// assert!((result.x[0] - 2.0).abs() < 1e-4);
/// assert_eq!(result.x[1], 0.0);
/// ```
#[derive(Clone)]
pub struct ParallelMinimizer {
    objective: Arc<ObjectiveFn>,
    gradient: Option<Arc<GradientFn>>,
    x0: Vec<f64>,
    bounds: Bounds,
    options: ParallelOptions,
    solver_options: SolverOptions,
    callback: Option<Arc<CallbackFn>>,
}

impl ParallelMinimizer {
    /// Start from a fallible objective.
    pub fn new(
        objective: impl Fn(&[f64]) -> std::result::Result<f64, BoxError> + Send + Sync + 'static,
        x0: Vec<f64>,
        bounds: Bounds,
    ) -> Self {
        Self {
            objective: Arc::new(objective),
            gradient: None,
            x0,
            bounds,
            options: ParallelOptions::default(),
            solver_options: SolverOptions::default(),
            callback: None,
        }
    }

    /// Start from an objective that cannot fail.
    pub fn from_fn(
        objective: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
        x0: Vec<f64>,
        bounds: Bounds,
    ) -> Self {
        Self::new(move |x: &[f64]| Ok(objective(x)), x0, bounds)
    }

    /// Use an analytic gradient instead of finite differences.
    pub fn gradient(
        mut self,
        gradient: impl Fn(&[f64]) -> std::result::Result<Vec<f64>, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.gradient = Some(Arc::new(gradient));
        self
    }

    pub fn options(mut self, options: ParallelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn solver_options(mut self, options: SolverOptions) -> Self {
        self.solver_options = options;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.options.max_workers = Some(workers);
        self
    }

    pub fn forward(mut self, forward: bool) -> Self {
        self.options.forward = forward;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.options.verbose = verbose;
        self
    }

    pub fn loginfo(mut self, loginfo: bool) -> Self {
        self.options.loginfo = loginfo;
        self
    }

    pub fn time(mut self, time: bool) -> Self {
        self.options.time = time;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.options.parallel = parallel;
        self
    }

    /// Called after each iteration with `(x, f, nfev, nit)`; return `true` to stop.
    pub fn callback(
        mut self,
        callback: impl Fn(&[f64], f64, usize, usize) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Check every input before any thread is started or objective called.
    pub fn validate(&self) -> Result<()> {
        validate_bounds(&self.bounds)?;
        if self.x0.len() != self.bounds.len() {
            return Err(OptimError::InvalidArgs(format!(
                "x0 has dimension {}, bounds have {}",
                self.x0.len(),
                self.bounds.len()
            )));
        }
        if let Some(i) = self.x0.iter().position(|v| !v.is_finite()) {
            return Err(OptimError::InvalidArgs(format!("x0[{i}] is not finite")));
        }
        self.options.validate()?;
        self.solver_options.validate()
    }

    /// Run the optimization.
    ///
    /// # Errors
    /// - `InvalidArgs` / `InvalidBounds` for inconsistent inputs.
    /// - `Pool` if the worker pool cannot start or a worker panics.
    /// - `Objective` if the objective (or gradient) fails; the error names the point.
    /// - `Domain` if a requested point cannot be evaluated inside the bounds.
    ///
    /// Non-convergence is not an error: see [`RunResult::status`].
    pub fn minimize(&self) -> Result<RunResult> {
        self.validate()?;

        let mut evaluator = ParallelEvaluator::new(
            Arc::clone(&self.objective),
            self.gradient.clone(),
            self.bounds.clone(),
            &self.options,
        )?;

        tracing::debug!(
            dim = self.x0.len(),
            workers = evaluator.workers(),
            parallel = evaluator.is_parallel(),
            mode = ?self.options.mode(),
            analytic_gradient = self.gradient.is_some(),
            "starting run"
        );

        let verbose = self.options.verbose;
        let callback = self.callback.as_deref();
        let observer = |it: &Iterate<'_>| {
            if verbose {
                tracing::info!(nit = it.nit, fun = it.fun, pg_norm = it.pg_norm, nfev = it.nfev);
            } else {
                tracing::debug!(nit = it.nit, fun = it.fun, pg_norm = it.pg_norm, nfev = it.nfev);
            }
            callback.is_some_and(|cb| cb(it.x, it.fun, it.nfev, it.nit))
        };

        let solver = QuasiNewtonSolver::new(self.solver_options.clone());
        let outcome = match solver.minimize(&mut evaluator, &self.x0, &self.bounds, observer) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "run failed");
                return Err(e);
            }
        };

        let nfev = evaluator.nfev();
        let timing = self
            .options
            .time
            .then(|| Timing::new(evaluator.elapsed(), nfev));
        let log = evaluator.take_log();

        let result = RunResult {
            success: outcome.status.is_success(),
            message: outcome.status.to_string(),
            status: outcome.status,
            x: outcome.x,
            fun: outcome.fun,
            jac: outcome.jac,
            nfev,
            njev: evaluator.njev(),
            nit: outcome.nit,
            log,
            timing,
        };

        if verbose {
            tracing::info!(
                status = %result.message,
                fun = result.fun,
                nit = result.nit,
                nfev = result.nfev,
                cache_hits = evaluator.cache().hits(),
                "run finished"
            );
        }
        Ok(result)
    }
}

/// Minimize `objective` from `x0` within `bounds` with the given options.
///
/// Shorthand for [`ParallelMinimizer::new`] followed by [`ParallelMinimizer::minimize`].
pub fn minimize_parallel(
    objective: impl Fn(&[f64]) -> std::result::Result<f64, BoxError> + Send + Sync + 'static,
    x0: Vec<f64>,
    bounds: Bounds,
    options: ParallelOptions,
) -> Result<RunResult> {
    ParallelMinimizer::new(objective, x0, bounds)
        .options(options)
        .minimize()
}
