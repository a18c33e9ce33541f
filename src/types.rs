//! Core type definitions: objective signatures, options, diagnostics and results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BoxError, OptimError, Result, ReturnCode};

// ──────────────────────────────────────────────────────────────────────────────
// Type Aliases
// ──────────────────────────────────────────────────────────────────────────────

/// Bounds for each dimension: `Vec<(lower, upper)>`.
///
/// Use `f64::NEG_INFINITY` / `f64::INFINITY` for an unbounded side.
pub type Bounds = Vec<(f64, f64)>;

/// Objective function signature.
///
/// - `x`: point to evaluate (dimension p)
/// - Returns: the objective value, or an error describing why it could not be computed
///
/// The function must be safe to call concurrently from several worker threads.
/// Extra arguments are captured by the closure.
pub type ObjectiveFn = dyn Fn(&[f64]) -> std::result::Result<f64, BoxError> + Send + Sync;

/// Analytic gradient signature, same calling convention as [`ObjectiveFn`].
pub type GradientFn = dyn Fn(&[f64]) -> std::result::Result<Vec<f64>, BoxError> + Send + Sync;

/// Callback function for progress monitoring and early stopping.
///
/// Called after each accepted iteration with the current iterate.
/// - `x`: current point
/// - `fun`: current function value
/// - `nfev`: unique objective evaluations so far
/// - `nit`: iterations so far
/// - Returns: `true` to force stop, `false` to continue
pub type CallbackFn = dyn Fn(&[f64], f64, usize, usize) -> bool + Send + Sync;

/// Check that every `(low, high)` pair is ordered and free of NaN.
pub fn validate_bounds(bounds: &[(f64, f64)]) -> Result<()> {
    if bounds.is_empty() {
        return Err(OptimError::InvalidArgs("dimension must be >= 1".into()));
    }
    for (dim, &(lo, hi)) in bounds.iter().enumerate() {
        if lo.is_nan() || hi.is_nan() || lo > hi || lo == f64::INFINITY || hi == f64::NEG_INFINITY {
            return Err(OptimError::InvalidBounds { dim });
        }
    }
    Ok(())
}

/// Index of the first coordinate of `x` lying outside its bounds.
pub(crate) fn first_violation(x: &[f64], bounds: &[(f64, f64)]) -> Option<usize> {
    x.iter()
        .zip(bounds)
        .position(|(&xi, &(lo, hi))| !(lo <= xi && xi <= hi))
}

// ──────────────────────────────────────────────────────────────────────────────
// Options
// ──────────────────────────────────────────────────────────────────────────────

/// Finite-difference scheme used to approximate the gradient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DifferenceMode {
    /// One-sided `(f(x + h e_i) - f(x)) / h`, `1 + p` evaluations.
    #[default]
    Forward,
    /// Two-sided `(f(x + h e_i) - f(x - h e_i)) / 2h`, `1 + 2p` evaluations.
    Central,
}

impl DifferenceMode {
    /// Number of objective evaluations per gradient, including the base point.
    pub fn evaluations(&self, dim: usize) -> usize {
        match self {
            Self::Forward => 1 + dim,
            Self::Central => 1 + 2 * dim,
        }
    }
}

/// Configuration of the parallel evaluation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelOptions {
    /// Size of the worker pool. `None` uses the number of available CPUs.
    pub max_workers: Option<usize>,

    /// `true` for forward differences, `false` for central differences.
    pub forward: bool,

    /// Emit per-iteration progress at `info` level instead of `debug`.
    pub verbose: bool,

    /// Record every unique evaluation in the result's log.
    pub loginfo: bool,

    /// Record the elapsed and per-evaluation time in the result.
    pub time: bool,

    /// Dispatch evaluations to the worker pool.
    /// When `false`, every batch runs on the calling thread in task order.
    pub parallel: bool,

    /// Minimum number of evaluations in a batch for it to go to the pool.
    /// Smaller batches run on the calling thread. Results are identical either way.
    ///
    /// Default: 1 (always use the pool when `parallel` is set).
    pub min_parallel_evals: usize,

    /// Absolute finite-difference step for every dimension.
    /// `None` derives a relative step from the working precision.
    pub step: Option<f64>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            forward: true,
            verbose: false,
            loginfo: false,
            time: false,
            parallel: true,
            min_parallel_evals: 1,
            step: None,
        }
    }
}

impl ParallelOptions {
    /// The difference scheme selected by `forward`.
    pub fn mode(&self) -> DifferenceMode {
        if self.forward {
            DifferenceMode::Forward
        } else {
            DifferenceMode::Central
        }
    }

    /// Worker count after resolving the `None` default.
    pub fn worker_count(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Reject option combinations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(OptimError::InvalidArgs("max_workers must be >= 1".into()));
        }
        if let Some(h) = self.step {
            if !(h.is_finite() && h > 0.0) {
                return Err(OptimError::InvalidArgs(format!(
                    "finite-difference step must be finite and > 0, got {h}"
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of the quasi-Newton solver.
///
/// Defaults follow the conventional L-BFGS-B settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Number of correction pairs kept for the Hessian approximation.
    pub m: usize,

    /// Stop when `(f_k - f_{k+1}) / max(|f_k|, |f_{k+1}|, 1) <= ftol`.
    pub ftol: f64,

    /// Stop when the infinity-norm of the projected gradient is `<= pgtol`.
    pub pgtol: f64,

    /// Maximum number of iterations.
    pub max_iter: usize,

    /// Maximum number of unique objective evaluations. A gradient request is
    /// skipped if its worst case (`1 + p` forward, `1 + 2p` central) would
    /// exceed the limit; the request at the starting point is always made.
    pub max_fun: usize,

    /// Maximum number of backtracking steps per line search.
    pub max_ls: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            m: 10,
            ftol: 1e7 * f64::EPSILON,
            pgtol: 1e-5,
            max_iter: 15_000,
            max_fun: 15_000,
            max_ls: 20,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(OptimError::InvalidArgs("m must be >= 1".into()));
        }
        if !(self.ftol >= 0.0) || !(self.pgtol >= 0.0) {
            return Err(OptimError::InvalidArgs(
                "ftol and pgtol must be non-negative".into(),
            ));
        }
        if self.max_ls == 0 {
            return Err(OptimError::InvalidArgs("max_ls must be >= 1".into()));
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ──────────────────────────────────────────────────────────────────────────────

/// One unique objective evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Evaluated point.
    pub x: Vec<f64>,
    /// Objective value at `x`.
    pub fun: f64,
    /// Seconds since the start of the run, taken when the evaluation finished.
    pub timestamp: f64,
}

/// Append-only record of unique evaluations, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationLog {
    entries: Vec<LogEntry>,
}

impl EvaluationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Evaluated points, parallel to [`values`](Self::values).
    pub fn points(&self) -> Vec<Vec<f64>> {
        self.entries.iter().map(|e| e.x.clone()).collect()
    }

    /// Objective values, parallel to [`points`](Self::points).
    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.fun).collect()
    }
}

/// Wall-clock summary of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Total elapsed seconds.
    pub elapsed: f64,
    /// Seconds per unique objective evaluation.
    pub step: f64,
}

impl Timing {
    pub fn new(elapsed: f64, nfev: usize) -> Self {
        let step = if nfev == 0 { 0.0 } else { elapsed / nfev as f64 };
        Self { elapsed, step }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Result
// ──────────────────────────────────────────────────────────────────────────────

/// Result of a parallel L-BFGS-B run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Final point.
    pub x: Vec<f64>,

    /// Objective value at `x`.
    pub fun: f64,

    /// Gradient estimate at `x`.
    pub jac: Vec<f64>,

    /// Unique objective evaluations performed.
    pub nfev: usize,

    /// Gradient assemblies requested by the solver.
    pub njev: usize,

    /// Iterations performed.
    pub nit: usize,

    /// Whether the solver converged.
    pub success: bool,

    /// Why the solver stopped.
    pub status: ReturnCode,

    /// Human-readable message describing the termination reason.
    pub message: String,

    /// Evaluation log, present when `loginfo` was requested.
    pub log: Option<EvaluationLog>,

    /// Timing summary, present when `time` was requested.
    pub timing: Option<Timing>,
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RunResult {{")?;
        writeln!(f, "  success: {}", self.success)?;
        writeln!(f, "  message: {}", self.message)?;
        writeln!(f, "  fun: {:.15e}", self.fun)?;
        write!(f, "  x: [")?;
        for (i, xi) in self.x.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.15e}", xi)?;
        }
        writeln!(f, "]")?;
        writeln!(f, "  nfev: {}", self.nfev)?;
        writeln!(f, "  njev: {}", self.njev)?;
        writeln!(f, "  nit: {}", self.nit)?;
        if let Some(t) = &self.timing {
            writeln!(f, "  elapsed: {:.6}s (step {:.3e}s)", t.elapsed, t.step)?;
        }
        write!(f, "}}")
    }
}
