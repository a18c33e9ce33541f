//! # OPTIM-PARALLEL-RS: Parallel Gradient Evaluation for L-BFGS-B
//!
//! Bound-constrained quasi-Newton optimization where every objective/gradient
//! request of the solver is served by a parallel fan-out of objective
//! evaluations, with rayon doing the scheduling.
//!
//! ## Overview
//!
//! A gradient approximated by finite differences costs `1 + p` (forward) or
//! `1 + 2p` (central) objective evaluations, all independent of each other.
//! This crate evaluates them concurrently on a fixed-size worker pool and
//! reassembles the gradient positionally, so the result is bit-identical to
//! a sequential evaluation regardless of worker count or completion order.
//!
//! The layers, from the bottom up:
//!
//! - [`finite_diff`]: perturbation planning (bound-aware) and gradient reduction.
//! - [`cache`]: exact-bit memoization so a re-requested point is never re-evaluated.
//! - [`evaluator`]: one batch per solver request, dispatched to the pool.
//! - [`lbfgsb`]: the projected L-BFGS solver that consumes `(f, ∇f)`.
//! - [`orchestrator`]: configuration, pool lifetime and result packaging.
//!
//! ## Usage
//!
//! ```
//! use optim_parallel::{ParallelMinimizer, ParallelOptions};
//!
//! let result = ParallelMinimizer::from_fn(
//!     |x: &[f64]| x.iter().map(|v| (v - 1.0).powi(2)).sum(),
//!     vec![0.0; 4],
//!     vec![(-10.0, 10.0); 4],
//! )
//! .options(ParallelOptions {
//!     max_workers: Some(4),
//!     loginfo: true,
//!     time: true,
//!     ..Default::default()
//! })
//! .minimize()
//! .unwrap();
//!
//! assert!(result.success);
//! assert_eq!(result.log.as_ref().unwrap().len(), result.nfev);
//! ```
//!
//! ## Failure model
//!
//! Any failing evaluation fails the whole batch and the run: a partial
//! gradient would corrupt the Hessian approximation. Failures are reported as
//! [`OptimError`]; a solver that merely stops without converging reports a
//! [`ReturnCode`] in a normal [`RunResult`].

pub mod cache;
pub mod error;
pub mod evaluator;
pub mod finite_diff;
pub mod lbfgsb;
pub mod orchestrator;
pub mod types;

// Re-export main types
pub use cache::EvaluationCache;
pub use error::{BoxError, OptimError, PoolError, Result, ReturnCode};
pub use evaluator::ParallelEvaluator;
pub use finite_diff::{EvaluationTask, FiniteDifferenceGradient, GradientPlan, Perturbation};
pub use lbfgsb::{GradientSource, QuasiNewtonSolver, SolverOutcome};
pub use orchestrator::{minimize_parallel, ParallelMinimizer};
pub use types::{
    Bounds, CallbackFn, DifferenceMode, EvaluationLog, GradientFn, LogEntry, ObjectiveFn,
    ParallelOptions, RunResult, SolverOptions, Timing,
};
