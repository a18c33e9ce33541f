//! Fan-out/fan-in evaluation of `(f(x), ∇f(x))` on a bounded worker pool.
//!
//! One solver request becomes one batch:
//!
//! 1. [`FiniteDifferenceGradient::plan`] expands `x` into `1 + p` or `1 + 2p` tasks.
//! 2. Tasks whose point is already cached, or duplicated earlier in the same
//!    batch, are not dispatched.
//! 3. The remaining points are evaluated on the pool (or on the calling thread
//!    when parallelism is off or the batch is small).
//! 4. Once every dispatched task has resolved, values are written back by task
//!    index and the gradient is assembled positionally.
//!
//! A batch either succeeds as a whole or fails as a whole. On failure nothing
//! is written to the cache or the log, and the failure with the lowest task
//! index is reported so the error does not depend on scheduling.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cache::{EvaluationCache, PointKey};
use crate::error::{OptimError, PoolError, Result};
use crate::finite_diff::FiniteDifferenceGradient;
use crate::lbfgsb::GradientSource;
use crate::types::{
    first_violation, Bounds, EvaluationLog, GradientFn, LogEntry, ObjectiveFn, ParallelOptions,
};

/// Value of one dispatched task and the time (seconds since run start) it finished.
type Outcome = Result<(f64, f64)>;

/// Where the value of a task comes from once the batch has resolved.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Cached(f64),
    Dispatched(usize),
}

/// Parallel objective/gradient evaluator for one optimization run.
///
/// Owns the worker pool, the evaluation cache and the evaluation log. All three
/// live exactly as long as the evaluator; workers only ever see read-only
/// points and hand back scalars.
pub struct ParallelEvaluator {
    objective: Arc<ObjectiveFn>,
    gradient: Option<Arc<GradientFn>>,
    bounds: Bounds,
    fd: FiniteDifferenceGradient,
    pool: Option<ThreadPool>,
    workers: usize,
    min_parallel_evals: usize,
    cache: EvaluationCache,
    log: Option<EvaluationLog>,
    last_gradient: Option<(PointKey, Vec<f64>)>,
    start: Instant,
    nfev: usize,
    njev: usize,
    requested: usize,
}

impl ParallelEvaluator {
    /// Create an evaluator and, if `options.parallel` is set, its worker pool.
    ///
    /// # Errors
    /// - `OptimError::InvalidArgs` / `InvalidBounds` for invalid options or bounds.
    /// - `OptimError::Pool(PoolError::Build)` if the worker threads cannot be started.
    pub fn new(
        objective: Arc<ObjectiveFn>,
        gradient: Option<Arc<GradientFn>>,
        bounds: Bounds,
        options: &ParallelOptions,
    ) -> Result<Self> {
        crate::types::validate_bounds(&bounds)?;
        options.validate()?;

        let workers = options.worker_count();
        let pool = if options.parallel {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("optim-worker-{i}"))
                .build()
                .map_err(|e| PoolError::Build(e.to_string()))?;
            tracing::debug!(workers, "worker pool started");
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            objective,
            gradient,
            bounds,
            fd: FiniteDifferenceGradient::new(options.mode(), options.step),
            pool,
            workers,
            min_parallel_evals: options.min_parallel_evals.max(1),
            cache: EvaluationCache::new(),
            log: options.loginfo.then(EvaluationLog::new),
            last_gradient: None,
            start: Instant::now(),
            nfev: 0,
            njev: 0,
            requested: 0,
        })
    }

    /// Evaluate the objective and its gradient at `x`.
    pub fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        if x.len() != self.bounds.len() {
            return Err(OptimError::InvalidArgs(format!(
                "point has dimension {}, bounds have {}",
                x.len(),
                self.bounds.len()
            )));
        }
        self.njev += 1;
        match self.gradient.clone() {
            Some(gradient) => self.evaluate_analytic(x, &*gradient),
            None => self.evaluate_finite_difference(x),
        }
    }

    fn evaluate_finite_difference(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let plan = self.fd.plan(x, &self.bounds)?;
        let points: Vec<&[f64]> = plan.tasks().iter().map(|t| t.point.as_slice()).collect();
        let values = self.evaluate_batch(&points)?;
        Ok((values[0], plan.assemble(&values)))
    }

    fn evaluate_analytic(&mut self, x: &[f64], gradient: &GradientFn) -> Result<(f64, Vec<f64>)> {
        if let Some(dim) = first_violation(x, &self.bounds) {
            return Err(OptimError::Domain { point: x.to_vec(), dim });
        }
        self.requested += 1;
        let key = PointKey::new(x);
        let cached_f = self.cache.lookup(x);
        let cached_g = match &self.last_gradient {
            Some((k, g)) if *k == key => Some(g.clone()),
            _ => None,
        };

        let objective = &*self.objective;
        let start = self.start;
        let run_f = || match cached_f {
            Some(f) => Ok((f, f64::NAN)),
            None => evaluate_point(objective, x, start),
        };
        let run_g = || match &cached_g {
            Some(g) => Ok(g.clone()),
            None => evaluate_gradient(gradient, x),
        };

        // f and the gradient are independent tasks; run them side by side.
        let (f_outcome, g_outcome) = match &self.pool {
            Some(pool) if cached_f.is_none() && cached_g.is_none() => {
                pool.install(|| rayon::join(run_f, run_g))
            }
            _ => (run_f(), run_g()),
        };

        let (f, finished) = f_outcome?;
        let g = g_outcome?;
        if g.len() != x.len() {
            return Err(OptimError::InvalidArgs(format!(
                "gradient has length {}, expected {}",
                g.len(),
                x.len()
            )));
        }

        if cached_f.is_none() {
            self.record(x, f, finished);
        }
        self.last_gradient = Some((key, g.clone()));
        Ok((f, g))
    }

    /// Evaluate the objective at every point, returning values in input order.
    ///
    /// Points already in the cache are not re-evaluated and bit-identical points
    /// within the batch are evaluated once.
    ///
    /// # Errors
    /// `OptimError::Domain` if any point lies outside the bounds; nothing is
    /// evaluated in that case.
    pub fn evaluate_batch(&mut self, points: &[&[f64]]) -> Result<Vec<f64>> {
        for &p in points {
            if p.len() != self.bounds.len() {
                return Err(OptimError::InvalidArgs(format!(
                    "point has dimension {}, bounds have {}",
                    p.len(),
                    self.bounds.len()
                )));
            }
            if let Some(dim) = first_violation(p, &self.bounds) {
                return Err(OptimError::Domain { point: p.to_vec(), dim });
            }
        }
        self.requested += points.len();

        let mut slots = Vec::with_capacity(points.len());
        let mut pending: Vec<&[f64]> = Vec::new();
        let mut seen: HashMap<PointKey, usize> = HashMap::new();
        for &p in points {
            if let Some(f) = self.cache.lookup(p) {
                slots.push(Slot::Cached(f));
                continue;
            }
            let j = *seen.entry(PointKey::new(p)).or_insert_with(|| {
                pending.push(p);
                pending.len() - 1
            });
            slots.push(Slot::Dispatched(j));
        }

        tracing::trace!(
            tasks = points.len(),
            dispatched = pending.len(),
            cached = points.len() - pending.len(),
            "evaluating batch"
        );

        let outcomes = self.dispatch(&pending);

        // Barrier passed: every task has resolved. Fail on the lowest index.
        let mut resolved = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            resolved.push(outcome?);
        }

        let mut order: Vec<usize> = (0..pending.len()).collect();
        order.sort_by(|&a, &b| resolved[a].1.total_cmp(&resolved[b].1));
        for j in order {
            self.record(pending[j], resolved[j].0, resolved[j].1);
        }

        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Cached(f) => f,
                Slot::Dispatched(j) => resolved[j].0,
            })
            .collect())
    }

    /// Run the objective on every point and wait for all of them.
    fn dispatch(&self, pending: &[&[f64]]) -> Vec<Outcome> {
        let objective = &*self.objective;
        let start = self.start;
        match &self.pool {
            Some(pool) if pending.len() >= self.min_parallel_evals => pool.install(|| {
                pending
                    .par_iter()
                    .map(|p| evaluate_point(objective, p, start))
                    .collect()
            }),
            _ => pending
                .iter()
                .map(|p| evaluate_point(objective, p, start))
                .collect(),
        }
    }

    fn record(&mut self, x: &[f64], f: f64, finished: f64) {
        if self.cache.insert(x, f) {
            self.nfev += 1;
            if let Some(log) = &mut self.log {
                log.push(LogEntry {
                    x: x.to_vec(),
                    fun: f,
                    timestamp: finished,
                });
            }
        }
    }

    /// Unique objective evaluations performed so far.
    pub fn nfev(&self) -> usize {
        self.nfev
    }

    /// Gradient requests served so far.
    pub fn njev(&self) -> usize {
        self.njev
    }

    /// Objective values requested so far, cache hits included.
    pub fn requested_evaluations(&self) -> usize {
        self.requested
    }

    /// Size of the worker pool, or the configured size if running serially.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether batches are dispatched to a worker pool.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Unique evaluations recorded so far, with hit/miss counters.
    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    /// Seconds since the evaluator was created.
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Hand the evaluation log over to the caller.
    pub fn take_log(&mut self) -> Option<EvaluationLog> {
        self.log.take()
    }
}

impl GradientSource for ParallelEvaluator {
    fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        ParallelEvaluator::evaluate(self, x)
    }

    fn nfev(&self) -> usize {
        self.nfev
    }

    fn request_cost(&self, dim: usize) -> usize {
        match self.gradient {
            Some(_) => 1,
            None => self.fd.mode().evaluations(dim),
        }
    }
}

/// Call the objective once, turning errors, NaN results and panics into `OptimError`.
fn evaluate_point(objective: &ObjectiveFn, x: &[f64], start: Instant) -> Outcome {
    let value = match panic::catch_unwind(AssertUnwindSafe(|| objective(x))) {
        Ok(value) => value,
        Err(payload) => {
            return Err(PoolError::WorkerPanicked {
                point: x.to_vec(),
                message: panic_message(payload.as_ref()),
            }
            .into())
        }
    };
    match value {
        Ok(f) if f.is_nan() => Err(OptimError::Objective {
            point: x.to_vec(),
            source: "objective returned a non-finite value (NaN)".into(),
        }),
        Ok(f) => Ok((f, start.elapsed().as_secs_f64())),
        Err(source) => Err(OptimError::Objective {
            point: x.to_vec(),
            source,
        }),
    }
}

fn evaluate_gradient(gradient: &GradientFn, x: &[f64]) -> Result<Vec<f64>> {
    match panic::catch_unwind(AssertUnwindSafe(|| gradient(x))) {
        Ok(Ok(g)) => Ok(g),
        Ok(Err(source)) => Err(OptimError::Objective {
            point: x.to_vec(),
            source,
        }),
        Err(payload) => Err(PoolError::WorkerPanicked {
            point: x.to_vec(),
            message: panic_message(payload.as_ref()),
        }
        .into()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
