//! Finite-difference gradient planning and reduction.
//!
//! A [`GradientPlan`] is built once per solver request. Task 0 is always the
//! base point; the remaining tasks are the perturbed points. Values come back
//! as a slice indexed by task position and [`GradientPlan::assemble`] reduces
//! them to a gradient without looking at completion order.
//!
//! Perturbed points never leave the bounds. Per dimension, the rules are:
//!
//! | Room available                 | Forward mode        | Central mode              |
//! |--------------------------------|---------------------|---------------------------|
//! | `h` fits on both sides         | `+h`                | `±h`                      |
//! | `h` fits above only            | `+h`                | `+h` one-sided            |
//! | `h` fits below only            | `-h`                | `-h` one-sided            |
//! | `h` fits on neither side       | shrink to roomier   | shrink to roomier         |
//! | `low == high`                  | no task, `g_i = 0`  | no task, `g_i = 0`        |

use crate::error::{OptimError, Result};
use crate::types::{first_violation, DifferenceMode};

/// Smallest absolute step tried before doubling up to a representable one.
pub const MIN_STEP: f64 = 1e-12;

/// How a task's point was derived from the base point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Perturbation {
    /// The base point itself.
    None,
    /// `x + step * e_dim`.
    Forward { dim: usize, step: f64 },
    /// `x - step * e_dim`.
    Backward { dim: usize, step: f64 },
}

/// One objective evaluation required by a gradient estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationTask {
    pub perturbation: Perturbation,
    pub point: Vec<f64>,
}

/// Difference formula for one gradient component. Indices refer to tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Rule {
    Fixed,
    Forward { plus: usize, step: f64 },
    Backward { minus: usize, step: f64 },
    Central { plus: usize, minus: usize, span: f64 },
}

/// Task list plus the rules to turn task values into a gradient.
#[derive(Debug, Clone)]
pub struct GradientPlan {
    tasks: Vec<EvaluationTask>,
    rules: Vec<Rule>,
}

impl GradientPlan {
    /// All tasks, base point first.
    pub fn tasks(&self) -> &[EvaluationTask] {
        &self.tasks
    }

    /// Reduce task values to a gradient. `values[k]` is the objective at task `k`.
    pub fn assemble(&self, values: &[f64]) -> Vec<f64> {
        debug_assert_eq!(values.len(), self.tasks.len());
        let f0 = values[0];
        self.rules
            .iter()
            .map(|rule| match *rule {
                Rule::Fixed => 0.0,
                Rule::Forward { plus, step } => (values[plus] - f0) / step,
                Rule::Backward { minus, step } => (f0 - values[minus]) / step,
                Rule::Central { plus, minus, span } => (values[plus] - values[minus]) / span,
            })
            .collect()
    }
}

/// Planner for forward or central finite differences.
#[derive(Debug, Clone, Copy)]
pub struct FiniteDifferenceGradient {
    mode: DifferenceMode,
    step: Option<f64>,
}

impl FiniteDifferenceGradient {
    /// `step` overrides the relative step rule with one absolute step for every dimension.
    pub fn new(mode: DifferenceMode, step: Option<f64>) -> Self {
        Self { mode, step }
    }

    pub fn mode(&self) -> DifferenceMode {
        self.mode
    }

    /// Nominal step for coordinate value `xi`, before bound handling.
    ///
    /// `h = max(|xi|, 1) * sqrt(eps)` for forward and `max(|xi|, 1) * cbrt(eps)` for
    /// central differences. The result always changes `xi` when added to it.
    pub fn nominal_step(&self, xi: f64) -> f64 {
        let mut h = match self.step {
            Some(h) => h,
            None => {
                let rel = match self.mode {
                    DifferenceMode::Forward => f64::EPSILON.sqrt(),
                    DifferenceMode::Central => f64::EPSILON.cbrt(),
                };
                xi.abs().max(1.0) * rel
            }
        };
        if !(h > 0.0) || !h.is_finite() {
            h = MIN_STEP;
        }
        while xi.is_finite() && (xi + h == xi || xi - h == xi) {
            h *= 2.0;
        }
        h
    }

    /// Build the evaluation tasks for a gradient at `x`.
    ///
    /// # Errors
    /// `OptimError::Domain` if `x` lies outside `bounds` or is not finite, or if some free
    /// dimension has no room for a non-zero step.
    pub fn plan(&self, x: &[f64], bounds: &[(f64, f64)]) -> Result<GradientPlan> {
        debug_assert_eq!(x.len(), bounds.len());
        if let Some(dim) = first_violation(x, bounds).or_else(|| x.iter().position(|v| !v.is_finite())) {
            return Err(OptimError::Domain { point: x.to_vec(), dim });
        }

        let mut tasks = Vec::with_capacity(self.mode.evaluations(x.len()));
        tasks.push(EvaluationTask {
            perturbation: Perturbation::None,
            point: x.to_vec(),
        });
        let mut rules = Vec::with_capacity(x.len());

        for (dim, (&xi, &(lo, hi))) in x.iter().zip(bounds).enumerate() {
            if lo == hi {
                rules.push(Rule::Fixed);
                continue;
            }

            let h = self.nominal_step(xi);
            let room_up = hi - xi;
            let room_down = xi - lo;
            let fits_up = h <= room_up;
            let fits_down = h <= room_down;

            let rule = match (self.mode, fits_up, fits_down) {
                (DifferenceMode::Central, true, true) => {
                    let (plus, hp) = push_forward(&mut tasks, x, dim, h, hi)?;
                    let (minus, hm) = push_backward(&mut tasks, x, dim, h, lo)?;
                    Rule::Central { plus, minus, span: hp + hm }
                }
                (_, true, _) => {
                    let (plus, step) = push_forward(&mut tasks, x, dim, h, hi)?;
                    Rule::Forward { plus, step }
                }
                (_, false, true) => {
                    let (minus, step) = push_backward(&mut tasks, x, dim, h, lo)?;
                    Rule::Backward { minus, step }
                }
                (_, false, false) => {
                    if room_up >= room_down {
                        let (plus, step) = push_forward(&mut tasks, x, dim, room_up, hi)?;
                        Rule::Forward { plus, step }
                    } else {
                        let (minus, step) = push_backward(&mut tasks, x, dim, room_down, lo)?;
                        Rule::Backward { minus, step }
                    }
                }
            };
            rules.push(rule);
        }

        Ok(GradientPlan { tasks, rules })
    }
}

/// Append `x + h e_dim` (clamped to `hi`) and return its task index and the realized step.
fn push_forward(
    tasks: &mut Vec<EvaluationTask>,
    x: &[f64],
    dim: usize,
    h: f64,
    hi: f64,
) -> Result<(usize, f64)> {
    let mut point = x.to_vec();
    point[dim] = (x[dim] + h).min(hi);
    let step = point[dim] - x[dim];
    if !(step > 0.0) {
        return Err(OptimError::Domain { point, dim });
    }
    tasks.push(EvaluationTask {
        perturbation: Perturbation::Forward { dim, step },
        point,
    });
    Ok((tasks.len() - 1, step))
}

/// Append `x - h e_dim` (clamped to `lo`) and return its task index and the realized step.
fn push_backward(
    tasks: &mut Vec<EvaluationTask>,
    x: &[f64],
    dim: usize,
    h: f64,
    lo: f64,
) -> Result<(usize, f64)> {
    let mut point = x.to_vec();
    point[dim] = (x[dim] - h).max(lo);
    let step = x[dim] - point[dim];
    if !(step > 0.0) {
        return Err(OptimError::Domain { point, dim });
    }
    tasks.push(EvaluationTask {
        perturbation: Perturbation::Backward { dim, step },
        point,
    });
    Ok((tasks.len() - 1, step))
}
