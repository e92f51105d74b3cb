//! Scalar fixed-point solvers shared by the stage searches.
//!
//! Both strategies drive a monotone quantity `value(x)` towards a target and
//! only differ in how the next `x` is chosen. Neither performs a general
//! nonlinear solve: bisection assumes `value` increases with `x` over the
//! bracket, and the proportional update assumes `value ∝ x^(1/exponent)`
//! closely enough for the clamped step to contract.

use log::debug;
use serde::{Deserialize, Serialize};

use super::sweep::GeometricGrid;
use crate::oracle::{EvalError, EvalResult};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    /// Relative tolerance on `|value - target| / |target|`.
    pub tolerance: f64,
    pub max_iter: usize,
}

impl Convergence {
    pub fn new(tolerance: f64, max_iter: usize) -> Self {
        Self {
            tolerance,
            max_iter,
        }
    }

    #[inline]
    pub fn within(&self, value: f64, target: f64) -> bool {
        relative_error(value, target) < self.tolerance
    }
}

#[inline]
pub fn relative_error(value: f64, target: f64) -> f64 {
    (value - target).abs() / target.abs()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// The best `x` found, or the last one evaluated if none converged.
    pub x: f64,
    /// `value(x)`, if `x` could be evaluated.
    pub value: Option<f64>,
    /// Number of evaluations performed.
    pub iterations: usize,
    pub converged: bool,
    /// The evaluation error that stopped the iteration, if any.
    pub failure: Option<EvalError>,
}

pub trait ScalarSolver {
    /// Drives `eval(x)` towards `target`, starting from `x0` where the
    /// strategy uses a starting point.
    fn solve<F>(&self, x0: f64, target: f64, conv: &Convergence, eval: F) -> Solution
    where
        F: FnMut(f64) -> EvalResult<f64>;
}

/// Interval halving on a monotonically increasing `value(x)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bisection {
    pub low: f64,
    pub high: f64,
}

impl ScalarSolver for Bisection {
    fn solve<F>(&self, _x0: f64, target: f64, conv: &Convergence, mut eval: F) -> Solution
    where
        F: FnMut(f64) -> EvalResult<f64>,
    {
        let (mut lo, mut hi) = (self.low, self.high);
        // (error, x, value)
        let mut best: Option<(f64, f64, f64)> = None;

        for i in 1..=conv.max_iter {
            let mid = 0.5 * (lo + hi);
            let value = match eval(mid) {
                Ok(value) if value.is_finite() => value,
                Ok(value) => {
                    debug!("bisection: non-finite value {value} at x = {mid:e}");
                    lo = mid;
                    continue;
                }
                Err(e) => {
                    debug!("bisection: evaluation failed at x = {mid:e}: {e}");
                    lo = mid;
                    continue;
                }
            };

            let err = relative_error(value, target);
            if best.map_or(true, |(b, _, _)| err < b) {
                best = Some((err, mid, value));
            }
            if err < conv.tolerance {
                return Solution {
                    x: mid,
                    value: Some(value),
                    iterations: i,
                    converged: true,
                    failure: None,
                };
            }

            if value < target {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let (x, value) = match best {
            Some((_, x, value)) => (x, Some(value)),
            None => (0.5 * (lo + hi), None),
        };
        Solution {
            x,
            value,
            iterations: conv.max_iter,
            converged: false,
            failure: None,
        }
    }
}

/// Multiplicative update `x ← x · clamp((target / value)^exponent)`,
/// optionally snapped to a geometric grid.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionalUpdate {
    pub exponent: f64,
    pub clamp: Option<(f64, f64)>,
    pub grid: Option<GeometricGrid>,
}

impl ProportionalUpdate {
    /// The `gm ∝ sqrt(x)` rule: squared ratio, clamped to `[0.5, 2]`.
    pub fn square_law() -> Self {
        Self {
            exponent: 2.0,
            clamp: Some((0.5, 2.0)),
            grid: None,
        }
    }

    pub fn with_grid(mut self, grid: GeometricGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn without_clamp(mut self) -> Self {
        self.clamp = None;
        self
    }

    /// The scale factor applied to `x` for one step.
    pub fn scale(&self, value: f64, target: f64) -> f64 {
        let scale = (target / value).powf(self.exponent);
        match self.clamp {
            Some((lo, hi)) => scale.clamp(lo, hi),
            None => scale,
        }
    }

    pub fn step(&self, x: f64, value: f64, target: f64) -> f64 {
        let next = x * self.scale(value, target);
        match self.grid {
            Some(grid) => grid.snap(next),
            None => next,
        }
    }
}

impl ScalarSolver for ProportionalUpdate {
    fn solve<F>(&self, x0: f64, target: f64, conv: &Convergence, mut eval: F) -> Solution
    where
        F: FnMut(f64) -> EvalResult<f64>,
    {
        let mut x = x0;
        let mut last: Option<(f64, f64)> = None;

        for i in 1..=conv.max_iter {
            let value = match eval(x) {
                Ok(value) if value.is_finite() && value > 0.0 => value,
                res => {
                    let failure = res.err();
                    let (x, value) = match last {
                        Some((x, v)) => (x, Some(v)),
                        None => (x, None),
                    };
                    return Solution {
                        x,
                        value,
                        iterations: i,
                        converged: false,
                        failure,
                    };
                }
            };
            last = Some((x, value));

            if conv.within(value, target) {
                return Solution {
                    x,
                    value: Some(value),
                    iterations: i,
                    converged: true,
                    failure: None,
                };
            }
            x = self.step(x, value, target);
        }

        let (x, value) = last.map_or((x, None), |(x, v)| (x, Some(v)));
        Solution {
            x,
            value,
            iterations: conv.max_iter,
            converged: false,
            failure: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    Bisection(Bisection),
    Proportional(ProportionalUpdate),
}

impl ScalarSolver for Strategy {
    fn solve<F>(&self, x0: f64, target: f64, conv: &Convergence, eval: F) -> Solution
    where
        F: FnMut(f64) -> EvalResult<f64>,
    {
        match self {
            Strategy::Bisection(s) => s.solve(x0, target, conv, eval),
            Strategy::Proportional(s) => s.solve(x0, target, conv, eval),
        }
    }
}
