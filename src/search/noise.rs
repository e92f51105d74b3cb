//! Stage 1: noise-constrained sizing of the cascoded input stage.
//!
//! Every width of a descending geometric sweep is an independent
//! [`WidthTask`]. A task descends the current grid until the noise budget is
//! violated, keeps the lowest current that still meets it, then shrinks the
//! cascode until the heuristic pole clears its target. Tasks run on a rayon
//! pool and the coordinator keeps the cheapest [`WidthOutcome`].

use std::f64::consts::PI;

use arcstr::ArcStr;
use derive_builder::Builder;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::sweep::{geomspace, logspace};
use super::{DesignPoint, DeviceParams, Stage};
use crate::error::{Result, SizingError};
use crate::oracle::{positive_gm, EvalError, EvalResult, Oracle, Params, Probe, Quantity};

/// Input-referred noise density budget `margin · A · (1 + B / f²)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseBudget {
    /// White noise floor [V²/Hz].
    pub a: f64,
    /// Squared flicker corner [Hz²].
    pub b: f64,
    pub margin: f64,
}

impl NoiseBudget {
    #[inline]
    pub fn density(&self, f: f64) -> f64 {
        self.a * (1.0 + self.b / (f * f))
    }

    #[inline]
    pub fn limit(&self, f: f64) -> f64 {
        self.margin * self.density(f)
    }
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(derive(Debug))]
pub struct NoiseSearch {
    pub device: DeviceParams,
    /// Cascode device; shares its current with `device`.
    pub cascode: DeviceParams,
    /// Device whose input capacitance loads the cascode node.
    pub downstream: ArcStr,
    pub probe: Probe,
    pub budget: NoiseBudget,
    pub f_min: f64,
    pub f_max: f64,
    #[builder(default = "10")]
    pub band_points: usize,
    /// Widths to evaluate, widest first.
    pub widths: Vec<f64>,
    /// Currents to evaluate, highest first.
    pub currents: Vec<f64>,
    pub reference_width: f64,
    pub reference_current: f64,
    #[builder(default = "1.0")]
    pub target_gain: f64,
    #[builder(default = "0.0")]
    pub cost_bias: f64,
    /// Pole frequency the cascode must reach [Hz].
    pub target_pole: f64,
    #[builder(default = "0.85")]
    pub cascode_step: f64,
    pub cascode_min_width: f64,
    #[builder(default)]
    pub workers: Option<usize>,
    #[builder(default = "true")]
    pub check_monotonicity: bool,
}

/// One width of the sweep, with a private copy of the assignment.
#[derive(Debug, Clone)]
pub struct WidthTask {
    pub index: usize,
    pub width: f64,
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidthOutcome {
    pub index: usize,
    pub width: f64,
    pub best: Option<NoiseStageResult>,
    pub rejection: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseStageResult {
    pub width: f64,
    pub current: f64,
    pub cascode_width: f64,
    pub ic: f64,
    pub gm: f64,
    pub go: f64,
    pub ciss: f64,
    pub gain: f64,
    pub cost: f64,
    /// Heuristic cascode pole [Hz].
    pub pole: f64,
    /// Largest `noise(f) / limit(f)` over the band.
    pub worst_noise_ratio: f64,
}

/// Largest input device width allowed by `size_budget`, the input stage's
/// share of the total width, given the combined width of the other stages.
pub fn max_width(other_widths: f64, size_budget: f64) -> f64 {
    other_widths / (1.0 / size_budget - 1.0)
}

/// Descending width sweep from just below `max_width` to `min_width`.
pub fn width_sweep(max_width: f64, min_width: f64, points: usize) -> Vec<f64> {
    geomspace(0.99 * max_width, min_width, points)
}

/// Descending current sweep from `budget` to `floor`.
pub fn current_sweep(budget: f64, floor: f64, points: usize) -> Vec<f64> {
    geomspace(budget, floor, points)
}

impl NoiseSearch {
    #[inline]
    pub fn builder() -> NoiseSearchBuilder {
        NoiseSearchBuilder::default()
    }

    pub fn frequencies(&self) -> Vec<f64> {
        logspace(self.f_min, self.f_max, self.band_points)
    }

    pub fn run(&self, oracle: &dyn Oracle, params: &Params) -> Result<(NoiseStageResult, Params)> {
        if self.widths.is_empty() || self.currents.is_empty() {
            return Err(SizingError::Config(
                "stage 1 needs at least one width and one current".to_string(),
            ));
        }
        if self.check_monotonicity {
            self.check_noise_monotonicity(oracle, params)?;
        }

        let workers = self
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .clamp(1, self.widths.len());
        info!(
            "{}: sweeping {} widths x {} currents on {workers} workers",
            Stage::Input,
            self.widths.len(),
            self.currents.len()
        );

        let tasks: Vec<WidthTask> = self
            .widths
            .iter()
            .enumerate()
            .map(|(index, &width)| WidthTask {
                index,
                width,
                params: params.clone(),
            })
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stage1-worker-{i}"))
            .build()?;
        let outcomes: Vec<WidthOutcome> = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| self.evaluate_width(oracle, task))
                .collect()
        });

        let mut best: Option<NoiseStageResult> = None;
        for outcome in outcomes {
            if let Some(point) = outcome.best {
                if best.map_or(true, |b| point.cost < b.cost) {
                    best = Some(point);
                }
            }
        }

        let best = best.ok_or_else(|| SizingError::NoViableCandidate {
            stage: Stage::Input,
            reason: format!(
                "none of {} widths meets the noise budget with a tunable cascode",
                self.widths.len()
            ),
        })?;
        info!(
            "{}: selected W = {:.3} um, I = {:.4} mA, W_c = {:.3} um (cost {:.4e})",
            Stage::Input,
            best.width * 1e6,
            best.current * 1e3,
            best.cascode_width * 1e6,
            best.cost
        );
        let mut params = params.clone();
        self.apply(&best, &mut params);
        Ok((best, params))
    }

    /// Writes a stage 1 result into `params`.
    pub fn apply(&self, result: &NoiseStageResult, params: &mut Params) {
        self.device.set_width(params, result.width);
        self.device.set_current(params, result.current);
        self.cascode.set_width(params, result.cascode_width);
    }

    /// Searches a single width. Never fails; an unusable width is reported
    /// through [`WidthOutcome::rejection`].
    pub fn evaluate_width(&self, oracle: &dyn Oracle, task: WidthTask) -> WidthOutcome {
        let WidthTask {
            index,
            width,
            mut params,
        } = task;
        let reject = |reason: String| {
            info!("{}: W = {:.3} um rejected: {reason}", Stage::Input, width * 1e6);
            WidthOutcome {
                index,
                width,
                best: None,
                rejection: Some(reason),
            }
        };

        self.device.set_width(&mut params, width);
        let freqs = self.frequencies();
        let mut lowest: Option<(DesignPoint, f64)> = None;
        for &current in self.currents.iter() {
            self.device.set_current(&mut params, current);
            match self.screen(oracle, &params, &freqs) {
                Ok(Screen::Valid(ratio)) => match self.score(oracle, &params, width, current) {
                    Ok(point) => lowest = Some((point, ratio)),
                    Err(e) => {
                        debug!("{}: W = {width:.4e} m, I = {current:.4e} A: {e}", Stage::Input);
                        break;
                    }
                },
                Ok(Screen::AboveCritical(ic)) => {
                    debug!(
                        "{}: W = {width:.4e} m, I = {current:.4e} A: IC = {ic:.3} above critical",
                        Stage::Input
                    );
                }
                Ok(Screen::NoiseViolated(ratio)) => {
                    debug!(
                        "{}: W = {width:.4e} m, I = {current:.4e} A: noise at {:.1}% of budget",
                        Stage::Input,
                        ratio * 100.0
                    );
                    break;
                }
                Err(e) => {
                    debug!("{}: W = {width:.4e} m, I = {current:.4e} A: {e}", Stage::Input);
                    break;
                }
            }
        }

        let Some((point, ratio)) = lowest else {
            return reject("no current meets the noise budget".to_string());
        };
        self.device.set_current(&mut params, point.current);
        match self.tune_cascode(oracle, &mut params, width) {
            Ok(Some((cascode_width, pole))) => {
                info!(
                    "{}: W = {:.3} um: I = {:.4} mA, W_c = {:.3} um, pole = {:.3e} Hz, cost = {:.4e}",
                    Stage::Input,
                    width * 1e6,
                    point.current * 1e3,
                    cascode_width * 1e6,
                    pole,
                    point.cost
                );
                WidthOutcome {
                    index,
                    width,
                    best: Some(NoiseStageResult {
                        width,
                        current: point.current,
                        cascode_width,
                        ic: point.ic,
                        gm: point.gm,
                        go: point.go,
                        ciss: point.ciss,
                        gain: point.gain,
                        cost: point.cost,
                        pole,
                        worst_noise_ratio: ratio,
                    }),
                    rejection: None,
                }
            }
            Ok(None) => reject(format!(
                "cascode pole stays below {:.3e} Hz down to W_c = {:.3e} m at I = {:.4e} A",
                self.target_pole, self.cascode_min_width, point.current
            )),
            Err(e) => reject(format!("cascode tuning failed: {e}")),
        }
    }

    fn screen(&self, oracle: &dyn Oracle, params: &Params, freqs: &[f64]) -> EvalResult<Screen> {
        positive_gm(oracle, params, &self.device.device)?;
        let ic = oracle.device_scalar(params, &self.device.device, Quantity::Ic)?;
        let ic_crit = oracle.device_scalar(params, &self.device.device, Quantity::IcCrit)?;
        if ic > ic_crit {
            return Ok(Screen::AboveCritical(ic));
        }
        let ratio = self.worst_noise_ratio(oracle, params, freqs)?;
        if ratio > 1.0 {
            Ok(Screen::NoiseViolated(ratio))
        } else {
            Ok(Screen::Valid(ratio))
        }
    }

    /// Largest ratio of noise to the margin-scaled budget over `freqs`.
    pub fn worst_noise_ratio(&self, oracle: &dyn Oracle, params: &Params, freqs: &[f64]) -> EvalResult<f64> {
        let noise = oracle.input_noise(params, &self.probe)?;
        let mut worst = 0.0f64;
        for &f in freqs {
            let ratio = noise(f) / self.budget.limit(f);
            if !ratio.is_finite() {
                return Err(EvalError::OperatingPoint {
                    device: self.device.device.clone(),
                    reason: format!("noise ratio {ratio} at {f:e} Hz"),
                });
            }
            worst = worst.max(ratio);
        }
        Ok(worst)
    }

    fn score(&self, oracle: &dyn Oracle, params: &Params, width: f64, current: f64) -> EvalResult<DesignPoint> {
        let device = &self.device.device;
        let gm = positive_gm(oracle, params, device)?;
        let go = oracle.device_scalar(params, device, Quantity::Go)?;
        if !(go > 0.0) {
            return Err(EvalError::NonPhysical {
                device: device.clone(),
                quantity: Quantity::Go,
                value: go,
            });
        }
        let gain = gm / go;
        let cost = (width / self.reference_width) * (current / self.reference_current)
            / (gain / self.target_gain).powf(self.cost_bias);
        Ok(DesignPoint {
            width,
            current,
            ic: oracle.device_scalar(params, device, Quantity::Ic)?,
            gm,
            go,
            ciss: oracle.device_scalar(params, device, Quantity::Ciss)?,
            gain,
            cost,
        })
    }

    /// Heuristic cascode pole `1 / (2π · gm·(ro/2) · gm_c·ro_c · c_iss)`.
    ///
    /// The product is an empirical threshold figure rather than a derived
    /// node time constant; it falls as the cascode shrinks.
    pub fn pole_frequency(&self, oracle: &dyn Oracle, params: &Params) -> EvalResult<f64> {
        let gm = positive_gm(oracle, params, &self.device.device)?;
        let ro = oracle.device_scalar(params, &self.device.device, Quantity::Ro)?;
        let gm_c = positive_gm(oracle, params, &self.cascode.device)?;
        let ro_c = oracle.device_scalar(params, &self.cascode.device, Quantity::Ro)?;
        let ciss = oracle.device_scalar(params, &self.downstream, Quantity::Ciss)?;
        let figure = gm * 0.5 * ro * gm_c * ro_c * ciss;
        Ok(1.0 / (2.0 * PI * figure))
    }

    /// Shrinks the cascode from `width` by `cascode_step` until the pole
    /// clears `target_pole`. Returns `None` once below the minimum width.
    fn tune_cascode(
        &self,
        oracle: &dyn Oracle,
        params: &mut Params,
        width: f64,
    ) -> EvalResult<Option<(f64, f64)>> {
        let mut cascode_width = width;
        while cascode_width >= self.cascode_min_width {
            self.cascode.set_width(params, cascode_width);
            let pole = self.pole_frequency(oracle, params)?;
            if pole >= self.target_pole {
                return Ok(Some((cascode_width, pole)));
            }
            cascode_width *= self.cascode_step;
        }
        Ok(None)
    }

    /// Checks that noise does not increase with width at the top current,
    /// which the early exit of the current descent relies on.
    pub fn check_noise_monotonicity(&self, oracle: &dyn Oracle, params: &Params) -> Result<()> {
        let current = self.currents.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut widths = self.widths.clone();
        widths.sort_by(f64::total_cmp);
        let freqs = self.frequencies();

        let mut params = params.clone();
        self.device.set_current(&mut params, current);
        let mut previous: Option<(f64, Vec<f64>)> = None;
        for width in widths {
            self.device.set_width(&mut params, width);
            let noise = match oracle.input_noise(&params, &self.probe) {
                Ok(noise) => freqs.iter().map(|&f| noise(f)).collect::<Vec<_>>(),
                Err(e) => {
                    debug!("{}: monotonicity check skips W = {width:.4e} m: {e}", Stage::Input);
                    continue;
                }
            };
            if let Some((narrow, ref narrow_noise)) = previous {
                if noise
                    .iter()
                    .zip(narrow_noise)
                    .any(|(wide, narrow)| *wide > narrow * (1.0 + 1e-9))
                {
                    return Err(SizingError::MonotonicityViolated {
                        narrow,
                        wide: width,
                        current,
                    });
                }
            }
            previous = Some((width, noise));
        }
        Ok(())
    }
}

enum Screen {
    Valid(f64),
    AboveCritical(f64),
    NoiseViolated(f64),
}
