//! Stage 3: sizing of the class-AB push-pull output pair.
//!
//! Two nested fixed-point loops. The ratio loop equalizes push and pull
//! transconductance at a reference current by scaling the lagging width.
//! The bias loop then keeps that width ratio and alternates between the
//! width meeting the peak transconductance at `Iq + drive` and the
//! quiescent current `Iq` meeting the quiescent target.

use derive_builder::Builder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::solver::{Convergence, ProportionalUpdate, ScalarSolver};
use super::sweep::GeometricGrid;
use super::{no_viable, DeviceParams, Stage};
use crate::error::{Result, SizingError};
use crate::oracle::{positive_gm, EvalResult, Oracle, Params, Quantity};

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(derive(Debug))]
pub struct MatchedBiasSearch {
    /// PMOS device sourcing the output current.
    pub push: DeviceParams,
    /// NMOS device sinking the output current.
    pub pull: DeviceParams,
    /// Per-device transconductance target at the quiescent current.
    pub gm_quiescent: f64,
    /// Per-device transconductance target at the peak current.
    pub gm_peak: f64,
    /// Output current the pair must deliver on top of `Iq`.
    pub drive_current: f64,
    /// Current at which push and pull transconductance are matched.
    pub reference_current: f64,
    #[builder(default = "Convergence::new(0.01, 10)")]
    pub ratio_conv: Convergence,
    #[builder(default = "Convergence::new(0.02, 20)")]
    pub bias_conv: Convergence,
    #[builder(default = "Convergence::new(0.01, 15)")]
    pub width_conv: Convergence,
    #[builder(default = "GeometricGrid::new(200)")]
    pub grid: GeometricGrid,
}

/// Transconductance and inversion level of the pair at one bias current.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSnapshot {
    pub current: f64,
    pub gm_push: f64,
    pub gm_pull: f64,
    pub ic_push: f64,
    pub ic_pull: f64,
    /// Output stage transconductance `gm_push + gm_pull`.
    pub gm_total: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioOutcome {
    /// `W_push / W_pull`.
    pub ratio: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedStageResult {
    pub ratio: f64,
    pub push_width: f64,
    pub pull_width: f64,
    pub quiescent_current: f64,
    pub peak_current: f64,
    pub quiescent: BiasSnapshot,
    pub peak: BiasSnapshot,
    pub ratio_iterations: usize,
    pub bias_iterations: usize,
    pub converged: bool,
}

impl MatchedBiasSearch {
    #[inline]
    pub fn builder() -> MatchedBiasSearchBuilder {
        MatchedBiasSearchBuilder::default()
    }

    /// Runs the ratio loop, then the bias loop.
    ///
    /// The starting quiescent current and pull width are read from `params`.
    pub fn run(&self, oracle: &dyn Oracle, params: &Params) -> Result<(MatchedStageResult, Params)> {
        info!(
            "{}: matching {} ({}) against {} ({})",
            Stage::Output,
            self.push.device,
            self.push.polarity,
            self.pull.device,
            self.pull.polarity
        );
        let (ratio, mut params) = self.match_ratio(oracle, params)?;
        info!(
            "{}: width ratio {:.3} after {} iterations",
            Stage::Output,
            ratio.ratio,
            ratio.iterations
        );
        if !ratio.converged {
            warn!(
                "{}: transconductance ratio did not converge in {} iterations",
                Stage::Output,
                self.ratio_conv.max_iter
            );
        }

        let fail = no_viable(Stage::Output);
        let mut iq = self.pull.current(&params).map_err(&fail)?;
        let mut width = self.pull.width(&params).map_err(&fail)?;
        let width_update = ProportionalUpdate::square_law();
        let iq_update = ProportionalUpdate::square_law().without_clamp();

        let mut bias_iterations = 0;
        let mut converged = false;
        let mut snapshots = None;
        for i in 1..=self.bias_conv.max_iter {
            bias_iterations = i;
            let i_peak = iq + self.drive_current;

            let mut trial = params.clone();
            let sol = width_update.solve(width, self.gm_peak, &self.width_conv, |w| {
                self.set_bias(&mut trial, w, ratio.ratio, i_peak);
                positive_gm(oracle, &trial, &self.push.device)
            });
            if let (Some(e), None) = (&sol.failure, sol.value) {
                return Err(fail(e.clone()));
            }
            if !sol.converged {
                debug!(
                    "{}: peak width did not converge at Iq = {iq:.4e} A",
                    Stage::Output
                );
            }
            width = sol.x;

            self.set_bias(&mut params, width, ratio.ratio, i_peak);
            let peak = self.snapshot(oracle, &params, i_peak).map_err(&fail)?;
            self.set_currents(&mut params, iq);
            let quiescent = self.snapshot(oracle, &params, iq).map_err(&fail)?;
            debug!(
                "{}: iteration {i}: Iq = {iq:.4e} A, W_pull = {width:.4e} m, gm_q = {:.4e} S, gm_peak = {:.4e} S",
                Stage::Output,
                quiescent.gm_push,
                peak.gm_push
            );
            snapshots = Some((quiescent, peak));

            if self.bias_conv.within(quiescent.gm_push, self.gm_quiescent) {
                converged = true;
                break;
            }
            iq = iq_update.step(iq, quiescent.gm_push, self.gm_quiescent);
        }

        let Some((quiescent, peak)) = snapshots else {
            return Err(SizingError::NoViableCandidate {
                stage: Stage::Output,
                reason: "bias loop performed no iterations".to_string(),
            });
        };
        if !converged {
            warn!(
                "{}: quiescent transconductance did not converge in {} iterations; \
                 keeping Iq = {:.4e} A",
                Stage::Output,
                self.bias_conv.max_iter,
                quiescent.current
            );
        }

        let result = MatchedStageResult {
            ratio: ratio.ratio,
            push_width: width * ratio.ratio,
            pull_width: width,
            quiescent_current: quiescent.current,
            peak_current: peak.current,
            quiescent,
            peak,
            ratio_iterations: ratio.iterations,
            bias_iterations,
            converged: converged && ratio.converged,
        };
        info!(
            "{}: W_push = {:.3} um, W_pull = {:.3} um, Iq = {:.3} mA",
            Stage::Output,
            result.push_width * 1e6,
            result.pull_width * 1e6,
            result.quiescent_current * 1e3
        );
        Ok((result, params))
    }

    /// Equalizes push and pull transconductance at the reference current.
    ///
    /// Running this on its own output changes no widths.
    pub fn match_ratio(&self, oracle: &dyn Oracle, params: &Params) -> Result<(RatioOutcome, Params)> {
        let fail = no_viable(Stage::Output);
        let mut params = params.clone();
        self.set_currents(&mut params, self.reference_current);
        let update = ProportionalUpdate::square_law().with_grid(self.grid);

        let mut iterations = 0;
        let mut converged = false;
        for i in 1..=self.ratio_conv.max_iter {
            iterations = i;
            let gm_push = positive_gm(oracle, &params, &self.push.device).map_err(&fail)?;
            let gm_pull = positive_gm(oracle, &params, &self.pull.device).map_err(&fail)?;
            let mismatch = (gm_push - gm_pull).abs() / gm_push.max(gm_pull);
            debug!(
                "{}: ratio iteration {i}: gm_push = {gm_push:.4e} S, gm_pull = {gm_pull:.4e} S, mismatch = {:.2}%",
                Stage::Output,
                mismatch * 100.0
            );
            if mismatch < self.ratio_conv.tolerance {
                converged = true;
                break;
            }

            let (lagging, leading) = if gm_push < gm_pull {
                (&self.push, &self.pull)
            } else {
                (&self.pull, &self.push)
            };
            let (gm_lagging, gm_leading) = (gm_push.min(gm_pull), gm_push.max(gm_pull));
            let w = lagging.width(&params).map_err(&fail)?;
            lagging.set_width(&mut params, update.step(w, gm_lagging, gm_leading));
            let w = leading.width(&params).map_err(&fail)?;
            leading.set_width(&mut params, self.grid.snap(w));
        }

        let ratio = self.push.width(&params).map_err(&fail)? / self.pull.width(&params).map_err(&fail)?;
        Ok((
            RatioOutcome {
                ratio,
                iterations,
                converged,
            },
            params,
        ))
    }

    fn set_currents(&self, params: &mut Params, current: f64) {
        self.push.set_current(params, current);
        self.pull.set_current(params, current);
    }

    fn set_bias(&self, params: &mut Params, pull_width: f64, ratio: f64, current: f64) {
        self.pull.set_width(params, pull_width);
        self.push.set_width(params, pull_width * ratio);
        self.set_currents(params, current);
    }

    fn snapshot(&self, oracle: &dyn Oracle, params: &Params, current: f64) -> EvalResult<BiasSnapshot> {
        let gm_push = positive_gm(oracle, params, &self.push.device)?;
        let gm_pull = positive_gm(oracle, params, &self.pull.device)?;
        Ok(BiasSnapshot {
            current,
            gm_push,
            gm_pull,
            ic_push: oracle.device_scalar(params, &self.push.device, Quantity::Ic)?,
            ic_pull: oracle.device_scalar(params, &self.pull.device, Quantity::Ic)?,
            gm_total: gm_push + gm_pull,
        })
    }
}
