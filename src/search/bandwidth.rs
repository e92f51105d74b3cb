//! Stage 2: follower sizing for a local bandwidth target.
//!
//! The bias current follows from the swing and the transconductance needed
//! to drive the output pair's input capacitance, and is held fixed while the
//! width is bisected on `gm`.

use std::f64::consts::PI;

use arcstr::ArcStr;
use derive_builder::Builder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::solver::{Bisection, Convergence, ScalarSolver};
use super::{no_viable, DeviceParams, Stage};
use crate::error::{Result, SizingError};
use crate::oracle::{positive_gm, Oracle, Params, Polarity, Quantity};

/// Follower polarity as configured per design variant.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlavorChoice {
    N,
    P,
    #[default]
    Auto,
}

impl FlavorChoice {
    /// Resolves the follower polarity against the parameters present in
    /// `params`. `Auto` picks the first of `N`, `P` for which both
    /// `<width>_<suffix>` and `<current>_<suffix>` exist.
    pub fn resolve(&self, params: &Params, width: &str, current: &str) -> Result<Polarity> {
        let present = |p: Polarity| {
            params.contains(&format!("{width}_{}", p.suffix()))
                && params.contains(&format!("{current}_{}", p.suffix()))
        };
        let polarity = match self {
            FlavorChoice::N => Polarity::N,
            FlavorChoice::P => Polarity::P,
            FlavorChoice::Auto => [Polarity::N, Polarity::P]
                .into_iter()
                .find(|p| present(*p))
                .ok_or_else(|| {
                    SizingError::Config(format!(
                        "no follower parameters `{width}_N`/`{current}_N` or `{width}_P`/`{current}_P`"
                    ))
                })?,
        };
        if !present(polarity) {
            return Err(SizingError::Config(format!(
                "follower parameters `{width}_{s}`/`{current}_{s}` are missing",
                s = polarity.suffix()
            )));
        }
        Ok(polarity)
    }
}

/// Builds the follower's parameter names for a resolved polarity.
pub fn follower_params(device: &str, width: &str, current: &str, polarity: Polarity) -> DeviceParams {
    DeviceParams::new(
        device,
        format!("{width}_{}", polarity.suffix()),
        format!("{current}_{}", polarity.suffix()),
        polarity,
    )
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(derive(Debug))]
pub struct BandwidthSearch {
    pub device: DeviceParams,
    /// Devices whose input capacitance loads the follower.
    pub downstream: Vec<ArcStr>,
    /// Local pole frequency [Hz].
    pub f_local: f64,
    /// Estimated output swing [V].
    pub swing: f64,
    /// Extra current on top of the slew requirement, as a fraction.
    #[builder(default = "0.2")]
    pub drive_margin: f64,
    pub w_min: f64,
    pub w_max: f64,
    #[builder(default = "Convergence::new(0.01, 40)")]
    pub conv: Convergence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthStageResult {
    pub polarity: Polarity,
    pub width: f64,
    /// Bias current magnitude.
    pub current: f64,
    pub c_downstream: f64,
    pub gm_target: f64,
    pub gm: f64,
    pub ic: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl BandwidthSearch {
    #[inline]
    pub fn builder() -> BandwidthSearchBuilder {
        BandwidthSearchBuilder::default()
    }

    pub fn run(&self, oracle: &dyn Oracle, params: &Params) -> Result<(BandwidthStageResult, Params)> {
        let fail = no_viable(Stage::Follower);
        let mut c_downstream = 0.0;
        for device in self.downstream.iter() {
            c_downstream += oracle
                .device_scalar(params, device, Quantity::Ciss)
                .map_err(&fail)?;
        }
        let gm_target = 2.0 * PI * self.f_local * c_downstream;
        let current = self.swing * gm_target * (1.0 + self.drive_margin);
        info!(
            "{}: {} follower, C_downstream = {:.3} fF, gm target = {:.4e} S, I = {:.4e} A",
            Stage::Follower,
            self.device.polarity,
            c_downstream * 1e15,
            gm_target,
            current
        );

        let mut params = params.clone();
        self.device.set_current(&mut params, current);

        let bisection = Bisection {
            low: self.w_min,
            high: self.w_max,
        };
        let mut trial = params.clone();
        let sol = bisection.solve(self.w_min, gm_target, &self.conv, |w| {
            self.device.set_width(&mut trial, w);
            let gm = positive_gm(oracle, &trial, &self.device.device);
            if let Ok(gm) = gm {
                debug!("{}: W = {w:.4e} m, gm = {gm:.4e} S", Stage::Follower);
            }
            gm
        });
        let Some(gm) = sol.value else {
            return Err(SizingError::NoViableCandidate {
                stage: Stage::Follower,
                reason: format!(
                    "no width in [{:e}, {:e}] m gives a valid operating point",
                    self.w_min, self.w_max
                ),
            });
        };
        if !sol.converged {
            warn!(
                "{}: gm did not converge in {} iterations; best W = {:.4e} m gives {:.4e} S \
                 against a target of {:.4e} S",
                Stage::Follower,
                sol.iterations,
                sol.x,
                gm,
                gm_target
            );
        }

        self.device.set_width(&mut params, sol.x);
        let ic = oracle
            .device_scalar(&params, &self.device.device, Quantity::Ic)
            .map_err(&fail)?;
        let result = BandwidthStageResult {
            polarity: self.device.polarity,
            width: sol.x,
            current,
            c_downstream,
            gm_target,
            gm,
            ic,
            iterations: sol.iterations,
            converged: sol.converged,
        };
        info!(
            "{}: W = {:.3} um after {} iterations (IC = {:.3})",
            Stage::Follower,
            result.width * 1e6,
            result.iterations,
            result.ic
        );
        Ok((result, params))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::tests::{amplifier_devices, amplifier_params, inverse_current_noise, SyntheticOracle};

    fn oracle() -> SyntheticOracle {
        SyntheticOracle::new("X1", amplifier_devices(0.2), inverse_current_noise(1e-17))
    }

    fn search() -> BandwidthSearch {
        BandwidthSearch::builder()
            .device(follower_params("X4", "W2", "ID2", Polarity::N))
            .downstream(vec![arcstr::literal!("X2"), arcstr::literal!("X3")])
            .f_local(1e6)
            .swing(1.0)
            .w_min(1e-6)
            .w_max(200e-6)
            .build()
            .expect("failed to build search")
    }

    #[test]
    fn test_bisection_meets_gm_target() {
        let oracle = oracle();
        let search = search();
        let (result, params) = search
            .run(&oracle, &amplifier_params())
            .expect("failed to run stage 2");

        // C_downstream = 1 nF/m · (300 um + 100 um).
        assert_relative_eq!(result.c_downstream, 400e-15, max_relative = 1e-12);
        assert_relative_eq!(result.gm_target, 2.0 * PI * 1e6 * 400e-15, max_relative = 1e-12);
        assert_relative_eq!(result.current, result.gm_target * 1.2, max_relative = 1e-12);
        assert!(result.converged);

        // gm = 0.2·sqrt(W·I) at fixed I, so W* = (gm_target / (0.2·sqrt(I)))^2.
        let k = 0.2 * result.current.sqrt();
        let w_star = (result.gm_target / k).powi(2);
        assert_relative_eq!(result.width, w_star, max_relative = 0.0201);

        let tol_w = 0.0199 * w_star;
        let bound = ((search.w_max - search.w_min) / tol_w).log2().ceil() as usize;
        assert!(result.iterations <= bound);

        assert_eq!(params.get("W2_N"), Some(result.width));
        assert_eq!(params.get("ID2_N"), Some(result.current));
    }

    #[test]
    fn test_unreachable_target_warns_with_best_width() {
        let oracle = oracle();
        let mut search = search();
        search.w_max = 2e-6;
        let (result, _) = search
            .run(&oracle, &amplifier_params())
            .expect("failed to run stage 2");
        assert!(!result.converged);
        assert!(result.width <= 2e-6);
        assert!(result.gm < result.gm_target);
    }

    #[test]
    fn test_flavor_detection() {
        let params = amplifier_params();
        assert_eq!(
            FlavorChoice::Auto.resolve(&params, "W2", "ID2").unwrap(),
            Polarity::N
        );

        let p_only: Params = [("W2_P", 10e-6), ("ID2_P", -1e-3)].into_iter().collect();
        assert_eq!(
            FlavorChoice::Auto.resolve(&p_only, "W2", "ID2").unwrap(),
            Polarity::P
        );
        assert!(matches!(
            FlavorChoice::N.resolve(&p_only, "W2", "ID2"),
            Err(SizingError::Config(_))
        ));
        assert!(matches!(
            FlavorChoice::Auto.resolve(&Params::new(), "W2", "ID2"),
            Err(SizingError::Config(_))
        ));

        let device = follower_params("X4", "W2", "ID2", Polarity::P);
        assert_eq!(device.width.as_str(), "W2_P");
        assert_eq!(device.current.as_str(), "ID2_P");
    }
}
