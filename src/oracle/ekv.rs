//! An analytic oracle for the three-stage amplifier built on the EKV
//! inversion-coefficient device model.
//!
//! Device quantities follow the usual all-region EKV expressions:
//!
//! ```text
//! IC   = |I_D| / (I_spec,sq · W / L)
//! g_m  = |I_D| / (n·U_T) · 2 / (1 + sqrt(1 + 4·IC))
//! r_o  = V_A,L · L / |I_D|
//! ```
//!
//! The amplifier model chains the input stage (cascoded, loaded by the
//! follower input), the follower (loaded by the output pair) and the
//! push-pull output stage into a three-pole loop gain.

use std::collections::BTreeMap;

use arcstr::ArcStr;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::{
    EvalError, EvalResult, Oracle, Params, Polarity, Probe, Quantity, Response, Spectrum,
    TransferKind,
};

/// Boltzmann constant [J/K].
pub const BOLTZMANN: f64 = 1.380649e-23;
/// Elementary charge [C].
pub const ELECTRON_CHARGE: f64 = 1.602176634e-19;

fn default_gamma() -> f64 {
    2.0 / 3.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub polarity: Polarity,
    /// Subthreshold slope factor.
    pub n: f64,
    /// Specific current of a square device [A].
    pub i_spec_sq: f64,
    /// Gate oxide capacitance per unit area [F/m²].
    pub cox: f64,
    /// Gate overlap capacitance per unit width [F/m].
    #[serde(default)]
    pub cgo: f64,
    /// Early voltage per unit channel length [V/m].
    pub va_per_l: f64,
    /// Flicker noise coefficient [V²·F].
    pub kf: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    pub ic_crit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub model: String,
    /// Name of the width parameter.
    pub width: ArcStr,
    /// Name of the drain current parameter.
    pub current: ArcStr,
    /// Channel length [m].
    pub length: f64,
}

/// Roles of the devices in the three-stage amplifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub input: ArcStr,
    pub cascode: ArcStr,
    pub follower: ArcStr,
    pub push: ArcStr,
    pub pull: ArcStr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EkvConfig {
    /// Temperature [K].
    #[serde(default = "EkvConfig::default_temperature")]
    pub temperature: f64,
    /// Ideal closed-loop gain set by the feedback network.
    pub closed_loop_gain: f64,
    /// Resistance seen by the output stage [Ω].
    pub load_resistance: f64,
    /// Capacitance at the amplifier output [F].
    pub load_capacitance: f64,
    pub source: ArcStr,
    pub detector: ArcStr,
    pub topology: Topology,
    pub models: BTreeMap<String, ProcessModel>,
    pub devices: BTreeMap<ArcStr, DeviceBinding>,
}

impl EkvConfig {
    fn default_temperature() -> f64 {
        300.0
    }
}

/// Small-signal operating point of one device.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct OperatingPoint {
    pub gm: f64,
    pub ro: f64,
    pub ciss: f64,
    pub ic: f64,
    pub ic_crit: f64,
    pub width: f64,
    pub length: f64,
}

impl OperatingPoint {
    fn quantity(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Gm => self.gm,
            Quantity::Go => 1.0 / self.ro,
            Quantity::Ro => self.ro,
            Quantity::Ciss => self.ciss,
            Quantity::Ic => self.ic,
            Quantity::IcCrit => self.ic_crit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EkvOracle {
    config: EkvConfig,
}

impl EkvOracle {
    pub fn new(config: EkvConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &EkvConfig {
        &self.config
    }

    /// Thermal voltage kT/q [V].
    #[inline]
    pub fn thermal_voltage(&self) -> f64 {
        BOLTZMANN * self.config.temperature / ELECTRON_CHARGE
    }

    fn binding(&self, device: &str) -> EvalResult<(&DeviceBinding, &ProcessModel)> {
        let binding = self
            .config
            .devices
            .get(device)
            .ok_or_else(|| EvalError::UnknownDevice(ArcStr::from(device)))?;
        let model =
            self.config
                .models
                .get(&binding.model)
                .ok_or_else(|| EvalError::OperatingPoint {
                    device: ArcStr::from(device),
                    reason: format!("unknown process model `{}`", binding.model),
                })?;
        Ok((binding, model))
    }

    pub fn operating_point(&self, params: &Params, device: &str) -> EvalResult<OperatingPoint> {
        let (binding, model) = self.binding(device)?;
        let width = params
            .get(&binding.width)
            .ok_or_else(|| EvalError::UnknownParam(binding.width.clone()))?;
        let id = params
            .get(&binding.current)
            .ok_or_else(|| EvalError::UnknownParam(binding.current.clone()))?;

        if !(width > 0.0) || !(binding.length > 0.0) {
            return Err(EvalError::OperatingPoint {
                device: ArcStr::from(device),
                reason: format!("non-positive geometry W={width:e} L={:e}", binding.length),
            });
        }
        let current = id * model.polarity.sign();
        if !(current > 0.0) {
            return Err(EvalError::OperatingPoint {
                device: ArcStr::from(device),
                reason: format!(
                    "drain current {id:e} A has the wrong sign for a {} device",
                    model.polarity
                ),
            });
        }

        let ut = self.thermal_voltage();
        let length = binding.length;
        let ic = current / (model.i_spec_sq * width / length);
        let gm = current / (model.n * ut) * 2.0 / (1.0 + (1.0 + 4.0 * ic).sqrt());
        let ro = model.va_per_l * length / current;
        let sic = ic.sqrt();
        let ciss = model.cox * width * length * (1.0 + sic / (1.0 + sic)) / 3.0 + model.cgo * width;

        Ok(OperatingPoint {
            gm,
            ro,
            ciss,
            ic,
            ic_crit: model.ic_crit,
            width,
            length,
        })
    }

    fn check_probe(&self, probe: &Probe) -> EvalResult<()> {
        if probe.source == self.config.source && probe.detector == self.config.detector {
            Ok(())
        } else {
            Err(EvalError::UnsupportedProbe {
                input: probe.source.clone(),
                output: probe.detector.clone(),
            })
        }
    }

    /// Output resistance of the cascoded input stage.
    fn input_stage_resistance(&self, input: &OperatingPoint, cascode: &OperatingPoint) -> f64 {
        0.5 * input.ro * cascode.gm * cascode.ro
    }

    /// DC loop gain and the three loop poles in rad/s.
    fn loop_model(&self, params: &Params) -> EvalResult<(f64, [f64; 3])> {
        let topo = &self.config.topology;
        let input = self.operating_point(params, &topo.input)?;
        let cascode = self.operating_point(params, &topo.cascode)?;
        let follower = self.operating_point(params, &topo.follower)?;
        let push = self.operating_point(params, &topo.push)?;
        let pull = self.operating_point(params, &topo.pull)?;

        let r1 = self.input_stage_resistance(&input, &cascode);
        let a1 = input.gm * r1;
        let a2 = follower.gm / (follower.gm + 1.0 / follower.ro);
        let a3 = (push.gm + pull.gm) * self.config.load_resistance;
        let beta = 1.0 / self.config.closed_loop_gain;

        let poles = [
            1.0 / (r1 * follower.ciss),
            follower.gm / (push.ciss + pull.ciss),
            1.0 / (self.config.load_resistance * self.config.load_capacitance),
        ];
        Ok((-beta * a1 * a2 * a3, poles))
    }

    fn loop_gain(
        &self,
        params: &Params,
    ) -> EvalResult<impl Fn(Complex64) -> Complex64 + Send + Sync + Copy> {
        let (l0, poles) = self.loop_model(params)?;
        Ok(move |s: Complex64| {
            poles
                .iter()
                .fold(Complex64::new(l0, 0.0), |acc, p| acc / (1.0 + s / *p))
        })
    }
}

impl Oracle for EkvOracle {
    fn device_scalar(&self, params: &Params, device: &str, quantity: Quantity) -> EvalResult<f64> {
        if quantity == Quantity::IcCrit {
            let (_, model) = self.binding(device)?;
            return Ok(model.ic_crit);
        }
        Ok(self.operating_point(params, device)?.quantity(quantity))
    }

    fn input_noise(&self, params: &Params, probe: &Probe) -> EvalResult<Spectrum> {
        self.check_probe(probe)?;
        let topo = &self.config.topology;
        let (_, input_model) = self.binding(&topo.input)?;
        let (_, follower_model) = self.binding(&topo.follower)?;
        let input = self.operating_point(params, &topo.input)?;
        let cascode = self.operating_point(params, &topo.cascode)?;
        let follower = self.operating_point(params, &topo.follower)?;

        let four_kt = 4.0 * BOLTZMANN * self.config.temperature;
        let thermal = four_kt * input_model.n * input_model.gamma / input.gm;
        let flicker = input_model.kf / (input_model.cox * input.width * input.length);
        let a1 = input.gm * self.input_stage_resistance(&input, &cascode);
        let follower_thermal =
            four_kt * follower_model.n * follower_model.gamma / follower.gm / (a1 * a1);

        Ok(Box::new(move |f: f64| {
            thermal + follower_thermal + flicker / f
        }))
    }

    fn transfer(&self, params: &Params, probe: &Probe, kind: TransferKind) -> EvalResult<Response> {
        self.check_probe(probe)?;
        let a_inf = self.config.closed_loop_gain;
        let response: Response = match kind {
            TransferKind::AsymptoticGain => Box::new(move |_: Complex64| Complex64::new(a_inf, 0.0)),
            TransferKind::Direct => Box::new(|_: Complex64| Complex64::new(0.0, 0.0)),
            TransferKind::LoopGain => Box::new(self.loop_gain(params)?),
            TransferKind::Servo => {
                let loop_gain = self.loop_gain(params)?;
                Box::new(move |s: Complex64| {
                    let l = loop_gain(s);
                    -l / (1.0 - l)
                })
            }
            TransferKind::Gain => {
                let loop_gain = self.loop_gain(params)?;
                Box::new(move |s: Complex64| {
                    let l = loop_gain(s);
                    a_inf * -l / (1.0 - l)
                })
            }
        };
        Ok(response)
    }
}
