//! The circuit evaluation interface consumed by the stage searches.
//!
//! An [`Oracle`] answers questions about a circuit for a given parameter
//! assignment. It holds no assignment of its own; every query takes the
//! [`Params`] to evaluate, which lets the stage-1 workers share one oracle
//! while each owns its private assignment.

use std::fmt::Display;

use arcstr::ArcStr;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ekv;
pub mod params;

pub use params::Params;

/// Input-referred noise spectral density in V²/Hz as a function of frequency in Hz.
pub type Spectrum = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// A transfer function of the complex frequency `s`.
pub type Response = Box<dyn Fn(Complex64) -> Complex64 + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("parameter `{0}` is not defined")]
    UnknownParam(ArcStr),

    #[error("device `{0}` is not part of the circuit")]
    UnknownDevice(ArcStr),

    #[error("non-physical {quantity} for device `{device}`: {value:e}")]
    NonPhysical {
        device: ArcStr,
        quantity: Quantity,
        value: f64,
    },

    #[error("no operating point for device `{device}`: {reason}")]
    OperatingPoint { device: ArcStr, reason: String },

    #[error("no path from source `{input}` to detector `{output}`")]
    UnsupportedProbe { input: ArcStr, output: ArcStr },
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Small-signal quantities available per device.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Transconductance [S].
    Gm,
    /// Output conductance [S].
    Go,
    /// Output resistance [Ω].
    Ro,
    /// Input capacitance with shorted output [F].
    Ciss,
    /// Inversion coefficient.
    Ic,
    /// Critical inversion coefficient of the device model.
    IcCrit,
}

impl Quantity {
    pub const ALL: [Quantity; 6] = [
        Quantity::Gm,
        Quantity::Go,
        Quantity::Ro,
        Quantity::Ciss,
        Quantity::IcCrit,
        Quantity::Ic,
    ];

    /// The prefix used when a quantity is addressed as a derived parameter,
    /// e.g. `g_m_X1`.
    pub fn symbol(&self) -> &'static str {
        match self {
            Quantity::Gm => "g_m",
            Quantity::Go => "g_o",
            Quantity::Ro => "r_o",
            Quantity::Ciss => "c_iss",
            Quantity::Ic => "IC",
            Quantity::IcCrit => "IC_CRIT",
        }
    }

    /// Splits a derived parameter name into its quantity and device.
    pub fn parse_derived(name: &str) -> Option<(Quantity, &str)> {
        Self::ALL.iter().find_map(|q| {
            name.strip_prefix(q.symbol())
                .and_then(|rest| rest.strip_prefix('_'))
                .filter(|device| !device.is_empty())
                .map(|device| (*q, device))
        })
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Gain,
    AsymptoticGain,
    LoopGain,
    Servo,
    Direct,
}

/// Channel type of a MOS device.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    N,
    P,
}

impl Polarity {
    /// Sign of the drain current when the device conducts.
    ///
    /// PMOS currents are sourced from the supply and carry a negative sign.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Polarity::N => 1.0,
            Polarity::P => -1.0,
        }
    }

    /// Parameter-name suffix used for this polarity, e.g. the `N` in `W2_N`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Polarity::N => "N",
            Polarity::P => "P",
        }
    }
}

impl Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}MOS", self.suffix())
    }
}

/// Source and detector of a noise or transfer analysis.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Probe {
    pub source: ArcStr,
    pub detector: ArcStr,
}

impl Probe {
    pub fn new(source: impl Into<ArcStr>, detector: impl Into<ArcStr>) -> Self {
        Self {
            source: source.into(),
            detector: detector.into(),
        }
    }
}

pub trait Oracle: Send + Sync {
    fn device_scalar(&self, params: &Params, device: &str, quantity: Quantity) -> EvalResult<f64>;

    fn input_noise(&self, params: &Params, probe: &Probe) -> EvalResult<Spectrum>;

    fn transfer(&self, params: &Params, probe: &Probe, kind: TransferKind) -> EvalResult<Response>;

    /// Resolves a parameter or a derived `<quantity>_<device>` name.
    fn get(&self, params: &Params, name: &str) -> EvalResult<f64> {
        if let Some(value) = params.get(name) {
            return Ok(value);
        }
        match Quantity::parse_derived(name) {
            Some((quantity, device)) => self.device_scalar(params, device, quantity),
            None => Err(EvalError::UnknownParam(ArcStr::from(name))),
        }
    }
}

/// Reads the transconductance of `device`, rejecting non-positive values.
pub fn positive_gm(oracle: &dyn Oracle, params: &Params, device: &str) -> EvalResult<f64> {
    let gm = oracle.device_scalar(params, device, Quantity::Gm)?;
    if gm.is_finite() && gm > 0.0 {
        Ok(gm)
    } else {
        Err(EvalError::NonPhysical {
            device: ArcStr::from(device),
            quantity: Quantity::Gm,
            value: gm,
        })
    }
}
