use std::fmt::Display;

use arcstr::ArcStr;
use serde::{Deserialize, Serialize};

use crate::error::SizingError;
use crate::oracle::{EvalError, EvalResult, Params, Polarity};

pub mod bandwidth;
pub mod matched;
pub mod noise;
pub mod solver;
pub mod sweep;

pub use bandwidth::{BandwidthSearch, BandwidthStageResult};
pub use matched::{MatchedBiasSearch, MatchedStageResult};
pub use noise::{NoiseBudget, NoiseSearch, NoiseStageResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Noise-critical input stage.
    Input,
    /// Bandwidth-setting follower.
    Follower,
    /// Class-AB push-pull output stage.
    Output,
}

impl Stage {
    pub fn number(&self) -> usize {
        match self {
            Stage::Input => 1,
            Stage::Follower => 2,
            Stage::Output => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Follower => "follower",
            Stage::Output => "output",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.as_str())
    }
}

/// A scored (width, current) candidate.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPoint {
    pub width: f64,
    pub current: f64,
    pub ic: f64,
    pub gm: f64,
    pub go: f64,
    pub ciss: f64,
    /// Intrinsic gain `gm / go`.
    pub gain: f64,
    pub cost: f64,
}

/// The stable parameter names of one sized device.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Device name as known to the oracle.
    pub device: ArcStr,
    pub width: ArcStr,
    pub current: ArcStr,
    pub polarity: Polarity,
}

impl DeviceParams {
    pub fn new(
        device: impl Into<ArcStr>,
        width: impl Into<ArcStr>,
        current: impl Into<ArcStr>,
        polarity: Polarity,
    ) -> Self {
        Self {
            device: device.into(),
            width: width.into(),
            current: current.into(),
            polarity,
        }
    }

    pub fn width(&self, params: &Params) -> EvalResult<f64> {
        params
            .get(&self.width)
            .ok_or_else(|| EvalError::UnknownParam(self.width.clone()))
    }

    /// Current magnitude, i.e. the stored value with the polarity sign removed.
    pub fn current(&self, params: &Params) -> EvalResult<f64> {
        params
            .get(&self.current)
            .map(|i| i * self.polarity.sign())
            .ok_or_else(|| EvalError::UnknownParam(self.current.clone()))
    }

    pub fn set_width(&self, params: &mut Params, width: f64) {
        params.set(self.width.clone(), width);
    }

    /// Stores the current magnitude `current` with the sign of the polarity.
    pub fn set_current(&self, params: &mut Params, current: f64) {
        params.set(self.current.clone(), current * self.polarity.sign());
    }
}

/// Maps an evaluation error that ends a stage search to the stage failure.
pub(crate) fn no_viable(stage: Stage) -> impl Fn(EvalError) -> SizingError {
    move |e| SizingError::NoViableCandidate {
        stage,
        reason: e.to_string(),
    }
}
