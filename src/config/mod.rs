use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use arcstr::ArcStr;
use serde::{Deserialize, Serialize};

use crate::oracle::ekv::{DeviceBinding, EkvConfig};
use crate::search::bandwidth::FlavorChoice;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmpConfig {
    pub name: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub oracle: EkvConfig,
    /// Baseline parameter assignment shared by all design variants.
    pub params: BTreeMap<ArcStr, f64>,
    pub names: StageNames,
    pub stage1: Stage1Config,
    pub stage2: Stage2Config,
    pub stage3: Stage3Config,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

/// Stable device and parameter names of the amplifier.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StageNames {
    pub input: ArcStr,
    pub input_width: ArcStr,
    pub input_current: ArcStr,
    pub cascode: ArcStr,
    pub cascode_width: ArcStr,
    pub follower: ArcStr,
    /// Follower width parameter without the `_N`/`_P` suffix.
    pub follower_width: ArcStr,
    /// Follower current parameter without the `_N`/`_P` suffix.
    pub follower_current: ArcStr,
    pub push: ArcStr,
    pub push_width: ArcStr,
    pub push_current: ArcStr,
    pub pull: ArcStr,
    pub pull_width: ArcStr,
    pub pull_current: ArcStr,
    /// Noise and transfer source.
    pub source: ArcStr,
    /// Noise and transfer detector.
    pub detector: ArcStr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Config {
    /// White noise floor `A` of the budget [V²/Hz].
    pub noise_floor: f64,
    /// Squared flicker corner `B` of the budget [Hz²].
    pub noise_corner_sq: f64,
    pub margin: f64,
    pub f_min: f64,
    pub f_max: f64,
    #[serde(default = "Stage1Config::default_band_points")]
    pub band_points: usize,
    /// Share of the total width the input device may take.
    pub size_budget: f64,
    pub min_width: f64,
    pub width_points: usize,
    pub current_budget: f64,
    pub current_floor: f64,
    pub current_points: usize,
    #[serde(default = "Stage1Config::default_target_gain")]
    pub target_gain: f64,
    #[serde(default)]
    pub cost_bias: f64,
    pub target_pole: f64,
    #[serde(default = "Stage1Config::default_cascode_step")]
    pub cascode_step: f64,
    pub cascode_min_width: f64,
    #[serde(default = "Stage1Config::default_check_monotonicity")]
    pub check_monotonicity: bool,
    pub workers: Option<usize>,
}

impl Stage1Config {
    fn default_band_points() -> usize {
        10
    }

    fn default_target_gain() -> f64 {
        1.0
    }

    fn default_cascode_step() -> f64 {
        0.85
    }

    fn default_check_monotonicity() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Config {
    #[serde(default)]
    pub polarity: FlavorChoice,
    pub f_local: f64,
    pub swing: f64,
    #[serde(default = "Stage2Config::default_drive_margin")]
    pub drive_margin: f64,
    pub w_min: f64,
    pub w_max: f64,
    #[serde(default = "Stage2Config::default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "Stage2Config::default_max_iter")]
    pub max_iter: usize,
}

impl Stage2Config {
    fn default_drive_margin() -> f64 {
        0.2
    }

    fn default_tolerance() -> f64 {
        0.01
    }

    fn default_max_iter() -> usize {
        40
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage3Config {
    pub gm_quiescent: f64,
    pub gm_peak: f64,
    pub drive_current: f64,
    pub reference_current: f64,
    #[serde(default = "Stage3Config::default_ratio_tolerance")]
    pub ratio_tolerance: f64,
    #[serde(default = "Stage3Config::default_ratio_max_iter")]
    pub ratio_max_iter: usize,
    #[serde(default = "Stage3Config::default_bias_tolerance")]
    pub bias_tolerance: f64,
    #[serde(default = "Stage3Config::default_bias_max_iter")]
    pub bias_max_iter: usize,
    #[serde(default = "Stage3Config::default_ratio_tolerance")]
    pub width_tolerance: f64,
    #[serde(default = "Stage3Config::default_width_max_iter")]
    pub width_max_iter: usize,
    #[serde(default = "Stage3Config::default_grid")]
    pub grid_points_per_decade: u32,
}

impl Stage3Config {
    fn default_ratio_tolerance() -> f64 {
        0.01
    }

    fn default_ratio_max_iter() -> usize {
        10
    }

    fn default_bias_tolerance() -> f64 {
        0.02
    }

    fn default_bias_max_iter() -> usize {
        20
    }

    fn default_width_max_iter() -> usize {
        15
    }

    fn default_grid() -> u32 {
        200
    }
}

/// A named design variant: overrides on top of the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    /// Overrides the follower polarity of `[stage2]`.
    pub polarity: Option<FlavorChoice>,
    #[serde(default)]
    pub params: BTreeMap<ArcStr, f64>,
    /// Parameter names removed from the baseline.
    #[serde(default)]
    pub unset: Vec<ArcStr>,
    #[serde(default)]
    pub devices: BTreeMap<ArcStr, DeviceBinding>,
}

pub fn parse_config(path: impl AsRef<Path>) -> Result<AmpConfig> {
    let contents = fs::read_to_string(path)?;
    let data = toml::from_str(&contents)?;
    Ok(data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_CONFIG: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/ampsizer.toml"));

    #[test]
    fn test_parse_sample_config() {
        let config: AmpConfig = toml::from_str(SAMPLE_CONFIG).expect("failed to parse config");
        assert_eq!(config.names.input.as_str(), "X1");
        assert_eq!(config.stage1.band_points, 10);
        assert_eq!(config.stage1.cascode_step, 0.85);
        assert_eq!(config.stage2.polarity, FlavorChoice::Auto);
        assert_eq!(config.variants.len(), 2);
        assert!(config.oracle.devices.contains_key("X1"));
    }
}
