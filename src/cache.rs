//! Persistent stage 1 results, one TOML file per design variant.
//!
//! Entries never expire; an entry is valid for as long as its file exists.

use std::collections::BTreeMap;
use std::path::Path;

use arcstr::ArcStr;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::oracle::Params;
use crate::search::NoiseStageResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub variant: String,
    pub result: NoiseStageResult,
    /// Solved parameter values, by name.
    pub params: BTreeMap<ArcStr, f64>,
}

impl CacheEntry {
    /// Records `result` together with the values of `names` in `params`.
    /// Names missing from `params` are skipped.
    pub fn new(
        variant: impl Into<String>,
        result: NoiseStageResult,
        params: &Params,
        names: &[ArcStr],
    ) -> Self {
        let params = names
            .iter()
            .filter_map(|name| params.get(name).map(|value| (name.clone(), value)))
            .collect();
        Self {
            variant: variant.into(),
            result,
            params,
        }
    }

    /// Writes the cached parameter values into `params`.
    pub fn apply(&self, params: &mut Params) {
        for (name, value) in self.params.iter() {
            params.set(name.clone(), *value);
        }
    }
}

/// Reads the entry at `path`, or `None` if there is no such file.
pub fn read_cache(path: impl AsRef<Path>) -> Result<Option<CacheEntry>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let entry = toml::from_str(&contents)?;
    info!("read cached stage 1 result from {path:?}");
    Ok(Some(entry))
}

pub fn write_cache(path: impl AsRef<Path>, entry: &CacheEntry) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(entry)?)?;
    info!("wrote stage 1 result for `{}` to {path:?}", entry.variant);
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    use super::*;
    use crate::oracle::ekv::tests::{probe_config, probe_params};
    use crate::oracle::ekv::EkvOracle;
    use crate::oracle::{Oracle, Probe, TransferKind};
    use crate::paths::out_cache;

    fn result() -> NoiseStageResult {
        NoiseStageResult {
            width: 123.456e-6,
            current: 0.8125e-3,
            cascode_width: 31.7e-6,
            ic: 0.734,
            gm: 9.87e-3,
            go: 2.3e-4,
            ciss: 1.2e-13,
            gain: 42.9,
            cost: 0.0172,
            pole: 2.5e9,
            worst_noise_ratio: 0.93,
        }
    }

    fn names() -> Vec<ArcStr> {
        ["W1_N", "ID1_N", "W1C_N"].into_iter().map(ArcStr::from).collect()
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = out_cache(dir.path(), "n_follower");
        assert_eq!(read_cache(&path).expect("failed to read cache"), None);

        let params = probe_params()
            .with("W1_N", 123.456e-6)
            .with("ID1_N", 0.8125e-3)
            .with("W1C_N", 31.7e-6);
        let entry = CacheEntry::new("n_follower", result(), &params, &names());
        write_cache(&path, &entry).expect("failed to write cache");

        let read = read_cache(&path)
            .expect("failed to read cache")
            .expect("cache entry missing");
        assert_eq!(read.variant, "n_follower");
        assert_eq!(read.params.len(), 3);
        let (a, b) = (read.result, entry.result);
        for (x, y) in [
            (a.width, b.width),
            (a.current, b.current),
            (a.cascode_width, b.cascode_width),
            (a.ic, b.ic),
            (a.gm, b.gm),
            (a.go, b.go),
            (a.ciss, b.ciss),
            (a.gain, b.gain),
            (a.cost, b.cost),
            (a.pole, b.pole),
            (a.worst_noise_ratio, b.worst_noise_ratio),
        ] {
            assert_relative_eq!(x, y, max_relative = 1e-15);
        }
    }

    #[test]
    fn test_reapplied_entry_reproduces_loop_gain() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = out_cache(dir.path(), "variant");
        let oracle = EkvOracle::new(probe_config());
        let probe = Probe::new("V1", "V_vo");

        let solved = probe_params()
            .with("W1_N", 123.456e-6)
            .with("ID1_N", 0.8125e-3)
            .with("W1C_N", 31.7e-6);
        write_cache(&path, &CacheEntry::new("variant", result(), &solved, &names()))
            .expect("failed to write cache");

        let mut fresh = probe_params();
        read_cache(&path)
            .expect("failed to read cache")
            .expect("cache entry missing")
            .apply(&mut fresh);

        let want = oracle
            .transfer(&solved, &probe, TransferKind::Gain)
            .expect("failed to evaluate gain");
        let got = oracle
            .transfer(&fresh, &probe, TransferKind::Gain)
            .expect("failed to evaluate gain");
        for f in [1e3, 1e6, 1e8] {
            let s = Complex64::new(0.0, 2.0 * std::f64::consts::PI * f);
            assert_relative_eq!(got(s).re, want(s).re, max_relative = 1e-12);
            assert_relative_eq!(got(s).im, want(s).im, max_relative = 1e-12);
        }
    }
}
