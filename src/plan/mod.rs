use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use arcstr::ArcStr;
use itertools::Itertools;
use log::{error, info};

use crate::cache::{read_cache, write_cache, CacheEntry};
use crate::cli::progress::StepContext;
use crate::config::{AmpConfig, Stage1Config, StageNames, VariantConfig};
use crate::error::SizingError;
use crate::oracle::ekv::{EkvConfig, EkvOracle};
use crate::oracle::{Params, Polarity, Probe};
use crate::paths::out_cache;
use crate::report::{save_summary, LoopPerformance, RunSummary};
use crate::search::bandwidth::follower_params;
use crate::search::noise::{current_sweep, max_width, width_sweep};
use crate::search::solver::Convergence;
use crate::search::sweep::GeometricGrid;
use crate::search::{
    BandwidthSearch, BandwidthStageResult, DeviceParams, MatchedBiasSearch, MatchedStageResult,
    NoiseBudget, NoiseSearch, NoiseStageResult, Stage,
};
use crate::Result;

/// A concrete plan for one run: every design variant with its searches.
pub struct AmpPlan {
    pub name: String,
    pub cache_dir: PathBuf,
    pub variants: Vec<VariantPlan>,
}

/// A design variant resolved against the baseline.
pub struct VariantPlan {
    pub name: String,
    pub oracle: EkvConfig,
    pub params: Params,
    pub names: StageNames,
    pub matched: MatchedBiasSearch,
    pub bandwidth: BandwidthSearch,
    /// Stage 1 depends on the stage 3 result and is built once that is known.
    pub stage1: Stage1Config,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKey {
    GeneratePlan,
    SizeOutputStage,
    SizeFollowerStage,
    SizeInputStage,
    WriteSummary,
}

impl TaskKey {
    pub const VARIANT: [TaskKey; 4] = [
        TaskKey::SizeOutputStage,
        TaskKey::SizeFollowerStage,
        TaskKey::SizeInputStage,
        TaskKey::WriteSummary,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            TaskKey::GeneratePlan => "Generate plan",
            TaskKey::SizeOutputStage => "Size output stage",
            TaskKey::SizeFollowerStage => "Size follower stage",
            TaskKey::SizeInputStage => "Size input stage",
            TaskKey::WriteSummary => "Write summary",
        }
    }
}

/// How the stage 1 cache is used.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Use a cached result if present, otherwise search and cache.
    #[default]
    ReadWrite,
    /// Require a cached result.
    Only,
    /// Always search, then overwrite the cache.
    Refresh,
}

pub struct ExecutePlanParams<'a> {
    pub work_dir: &'a Path,
    pub plan: &'a AmpPlan,
    pub cache: CacheMode,
    pub workers: Option<usize>,
}

pub struct ExecuteVariantParams<'a> {
    pub work_dir: &'a Path,
    pub cache_dir: &'a Path,
    pub run: &'a str,
    pub variant: &'a VariantPlan,
    pub cache: CacheMode,
    pub workers: Option<usize>,
    pub ctx: Option<&'a mut StepContext>,
}

#[derive(Debug, Clone)]
pub struct VariantOutcome {
    pub name: String,
    pub output_stage: MatchedStageResult,
    pub follower_stage: BandwidthStageResult,
    pub input_stage: NoiseStageResult,
    pub input_stage_cached: bool,
    pub params: Params,
}

pub fn generate_plan(config: &AmpConfig, variant: Option<&str>) -> Result<AmpPlan> {
    validate(config)?;

    let variants = if config.variants.is_empty() {
        vec![VariantConfig {
            name: config.name.clone(),
            polarity: None,
            params: Default::default(),
            unset: Vec::new(),
            devices: Default::default(),
        }]
    } else {
        config.variants.clone()
    };

    let mut seen = HashSet::new();
    for v in variants.iter() {
        if v.name.is_empty() {
            bail!("Design variant names must not be empty");
        }
        if !seen.insert(v.name.as_str()) {
            bail!("Design variant `{}` is defined more than once", v.name);
        }
    }

    let variants = variants
        .iter()
        .filter(|v| variant.map_or(true, |name| v.name == name))
        .map(|v| plan_variant(config, v))
        .collect::<Result<Vec<_>>>()?;
    if variants.is_empty() {
        if let Some(name) = variant {
            bail!("No design variant named `{name}`");
        }
    }

    Ok(AmpPlan {
        name: config.name.clone(),
        cache_dir: config.cache_dir.clone(),
        variants,
    })
}

fn validate(config: &AmpConfig) -> Result<()> {
    let s1 = &config.stage1;
    if !(s1.margin > 0.0 && s1.margin < 1.0) {
        bail!("The noise margin must lie in (0, 1)");
    }
    if !(s1.size_budget > 0.0 && s1.size_budget < 1.0) {
        bail!("The input stage size budget must lie in (0, 1)");
    }
    if !(s1.f_min > 0.0 && s1.f_min < s1.f_max) {
        bail!("The noise band must satisfy 0 < f_min < f_max");
    }
    if !(s1.current_floor > 0.0 && s1.current_floor < s1.current_budget) {
        bail!("The current grid must satisfy 0 < current_floor < current_budget");
    }
    if s1.band_points == 0 || s1.width_points == 0 || s1.current_points == 0 {
        bail!("Stage 1 grids need at least one point each");
    }
    if !(s1.min_width > 0.0 && s1.cascode_min_width > 0.0) {
        bail!("Minimum widths must be positive");
    }
    if !(s1.cascode_step > 0.0 && s1.cascode_step < 1.0) {
        bail!("The cascode step must lie in (0, 1)");
    }
    if s1.target_pole <= 0.0 || s1.target_gain <= 0.0 {
        bail!("The target pole frequency and target gain must be positive");
    }
    if s1.workers == Some(0) {
        bail!("At least one worker is required");
    }

    let s2 = &config.stage2;
    if !(s2.w_min > 0.0 && s2.w_min < s2.w_max) {
        bail!("The follower width bounds must satisfy 0 < w_min < w_max");
    }
    if s2.f_local <= 0.0 || s2.swing <= 0.0 || s2.drive_margin < 0.0 {
        bail!("The follower bandwidth and swing must be positive");
    }
    if s2.tolerance <= 0.0 || s2.max_iter == 0 {
        bail!("The follower search needs a positive tolerance and iteration cap");
    }

    let s3 = &config.stage3;
    if s3.gm_quiescent <= 0.0 || s3.gm_peak <= 0.0 {
        bail!("Output stage transconductance targets must be positive");
    }
    if s3.drive_current <= 0.0 || s3.reference_current <= 0.0 {
        bail!("Output stage drive and reference currents must be positive");
    }
    if s3.grid_points_per_decade == 0 {
        bail!("The output stage width grid needs at least one point per decade");
    }
    Ok(())
}

fn plan_variant(config: &AmpConfig, variant: &VariantConfig) -> Result<VariantPlan> {
    let names = &config.names;

    let mut params: Params = config.params.clone().into_iter().collect();
    let overrides: Params = variant.params.clone().into_iter().collect();
    params.extend_from(&overrides);
    for name in variant.unset.iter() {
        params.unset(name);
    }

    let mut oracle = config.oracle.clone();
    oracle
        .devices
        .extend(variant.devices.iter().map(|(k, v)| (k.clone(), v.clone())));

    let missing = [
        &names.input_width,
        &names.input_current,
        &names.cascode_width,
        &names.push_width,
        &names.push_current,
        &names.pull_width,
        &names.pull_current,
    ]
    .into_iter()
    .filter(|name| !params.contains(name))
    .join("`, `");
    if !missing.is_empty() {
        bail!(
            "Design variant `{}` has no value for parameters `{missing}`",
            variant.name
        );
    }

    let polarity = variant
        .polarity
        .unwrap_or(config.stage2.polarity)
        .resolve(&params, &names.follower_width, &names.follower_current)
        .with_context(|| format!("Design variant `{}`", variant.name))?;

    let s3 = &config.stage3;
    let matched = MatchedBiasSearch::builder()
        .push(DeviceParams::new(
            names.push.clone(),
            names.push_width.clone(),
            names.push_current.clone(),
            Polarity::P,
        ))
        .pull(DeviceParams::new(
            names.pull.clone(),
            names.pull_width.clone(),
            names.pull_current.clone(),
            Polarity::N,
        ))
        .gm_quiescent(s3.gm_quiescent)
        .gm_peak(s3.gm_peak)
        .drive_current(s3.drive_current)
        .reference_current(s3.reference_current)
        .ratio_conv(Convergence::new(s3.ratio_tolerance, s3.ratio_max_iter))
        .bias_conv(Convergence::new(s3.bias_tolerance, s3.bias_max_iter))
        .width_conv(Convergence::new(s3.width_tolerance, s3.width_max_iter))
        .grid(GeometricGrid::new(s3.grid_points_per_decade))
        .build()?;

    let s2 = &config.stage2;
    let bandwidth = BandwidthSearch::builder()
        .device(follower_params(
            &names.follower,
            &names.follower_width,
            &names.follower_current,
            polarity,
        ))
        .downstream(vec![names.push.clone(), names.pull.clone()])
        .f_local(s2.f_local)
        .swing(s2.swing)
        .drive_margin(s2.drive_margin)
        .w_min(s2.w_min)
        .w_max(s2.w_max)
        .conv(Convergence::new(s2.tolerance, s2.max_iter))
        .build()?;

    Ok(VariantPlan {
        name: variant.name.clone(),
        oracle,
        params,
        names: names.clone(),
        matched,
        bandwidth,
        stage1: config.stage1.clone(),
    })
}

impl VariantPlan {
    /// Builds the stage 1 search, normalized by the stage 3 result.
    pub fn noise_search(
        &self,
        output_stage: &MatchedStageResult,
        workers: Option<usize>,
    ) -> Result<NoiseSearch> {
        let s1 = &self.stage1;
        let names = &self.names;
        let w_max = max_width(output_stage.push_width + output_stage.pull_width, s1.size_budget);
        if 0.99 * w_max <= s1.min_width {
            bail!(
                "The input stage width budget ({w_max:.3e} m) is below the minimum width ({:.3e} m)",
                s1.min_width
            );
        }

        Ok(NoiseSearch::builder()
            .device(DeviceParams::new(
                names.input.clone(),
                names.input_width.clone(),
                names.input_current.clone(),
                Polarity::N,
            ))
            .cascode(DeviceParams::new(
                names.cascode.clone(),
                names.cascode_width.clone(),
                names.input_current.clone(),
                Polarity::N,
            ))
            .downstream(names.follower.clone())
            .probe(self.probe())
            .budget(NoiseBudget {
                a: s1.noise_floor,
                b: s1.noise_corner_sq,
                margin: s1.margin,
            })
            .f_min(s1.f_min)
            .f_max(s1.f_max)
            .band_points(s1.band_points)
            .widths(width_sweep(w_max, s1.min_width, s1.width_points))
            .currents(current_sweep(s1.current_budget, s1.current_floor, s1.current_points))
            .reference_width(output_stage.push_width)
            .reference_current(output_stage.quiescent_current)
            .target_gain(s1.target_gain)
            .cost_bias(s1.cost_bias)
            .target_pole(s1.target_pole)
            .cascode_step(s1.cascode_step)
            .cascode_min_width(s1.cascode_min_width)
            .workers(workers.or(s1.workers))
            .check_monotonicity(s1.check_monotonicity)
            .build()?)
    }

    pub fn probe(&self) -> Probe {
        Probe::new(self.names.source.clone(), self.names.detector.clone())
    }

    /// Parameters written by stage 1, as stored in the cache.
    fn stage1_params(&self) -> Vec<ArcStr> {
        vec![
            self.names.input_width.clone(),
            self.names.input_current.clone(),
            self.names.cascode_width.clone(),
        ]
    }
}

macro_rules! try_finish_task {
    ( $ctx:expr, $task:expr ) => {
        if let Some(ctx) = $ctx.as_mut() {
            ctx.finish($task);
        }
    };
}

/// Runs every variant of `plan` in order, stopping at the first failure.
pub fn execute_plan(params: ExecutePlanParams) -> Result<Vec<VariantOutcome>> {
    let ExecutePlanParams {
        work_dir,
        plan,
        cache,
        workers,
    } = params;

    plan.variants
        .iter()
        .map(|variant| {
            execute_variant(ExecuteVariantParams {
                work_dir,
                cache_dir: &plan.cache_dir,
                run: &plan.name,
                variant,
                cache,
                workers,
                ctx: None,
            })
        })
        .collect()
}

/// Sizes one variant: stage 3, then stage 2, then stage 1, then writes the
/// summary. A failing stage aborts the variant after a failure summary is
/// written.
pub fn execute_variant(params: ExecuteVariantParams) -> Result<VariantOutcome> {
    let ExecuteVariantParams {
        work_dir,
        cache_dir,
        run,
        variant,
        cache,
        workers,
        mut ctx,
    } = params;

    std::fs::create_dir_all(work_dir)?;
    info!("sizing design variant `{}`", variant.name);
    let oracle = EkvOracle::new(variant.oracle.clone());

    let mut summary = RunSummary {
        run: run.to_string(),
        variant: variant.name.clone(),
        success: false,
        error: None,
        output_stage: None,
        follower_stage: None,
        input_stage: None,
        input_stage_cached: false,
        performance: None,
        params: variant.params.clone(),
    };

    let res = (|| -> Result<VariantOutcome> {
        let (output_stage, params) = variant.matched.run(&oracle, &variant.params)?;
        summary.output_stage = Some(output_stage.clone());
        summary.params = params.clone();
        try_finish_task!(ctx, TaskKey::SizeOutputStage);

        let (follower_stage, params) = variant.bandwidth.run(&oracle, &params)?;
        summary.follower_stage = Some(follower_stage.clone());
        summary.params = params.clone();
        try_finish_task!(ctx, TaskKey::SizeFollowerStage);

        let cache_path = out_cache(cache_dir, &variant.name);
        let cached = match cache {
            CacheMode::Refresh => None,
            CacheMode::ReadWrite | CacheMode::Only => read_cache(&cache_path)?,
        };
        let (input_stage, params, input_stage_cached) = match (cached, cache) {
            (Some(entry), _) => {
                info!(
                    "{}: using cached result for `{}` from {cache_path:?}",
                    Stage::Input,
                    variant.name
                );
                let mut params = params;
                entry.apply(&mut params);
                (entry.result, params, true)
            }
            (None, CacheMode::Only) => {
                return Err(SizingError::CacheMiss {
                    stage: Stage::Input,
                    variant: variant.name.clone(),
                    path: cache_path,
                }
                .into());
            }
            (None, _) => {
                let search = variant.noise_search(&output_stage, workers)?;
                let (input_stage, params) = search.run(&oracle, &params)?;
                let entry = CacheEntry::new(
                    variant.name.clone(),
                    input_stage,
                    &params,
                    &variant.stage1_params(),
                );
                write_cache(&cache_path, &entry)?;
                (input_stage, params, false)
            }
        };
        summary.input_stage = Some(input_stage);
        summary.input_stage_cached = input_stage_cached;
        summary.params = params.clone();
        try_finish_task!(ctx, TaskKey::SizeInputStage);

        Ok(VariantOutcome {
            name: variant.name.clone(),
            output_stage,
            follower_stage,
            input_stage,
            input_stage_cached,
            params,
        })
    })();

    let res = res.and_then(|outcome| {
        let performance = LoopPerformance::evaluate(&oracle, &outcome.params, &variant.probe())?;
        Ok((outcome, performance))
    });

    match res {
        Ok((outcome, performance)) => {
            summary.success = true;
            summary.performance = Some(performance);
            save_summary(work_dir, &summary)?;
            try_finish_task!(ctx, TaskKey::WriteSummary);
            info!("design variant `{}` sized successfully", variant.name);
            Ok(outcome)
        }
        Err(e) => {
            error!("design variant `{}` failed: {e:#}", variant.name);
            summary.error = Some(format!("{e:#}"));
            if let Err(write) = save_summary(work_dir, &summary) {
                error!(
                    "failed to write the failure summary of `{}`: {write:#}",
                    variant.name
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::tests::SAMPLE_CONFIG;
    use crate::oracle::EvalError;
    use crate::paths::{out_json, out_summary};
    use crate::search::bandwidth::FlavorChoice;
    use crate::tests::test_work_dir;

    fn config() -> AmpConfig {
        toml::from_str(SAMPLE_CONFIG).expect("failed to parse config")
    }

    fn variant_stage1_names(config: &AmpConfig) -> [ArcStr; 3] {
        [
            config.names.input_width.clone(),
            config.names.input_current.clone(),
            config.names.cascode_width.clone(),
        ]
    }

    #[test]
    fn test_generate_plan_resolves_variants() {
        let plan = generate_plan(&config(), None).expect("failed to generate plan");
        assert_eq!(plan.variants.len(), 2);

        let n = &plan.variants[0];
        assert_eq!(n.bandwidth.device.polarity, Polarity::N);
        assert_eq!(n.bandwidth.device.width.as_str(), "W2_N");

        let p = &plan.variants[1];
        assert_eq!(p.params.get("W2_P"), Some(40e-6));
        assert_eq!(p.params.get("W1_N"), n.params.get("W1_N"));
        assert_eq!(p.bandwidth.device.polarity, Polarity::P);
        assert_eq!(p.bandwidth.device.current.as_str(), "ID2_P");
        assert!(!p.params.contains("W2_N"));
        assert_eq!(p.oracle.devices["X4"].width.as_str(), "W2_P");
    }

    #[test]
    fn test_generate_plan_rejects_bad_config() {
        let mut bad = config();
        bad.stage1.margin = 1.5;
        assert!(generate_plan(&bad, None).is_err());

        let mut bad = config();
        bad.stage2.w_min = bad.stage2.w_max;
        assert!(generate_plan(&bad, None).is_err());

        let mut bad = config();
        bad.variants[1].polarity = Some(FlavorChoice::N);
        assert!(generate_plan(&bad, None).is_err());

        let mut bad = config();
        bad.variants[1].name = bad.variants[0].name.clone();
        assert!(generate_plan(&bad, None).is_err());

        assert!(generate_plan(&config(), Some("missing")).is_err());
    }

    #[test]
    fn test_cache_only_miss_is_fatal() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = config();
        config.cache_dir = dir.path().join("cache");
        let plan = generate_plan(&config, Some("n_follower")).expect("failed to generate plan");

        let err = execute_plan(ExecutePlanParams {
            work_dir: dir.path(),
            plan: &plan,
            cache: CacheMode::Only,
            workers: Some(2),
        })
        .expect_err("cache-only run without a cache should fail");
        let err = err
            .downcast_ref::<SizingError>()
            .expect("expected a sizing error");
        assert!(matches!(err, SizingError::CacheMiss { .. }));
        assert!(err.to_string().contains("--cache-only"));

        let text = std::fs::read_to_string(out_summary(dir.path(), "n_follower"))
            .expect("failed to read summary");
        assert!(text.contains("FAILURE"));
    }

    #[test]
    fn test_failure_summary_write_error_keeps_stage_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = config();
        config.cache_dir = dir.path().join("cache");
        let plan = generate_plan(&config, Some("n_follower")).expect("failed to generate plan");
        // A directory in place of the summary file makes the write fail.
        std::fs::create_dir_all(out_summary(dir.path(), "n_follower"))
            .expect("failed to create directory");

        let err = execute_plan(ExecutePlanParams {
            work_dir: dir.path(),
            plan: &plan,
            cache: CacheMode::Only,
            workers: Some(2),
        })
        .expect_err("cache-only run without a cache should fail");
        assert!(matches!(
            err.downcast_ref::<SizingError>(),
            Some(SizingError::CacheMiss { .. })
        ));
    }

    #[test]
    fn test_loop_evaluation_failure_writes_failure_summary() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = config();
        config.cache_dir = dir.path().join("cache");
        let mut plan = generate_plan(&config, Some("n_follower")).expect("failed to generate plan");
        let variant = &mut plan.variants[0];

        let result = NoiseStageResult {
            width: 100e-6,
            current: 1e-3,
            cascode_width: 100e-6,
            ic: 1.0,
            gm: 5e-3,
            go: 3e-4,
            ciss: 1e-13,
            gain: 18.0,
            cost: 1.0,
            pole: 1e10,
            worst_noise_ratio: 0.5,
        };
        let entry = CacheEntry::new(
            variant.name.clone(),
            result,
            &variant.params,
            &variant.stage1_params(),
        );
        write_cache(out_cache(&config.cache_dir, &variant.name), &entry)
            .expect("failed to write cache");
        // The loop evaluation is the only step that probes this detector.
        variant.names.detector = arcstr::literal!("V_missing");

        let err = execute_plan(ExecutePlanParams {
            work_dir: dir.path(),
            plan: &plan,
            cache: CacheMode::Only,
            workers: Some(2),
        })
        .expect_err("loop evaluation should fail");
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::UnsupportedProbe { .. })
        ));

        let text = std::fs::read_to_string(out_summary(dir.path(), "n_follower"))
            .expect("failed to read summary");
        assert!(text.contains("FAILURE"));
        assert!(text.contains("V_missing"));
        assert!(text.contains("Stage 1 (input, cached)"));
    }

    #[test]
    fn test_execute_plan_writes_and_reuses_cache() {
        let work_dir = test_work_dir("test_execute_plan_writes_and_reuses_cache");
        let mut config = config();
        config.cache_dir = work_dir.join("cache");
        let plan = generate_plan(&config, None).expect("failed to generate plan");

        let fresh = execute_plan(ExecutePlanParams {
            work_dir: &work_dir,
            plan: &plan,
            cache: CacheMode::Refresh,
            workers: Some(2),
        })
        .expect("failed to execute plan");
        assert_eq!(fresh.len(), 2);
        for outcome in fresh.iter() {
            assert!(!outcome.input_stage_cached);
            assert!(out_cache(&config.cache_dir, &outcome.name).exists());
            assert!(out_json(&work_dir, &outcome.name).exists());
            assert!(outcome.input_stage.worst_noise_ratio <= 1.0);
            assert!(outcome.input_stage.pole >= config.stage1.target_pole);
        }

        let cached = execute_plan(ExecutePlanParams {
            work_dir: &work_dir,
            plan: &plan,
            cache: CacheMode::Only,
            workers: Some(2),
        })
        .expect("failed to execute plan from cache");
        for (a, b) in fresh.iter().zip(cached.iter()) {
            assert!(b.input_stage_cached);
            assert_relative_eq!(a.input_stage.width, b.input_stage.width, max_relative = 1e-12);
            assert_relative_eq!(a.input_stage.current, b.input_stage.current, max_relative = 1e-12);
            for name in variant_stage1_names(&config) {
                let (x, y) = (a.params.get(&name), b.params.get(&name));
                assert_relative_eq!(
                    x.expect("missing solved parameter"),
                    y.expect("missing cached parameter"),
                    max_relative = 1e-12
                );
            }
        }
    }
}
