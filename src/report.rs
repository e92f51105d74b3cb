//! Run summaries: a plain-text report rendered from `templates/summary.txt`
//! and a JSON record of the same data.

use std::f64::consts::PI;
use std::path::Path;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tera::Context;

use crate::oracle::{EvalResult, Oracle, Params, Probe, TransferKind};
use crate::paths::{out_json, out_summary};
use crate::search::sweep::logspace;
use crate::search::{BandwidthStageResult, MatchedStageResult, NoiseStageResult};
use crate::{Result, TEMPLATES};

/// Small-signal figures of the closed loop at the final assignment.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopPerformance {
    /// `|Gain(0)|`.
    pub dc_gain: f64,
    /// `|L(0)|`.
    pub dc_loop_gain: f64,
    /// Frequency where `|L|` first drops below 1 [Hz].
    pub crossover: Option<f64>,
    /// Phase margin at the crossover [deg].
    pub phase_margin: Option<f64>,
}

impl LoopPerformance {
    pub fn evaluate(oracle: &dyn Oracle, params: &Params, probe: &Probe) -> EvalResult<Self> {
        let gain = oracle.transfer(params, probe, TransferKind::Gain)?;
        let loop_gain = oracle.transfer(params, probe, TransferKind::LoopGain)?;
        let zero = Complex64::new(0.0, 0.0);

        let mut crossover = None;
        let mut phase_margin = None;
        // Phase of -L, unwrapped along the sweep.
        let mut phase = (-loop_gain(zero)).arg();
        for f in logspace(1.0, 1e12, 1201) {
            let l = loop_gain(Complex64::new(0.0, 2.0 * PI * f));
            let mut next = (-l).arg();
            while next - phase > PI {
                next -= 2.0 * PI;
            }
            while phase - next > PI {
                next += 2.0 * PI;
            }
            phase = next;
            if l.norm() < 1.0 {
                crossover = Some(f);
                phase_margin = Some(180.0 + phase.to_degrees());
                break;
            }
        }

        Ok(Self {
            dc_gain: gain(zero).norm(),
            dc_loop_gain: loop_gain(zero).norm(),
            crossover,
            phase_margin,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: String,
    pub variant: String,
    pub success: bool,
    pub error: Option<String>,
    pub output_stage: Option<MatchedStageResult>,
    pub follower_stage: Option<BandwidthStageResult>,
    pub input_stage: Option<NoiseStageResult>,
    /// Whether the input stage result was read from the cache.
    pub input_stage_cached: bool,
    pub performance: Option<LoopPerformance>,
    pub params: Params,
}

#[derive(Serialize)]
struct Row {
    name: &'static str,
    value: String,
}

#[derive(Serialize)]
struct Section {
    title: String,
    rows: Vec<Row>,
}

#[derive(Serialize)]
struct SummaryContext<'a> {
    run: &'a str,
    variant: &'a str,
    verdict: &'static str,
    error: Option<&'a str>,
    sections: Vec<Section>,
    params: Vec<Row>,
}

fn row(name: &'static str, value: f64, unit: &str) -> Row {
    Row {
        name,
        value: format!("{value:.4e} {unit}").trim_end().to_string(),
    }
}

fn sections(summary: &RunSummary) -> Vec<Section> {
    let mut sections = Vec::new();
    if let Some(r) = &summary.output_stage {
        sections.push(Section {
            title: "Stage 3 (output)".to_string(),
            rows: vec![
                row("W_push", r.push_width, "m"),
                row("W_pull", r.pull_width, "m"),
                row("W_push / W_pull", r.ratio, ""),
                row("I_quiescent", r.quiescent_current, "A"),
                row("I_peak", r.peak_current, "A"),
                row("gm_quiescent (push + pull)", r.quiescent.gm_total, "S"),
                row("gm_peak (push + pull)", r.peak.gm_total, "S"),
                row("IC_quiescent (push)", r.quiescent.ic_push, ""),
                row("IC_quiescent (pull)", r.quiescent.ic_pull, ""),
                Row {
                    name: "converged",
                    value: r.converged.to_string(),
                },
            ],
        });
    }
    if let Some(r) = &summary.follower_stage {
        sections.push(Section {
            title: format!("Stage 2 (follower, {})", r.polarity),
            rows: vec![
                row("W", r.width, "m"),
                row("I", r.current, "A"),
                row("C_downstream", r.c_downstream, "F"),
                row("gm_target", r.gm_target, "S"),
                row("gm", r.gm, "S"),
                row("IC", r.ic, ""),
                Row {
                    name: "converged",
                    value: r.converged.to_string(),
                },
            ],
        });
    }
    if let Some(r) = &summary.input_stage {
        let title = if summary.input_stage_cached {
            "Stage 1 (input, cached)"
        } else {
            "Stage 1 (input)"
        };
        sections.push(Section {
            title: title.to_string(),
            rows: vec![
                row("W", r.width, "m"),
                row("I", r.current, "A"),
                row("W_cascode", r.cascode_width, "m"),
                row("IC", r.ic, ""),
                row("gm", r.gm, "S"),
                row("gm / go", r.gain, ""),
                row("cascode pole", r.pole, "Hz"),
                row("worst noise / budget", r.worst_noise_ratio, ""),
                row("cost", r.cost, ""),
            ],
        });
    }
    if let Some(p) = &summary.performance {
        let mut rows = vec![row("|Gain(0)|", p.dc_gain, ""), row("|L(0)|", p.dc_loop_gain, "")];
        if let (Some(fc), Some(pm)) = (p.crossover, p.phase_margin) {
            rows.push(row("loop gain crossover", fc, "Hz"));
            rows.push(Row {
                name: "phase margin",
                value: format!("{pm:.1} deg"),
            });
        }
        sections.push(Section {
            title: "Loop".to_string(),
            rows,
        });
    }
    sections
}

pub fn generate_summary(summary: &RunSummary) -> Result<String> {
    let params = summary
        .params
        .iter()
        .map(|(name, value)| Row {
            name: "",
            value: format!("{name} = {value:.6e}"),
        })
        .collect();
    let context = SummaryContext {
        run: &summary.run,
        variant: &summary.variant,
        verdict: if summary.success { "SUCCESS" } else { "FAILURE" },
        error: summary.error.as_deref(),
        sections: sections(summary),
        params,
    };
    Ok(TEMPLATES.render("summary.txt", &Context::from_serialize(context)?)?)
}

/// Writes `<variant>.summary.txt` and `<variant>.json` to `work_dir`.
pub fn save_summary(work_dir: impl AsRef<Path>, summary: &RunSummary) -> Result<()> {
    let work_dir = work_dir.as_ref();
    std::fs::create_dir_all(work_dir)?;
    std::fs::write(
        out_summary(work_dir, &summary.variant),
        generate_summary(summary)?,
    )?;
    std::fs::write(
        out_json(work_dir, &summary.variant),
        serde_json::to_string_pretty(summary)?,
    )?;
    Ok(())
}
