use std::fs::canonicalize;
use std::path::PathBuf;

use clap::Parser;

use crate::cli::args::Args;
use crate::cli::progress::StepContext;
use crate::config::parse_config;
use crate::plan::{execute_variant, generate_plan, CacheMode, ExecuteVariantParams, TaskKey};
use crate::Result;

pub mod args;
pub mod progress;

pub const BANNER: &str = r"
   __ _ _ __ ___  _ __  ___(_)_______ _ __
  / _` | '_ ` _ \| '_ \/ __| |_  / _ \ '__|
 | (_| | | | | | | |_) \__ \ |/ /  __/ |
  \__,_|_| |_| |_| .__/|___/_/___\___|_|
                 |_|

AMPSIZER v0.1
";

pub fn run() -> Result<()> {
    let args = Args::parse();

    let config_path = canonicalize(&args.config)?;

    println!("{BANNER}");

    println!("Reading configuration file...\n");
    let config = parse_config(&config_path)?;

    println!("Configuration file: {:?}", &config_path);
    println!("Amplifier parameters:");
    println!("\tName: {}", config.name);
    println!(
        "\tNoise budget: {:.3e} V^2/Hz x (1 + {:.3e} Hz^2 / f^2), margin {}",
        config.stage1.noise_floor, config.stage1.noise_corner_sq, config.stage1.margin
    );
    println!("\tFollower bandwidth: {:.3e} Hz", config.stage2.f_local);
    println!(
        "\tOutput stage gm: {:.3e} S quiescent, {:.3e} S peak",
        config.stage3.gm_quiescent, config.stage3.gm_peak
    );
    println!();

    let mut ctx = StepContext::new("Planning", &[TaskKey::GeneratePlan]);
    let plan = ctx.check(generate_plan(&config, args.variant.as_deref()))?;
    ctx.finish(TaskKey::GeneratePlan);

    let work_dir = args
        .output_dir
        .or_else(|| config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from(&plan.name));
    std::fs::create_dir_all(&work_dir)?;
    let work_dir = canonicalize(work_dir)?;

    let cache = if args.cache_only {
        CacheMode::Only
    } else if args.no_cache {
        CacheMode::Refresh
    } else {
        CacheMode::ReadWrite
    };

    for variant in plan.variants.iter() {
        let mut ctx = StepContext::new(&format!("Variant `{}`", variant.name), &TaskKey::VARIANT);
        let res = execute_variant(ExecuteVariantParams {
            work_dir: &work_dir,
            cache_dir: &plan.cache_dir,
            run: &plan.name,
            variant,
            cache,
            workers: args.workers,
            ctx: Some(&mut ctx),
        });
        ctx.check(res)?;
    }
    println!("Summaries saved to: {:?}\n", &work_dir);

    Ok(())
}
