use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template(
        "{before-help}{name} {version}\n{author-with-newline}{about-with-newline}\n{usage-heading} {usage}\n\n{all-args}{after-help}"
    )
)]
pub struct Args {
    /// Path to TOML configuration file.
    #[arg(short, long, default_value = "ampsizer.toml")]
    pub config: PathBuf,

    /// Directory to which summaries should be saved.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Only size the named design variant.
    #[arg(long)]
    pub variant: Option<String>,

    /// Use cached input stage results; fail if one is missing.
    #[arg(long, conflicts_with = "no_cache")]
    pub cache_only: bool,

    /// Re-run the input stage search even if a cached result exists.
    #[arg(long)]
    pub no_cache: bool,

    /// Number of worker threads for the input stage search.
    #[arg(short, long)]
    pub workers: Option<usize>,
}
