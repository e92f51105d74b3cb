use std::path::PathBuf;

use thiserror::Error;

use crate::oracle::EvalError;
use crate::search::Stage;

#[derive(Debug, Error)]
pub enum SizingError {
    #[error("{stage}: no viable candidate found: {reason}")]
    NoViableCandidate { stage: Stage, reason: String },

    #[error(
        "no cached {stage} result for design variant `{variant}` at {path:?}; \
         re-run without --cache-only to compute it"
    )]
    CacheMiss {
        stage: Stage,
        variant: String,
        path: PathBuf,
    },

    #[error(
        "noise increases with width ({narrow:e} m -> {wide:e} m) at {current:e} A; \
         the device model breaks the stage 1 search assumptions"
    )]
    MonotonicityViolated { narrow: f64, wide: f64, current: f64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse cache entry: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to serialize cache entry: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, SizingError>;
