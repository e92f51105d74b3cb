use std::path::{Path, PathBuf};

pub fn out_cache(cache_dir: impl AsRef<Path>, variant: &str) -> PathBuf {
    PathBuf::from(cache_dir.as_ref()).join(format!("{variant}.stage1.toml"))
}

pub fn out_summary(work_dir: impl AsRef<Path>, variant: &str) -> PathBuf {
    PathBuf::from(work_dir.as_ref()).join(format!("{variant}.summary.txt"))
}

pub fn out_json(work_dir: impl AsRef<Path>, variant: &str) -> PathBuf {
    PathBuf::from(work_dir.as_ref()).join(format!("{variant}.json"))
}
