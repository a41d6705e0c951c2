use anyhow::{Context, Result};
use std::path::PathBuf;

/// Root of diskforge's own state (`~/.cache/diskforge` on most systems).
pub fn diskforge_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("unable to determine cache directory")?;
    Ok(base.join("diskforge"))
}

pub fn command_logs_dir() -> Result<PathBuf> {
    Ok(diskforge_cache_dir()?.join("logs"))
}

/// Base directory for per-build work directories.
pub fn default_workdir_base() -> PathBuf {
    std::env::temp_dir()
}
