use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

use crate::exec::CommandExecutor;
use crate::image::options::ImageFormat;

/// Subset of `qemu-img info --output json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImgInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    pub filename: String,
    pub format: String,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    #[serde(rename = "dirty-flag", default)]
    pub dirty_flag: bool,
}

impl ImgInfo {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parsing qemu-img info output")
    }
}

/// Write `input` to `output` in `format`. `input` itself is left untouched.
pub async fn convert(
    exec: &CommandExecutor,
    format: ImageFormat,
    input: &Path,
    output: &Path,
) -> Result<()> {
    exec.run(
        Command::new("qemu-img")
            .args(["convert", "-O", format.qemu_name()])
            .arg(input)
            .arg(output),
    )
    .await
    .with_context(|| format!("converting {} to {format}", input.display()))?;
    Ok(())
}

/// Image metadata, or `None` in dry-run mode.
pub async fn info(exec: &CommandExecutor, path: &Path) -> Result<Option<ImgInfo>> {
    let output = exec
        .run_with_output(
            Command::new("qemu-img")
                .arg("info")
                .arg(path)
                .args(["--output", "json"]),
        )
        .await?;
    output.as_deref().map(ImgInfo::parse).transpose()
}
