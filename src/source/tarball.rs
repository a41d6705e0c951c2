use anyhow::{Context, Result};
use async_trait::async_trait;
use duct::cmd;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::RootfsSource;
use crate::distro::release::OS_RELEASE_PATHS;
use crate::exec::CommandExecutor;
use crate::exec::deps::{self, HostTool};

/// os-release from the archive. Members may or may not carry a leading "./".
fn read_archived_os_release(archive: &Path) -> Result<String> {
    for candidate in OS_RELEASE_PATHS {
        for member in [format!("./{candidate}"), candidate.to_string()] {
            let content = cmd!("tar", "-xOf", archive, &member)
                .stderr_null()
                .unchecked()
                .read();
            if let Ok(content) = content
                && !content.trim().is_empty()
            {
                return Ok(content);
            }
        }
    }
    anyhow::bail!("no os-release file in {}", archive.display())
}

/// A root filesystem archive, e.g. the output of `docker export`.
#[derive(Debug, Clone)]
pub struct TarballSource {
    path: PathBuf,
}

impl TarballSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RootfsSource for TarballSource {
    fn describe(&self) -> String {
        format!("archive {}", self.path.display())
    }

    fn required_tools(&self) -> Vec<HostTool> {
        vec![deps::TAR]
    }

    /// Read straight from the archive, also in dry-run mode: inspecting
    /// the source changes nothing on the host.
    async fn os_release(&self, _exec: &CommandExecutor) -> Result<String> {
        let archive = self.path.clone();
        tokio::task::spawn_blocking(move || read_archived_os_release(&archive))
            .await
            .context("reading os-release from archive")?
    }

    async fn flatten(&self, exec: &CommandExecutor, dest: &Path) -> Result<()> {
        exec.run(
            Command::new("tar")
                .args(["--numeric-owner", "-xpf"])
                .arg(&self.path)
                .arg("-C")
                .arg(dest),
        )
        .await
        .with_context(|| format!("extracting {}", self.path.display()))?;
        Ok(())
    }
}
