use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::RootfsSource;
use crate::distro::read_os_release;
use crate::exec::CommandExecutor;
use crate::exec::deps::{self, HostTool};

/// An unpacked root filesystem on the host.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RootfsSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.path.display())
    }

    fn required_tools(&self) -> Vec<HostTool> {
        vec![deps::CP]
    }

    async fn os_release(&self, _exec: &CommandExecutor) -> Result<String> {
        read_os_release(&self.path)
    }

    async fn flatten(&self, exec: &CommandExecutor, dest: &Path) -> Result<()> {
        // "<src>/." copies the contents, including dotfiles, not the directory itself
        exec.run(
            Command::new("cp")
                .arg("-a")
                .arg(self.path.join("."))
                .arg(dest),
        )
        .await
        .with_context(|| format!("copying {} into the image", self.path.display()))?;
        Ok(())
    }
}
