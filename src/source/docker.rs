use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::path::Path;
use tokio::process::Command;

use super::RootfsSource;
use crate::exec::CommandExecutor;
use crate::exec::deps::{self, HostTool};
use crate::ui::prelude::*;

/// A container image, exported through the local docker daemon.
#[derive(Debug, Clone)]
pub struct DockerSource {
    image: String,
    pull: bool,
}

impl DockerSource {
    pub fn new(image: &str, pull: bool) -> Self {
        Self {
            image: with_default_tag(image),
            pull,
        }
    }

    async fn pull_if_requested(&self, exec: &CommandExecutor) -> Result<()> {
        if !self.pull {
            return Ok(());
        }
        emit(
            Level::Info,
            "source.docker.pull",
            &format!("Pulling {}", self.image),
            None,
        );
        exec.run(Command::new("docker").args(["image", "pull", self.image.as_str()]))
            .await
            .with_context(|| format!("pulling {}", self.image))?;
        Ok(())
    }
}

/// `alpine` -> `alpine:latest`; digests and explicit tags are kept.
fn with_default_tag(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

#[async_trait]
impl RootfsSource for DockerSource {
    fn describe(&self) -> String {
        format!("image {}", self.image)
    }

    fn required_tools(&self) -> Vec<HostTool> {
        vec![deps::DOCKER, deps::TAR]
    }

    async fn os_release(&self, exec: &CommandExecutor) -> Result<String> {
        self.pull_if_requested(exec).await?;
        let output = exec
            .run_with_output(Command::new("docker").args([
                "run",
                "--rm",
                "--entrypoint",
                "cat",
                self.image.as_str(),
                "/etc/os-release",
            ]))
            .await
            .with_context(|| format!("reading os-release from {}", self.image))?;
        output.with_context(|| {
            format!("cannot read os-release from {} in dry-run mode", self.image)
        })
    }

    async fn flatten(&self, exec: &CommandExecutor, dest: &Path) -> Result<()> {
        let export_dir = tempfile::Builder::new()
            .prefix("diskforge-export-")
            .tempdir()
            .context("creating export directory")?;
        let archive = export_dir.path().join("rootfs.tar");
        let container = format!("diskforge-{:08x}", rand::thread_rng().r#gen::<u32>());

        exec.run(Command::new("docker").args(["container", "create", "--name", container.as_str(), self.image.as_str()]))
            .await
            .with_context(|| format!("creating container from {}", self.image))?;

        let exported = async {
            exec.run(
                Command::new("docker")
                    .args(["container", "export", "-o"])
                    .arg(&archive)
                    .arg(&container),
            )
            .await?;
            exec.run(
                Command::new("tar")
                    .args(["--numeric-owner", "-xpf"])
                    .arg(&archive)
                    .arg("-C")
                    .arg(dest),
            )
            .await?;
            Ok::<(), crate::exec::ExecError>(())
        }
        .await;

        let removed = exec
            .run(Command::new("docker").args(["container", "rm", "-f", container.as_str()]))
            .await;

        exported.with_context(|| format!("exporting {}", self.image))?;
        if let Err(e) = removed {
            emit(
                Level::Warn,
                "source.docker.cleanup",
                &format!("Could not remove container {container}: {e}"),
                None,
            );
        }
        Ok(())
    }
}
