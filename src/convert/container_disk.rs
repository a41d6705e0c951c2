use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;

use super::qemu_img;
use crate::exec::CommandExecutor;
use crate::image::options::ImageFormat;
use crate::ui::prelude::*;

/// uid/gid of the qemu user in KubeVirt's virt-launcher.
const QEMU_UID: u32 = 107;
const DISK_FILE: &str = "disk.qcow2";

pub fn render_dockerfile() -> String {
    format!("FROM scratch\n\nADD --chown={QEMU_UID}:{QEMU_UID} {DISK_FILE} /disk/\n")
}

/// Package `disk` as a `FROM scratch` container image tagged `tag`.
pub async fn make(exec: &CommandExecutor, disk: &Path, tag: &str, push: bool) -> Result<()> {
    if !disk.exists() && !exec.dry_run {
        anyhow::bail!("{} does not exist", disk.display());
    }

    let context_dir = tempfile::Builder::new()
        .prefix("diskforge-container-disk-")
        .tempdir()
        .context("creating container disk build context")?;

    // Also copies the disk into the build context when it is already qcow2.
    let qcow2 = context_dir.path().join(DISK_FILE);
    qemu_img::convert(exec, ImageFormat::Qcow2, disk, &qcow2).await?;

    let dockerfile = context_dir.path().join("Dockerfile");
    std::fs::write(&dockerfile, render_dockerfile()).context("writing Dockerfile")?;

    emit(
        Level::Info,
        "container_disk.build",
        &format!("Building container disk {tag}"),
        None,
    );
    exec.run(
        Command::new("docker")
            .args(["image", "build", "-t", tag, "-f"])
            .arg(&dockerfile)
            .arg(context_dir.path()),
    )
    .await
    .context("building container disk")?;

    if push {
        emit(
            Level::Info,
            "container_disk.push",
            &format!("Pushing {tag}"),
            None,
        );
        exec.run(Command::new("docker").args(["image", "push", tag]))
            .await
            .context("pushing container disk")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_is_scratch_with_qemu_ownership() {
        assert_eq!(
            render_dockerfile(),
            "FROM scratch\n\nADD --chown=107:107 disk.qcow2 /disk/\n"
        );
    }

    #[tokio::test]
    async fn converts_builds_and_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk0.raw");
        std::fs::write(&disk, [0u8; 16]).unwrap();

        let exec = CommandExecutor::new(true);
        make(&exec, &disk, "registry.local/vm:1", true).await.unwrap();

        let journal = exec.journal();
        assert_eq!(journal.len(), 3);
        assert!(journal[0].starts_with("qemu-img convert -O qcow2"));
        assert!(journal[1].starts_with("docker image build -t registry.local/vm:1 -f"));
        assert_eq!(journal[2], "docker image push registry.local/vm:1");
    }

    #[tokio::test]
    async fn missing_disk_is_an_error() {
        let exec = CommandExecutor::new(false);
        let err = make(&exec, Path::new("/nonexistent/disk.qcow2"), "t", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
