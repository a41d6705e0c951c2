//! Disk image construction.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub mod builder;
pub mod error;
pub mod fstab;
pub mod layout;
pub mod options;
pub mod rootfs;
pub mod stage;

use self::builder::{BuildRequest, Builder};
use self::error::ConfigError;
use self::options::BuildOptions;
use crate::convert::{container_disk, qemu_img};
use crate::exec::CommandExecutor;
use crate::paths;
use crate::source::{self, RootfsSource};
use crate::ui::prelude::*;

/// Publish the built disk as a container image too.
#[derive(Debug, Clone)]
pub struct ContainerDiskTarget {
    pub tag: String,
    pub push: bool,
}

pub struct ConvertRequest {
    pub source: Box<dyn RootfsSource>,
    pub output: PathBuf,
    pub options: BuildOptions,
    /// Replace an existing output file.
    pub force: bool,
    /// Directory the private work directory is created in.
    pub workdir_base: Option<PathBuf>,
    /// Leave the work directory behind for inspection.
    pub keep_workdir: bool,
    pub container_disk: Option<ContainerDiskTarget>,
}

/// Source to published disk: detect the distribution, build in a private
/// work directory, then move the result to `request.output`. The output
/// path is only written once the whole build succeeded.
pub async fn convert_image(request: ConvertRequest, exec: &CommandExecutor) -> Result<PathBuf> {
    let ConvertRequest {
        source,
        output,
        options,
        force,
        workdir_base,
        keep_workdir,
        container_disk: container,
    } = request;

    if output.exists() && !force {
        return Err(ConfigError::OutputExists(output).into());
    }

    let base = workdir_base.unwrap_or_else(paths::default_workdir_base);
    std::fs::create_dir_all(&base).with_context(|| format!("creating {}", base.display()))?;
    let workdir = tempfile::Builder::new()
        .prefix("diskforge-")
        .tempdir_in(&base)
        .context("creating work directory")?;

    emit(
        Level::Info,
        "image.source",
        &format!("Inspecting {}", source.describe()),
        None,
    );
    let release = source::detect_release(source.as_ref(), exec).await?;
    emit(
        Level::Info,
        "image.release",
        &format!("Detected {} ({})", release.name, release),
        None,
    );

    let mut builder = Builder::new(
        BuildRequest {
            workdir: workdir.path().to_path_buf(),
            options,
            release,
            source,
        },
        exec,
    )?;
    let result = builder.build(interrupted()).await;
    emit(
        Level::Debug,
        "image.stages",
        &format!(
            "{} of {} stages completed with {}",
            builder.completed().len(),
            stage::BuildStage::ALL.len(),
            builder.bootloader_name()
        ),
        None,
    );

    let leaked = builder.holds_resources();
    if leaked {
        emit(
            Level::Warn,
            "image.leaked",
            &format!("Resources still held after teardown: {:?}", builder.layout().held),
            None,
        );
        drop(builder);
    } else if let Err(e) = builder.close() {
        emit(Level::Warn, "image.cleanup", &format!("{e:#}"), None);
    }
    if leaked || keep_workdir {
        let kept = workdir.keep();
        emit(
            Level::Warn,
            "image.workdir.kept",
            &format!("Work directory kept at {}", kept.display()),
            None,
        );
    }

    let built = result?;
    publish(exec, &built, &output)?;

    if !exec.dry_run
        && let Some(info) = qemu_img::info(exec, &output).await?
    {
        emit(
            Level::Success,
            "image.done",
            &format!(
                "{} ready ({}, {} bytes virtual, {} bytes on disk)",
                output.display(),
                info.format,
                info.virtual_size,
                info.actual_size
            ),
            Some(serde_json::json!({
                "path": output,
                "format": info.format,
                "virtual_size": info.virtual_size,
                "actual_size": info.actual_size,
            })),
        );
    }

    if let Some(target) = container {
        container_disk::make(exec, &output, &target.tag, target.push).await?;
    }

    Ok(output)
}

/// Resolves on Ctrl-C. Never resolves where the signal cannot be watched.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_ok() {
        emit(
            Level::Warn,
            "image.interrupted",
            "Interrupted, cleaning up",
            None,
        );
    } else {
        std::future::pending::<()>().await;
    }
}

/// Move `built` to `output`, replacing whatever is there. Falls back to
/// copying when the two are on different filesystems.
fn publish(exec: &CommandExecutor, built: &Path, output: &Path) -> Result<()> {
    if !built.exists() {
        if exec.dry_run {
            emit(
                Level::Info,
                "image.publish",
                &format!("[DRY RUN] {} -> {}", built.display(), output.display()),
                None,
            );
            return Ok(());
        }
        anyhow::bail!("build produced no disk at {}", built.display());
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    if output.exists() {
        std::fs::remove_file(output)
            .with_context(|| format!("removing existing {}", output.display()))?;
    }
    if std::fs::rename(built, output).is_err() {
        std::fs::copy(built, output).with_context(|| {
            format!("copying {} to {}", built.display(), output.display())
        })?;
        std::fs::remove_file(built)
            .with_context(|| format!("removing {}", built.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::options::{DiskSize, ImageFormat, MIB, Platform};
    use crate::source::{DirectorySource, TarballSource};

    fn request(src: &Path, output: PathBuf, base: &Path) -> ConvertRequest {
        ConvertRequest {
            source: Box::new(DirectorySource::new(src)),
            output,
            options: BuildOptions {
                size: DiskSize(1024 * MIB),
                format: ImageFormat::Qcow2,
                platform: Platform("linux/amd64".into()),
                bootloader: Some("grub-bios".into()),
                ..Default::default()
            },
            force: false,
            workdir_base: Some(base.to_path_buf()),
            keep_workdir: false,
            container_disk: None,
        }
    }

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/os-release"), "ID=ubuntu\nVERSION_ID=\"22.04\"\n")
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn refuses_to_overwrite_without_force() {
        let src = rootfs();
        let out = tempfile::tempdir().unwrap();
        let output = out.path().join("vm.qcow2");
        std::fs::write(&output, "keep me").unwrap();

        let exec = CommandExecutor::new(true);
        let err = convert_image(request(src.path(), output.clone(), out.path()), &exec)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::OutputExists(_))
        ));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "keep me");
        assert!(exec.journal().is_empty());
    }

    #[tokio::test]
    async fn dry_run_leaves_no_work_directory() {
        let src = rootfs();
        let base = tempfile::tempdir().unwrap();
        let output = base.path().join("out/vm.qcow2");

        let exec = CommandExecutor::new(true);
        let published = convert_image(request(src.path(), output.clone(), base.path()), &exec)
            .await
            .unwrap();
        assert_eq!(published, output);
        assert!(!output.exists());

        let leftovers: Vec<_> = std::fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("diskforge-"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(exec.journal().iter().any(|l| l.starts_with("qemu-img convert -O qcow2")));
    }

    #[tokio::test]
    async fn dry_run_builds_from_an_archive() {
        let src = rootfs();
        let base = tempfile::tempdir().unwrap();
        let archive = base.path().join("rootfs.tar");
        let status = std::process::Command::new("tar")
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(src.path())
            .arg(".")
            .status()
            .unwrap();
        assert!(status.success());

        let mut req = request(src.path(), base.path().join("vm.qcow2"), base.path());
        req.source = Box::new(TarballSource::new(&archive));
        let exec = CommandExecutor::new(true);
        convert_image(req, &exec).await.unwrap();

        let journal = exec.journal();
        assert!(journal.iter().any(|l| l.starts_with("tar --numeric-owner -xpf")));
        assert!(!journal.iter().any(|l| l.starts_with("tar -xOf")));
    }

    #[test]
    fn publish_replaces_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let built = dir.path().join("disk0.qcow2");
        let output = dir.path().join("final/vm.qcow2");
        std::fs::write(&built, "new").unwrap();
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, "old").unwrap();

        publish(&CommandExecutor::new(false), &built, &output).unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "new");
        assert!(!built.exists());
    }
}
