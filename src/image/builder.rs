//! Turns a root filesystem into a converted disk image.
//!
//! A [`Builder`] validates its whole configuration up front, then walks the
//! [`BuildStage`]s in order. Every loop device, partition mapping, LUKS
//! volume and mount it acquires is recorded in [`Held`], so a failure or a
//! cancellation at any point can release exactly what is held before the
//! raw disk is discarded.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::error::{Cancelled, ConfigError, TeardownError};
use super::fstab;
use super::layout::{DiskLayout, Held};
use super::options::{BuildOptions, MIB, MIN_BOOT_SIZE_MIB};
use super::rootfs;
use super::stage::BuildStage;
use crate::bootloader::fs::BootFs;
use crate::bootloader::registry::REGISTRY;
use crate::bootloader::{Bootloader, BootloaderContext};
use crate::convert::qemu_img;
use crate::distro::{BootConfig, DistroProfile, OsRelease};
use crate::exec::deps::{self, check_tools};
use crate::exec::{CommandExecutor, ExecError};
use crate::source::RootfsSource;
use crate::ui::prelude::*;

/// Loop device reported for `losetup` in dry-run mode.
pub const DRY_RUN_LOOP_DEVICE: &str = "/dev/loop0";

/// Everything needed to build one disk.
pub struct BuildRequest {
    pub workdir: PathBuf,
    pub options: BuildOptions,
    pub release: OsRelease,
    pub source: Box<dyn RootfsSource>,
}

pub struct Builder<'a> {
    exec: &'a CommandExecutor,
    options: BuildOptions,
    release: OsRelease,
    profile: &'static DistroProfile,
    boot: BootConfig,
    bootloader: Box<dyn Bootloader>,
    source: Box<dyn RootfsSource>,
    layout: DiskLayout,
    completed: Vec<BuildStage>,
}

impl<'a> Builder<'a> {
    /// Resolve and check the configuration. Nothing on disk is touched
    /// except the creation of the mountpoint directory.
    pub fn new(request: BuildRequest, exec: &'a CommandExecutor) -> Result<Self> {
        let BuildRequest {
            workdir,
            mut options,
            release,
            source,
        } = request;

        let arch = options.platform.arch()?;
        let bootloader_name = options.bootloader_name()?;
        let provider = REGISTRY.get(&bootloader_name)?;

        if let Some(mandated) = provider.mandated_boot_fs()
            && (!options.split_boot || options.boot_fs() != mandated)
        {
            emit(
                Level::Warn,
                "image.builder.boot_fs",
                &format!(
                    "{bootloader_name} needs a separate {mandated} boot partition, enabling it"
                ),
                None,
            );
            options.split_boot = true;
            options.boot_fs = Some(mandated);
        }

        if options.boot_fs == Some(BootFs::Fat32) && !options.split_boot {
            return Err(ConfigError::BootFsRequiresSplitBoot.into());
        }
        let luks = options.luks_password.is_some();
        if luks && !options.split_boot {
            return Err(ConfigError::LuksRequiresSplitBoot.into());
        }
        if luks && !release.supports_disk_encryption() {
            return Err(ConfigError::LuksUnsupported(release.to_string()).into());
        }
        let profile = release
            .profile()
            .ok_or_else(|| ConfigError::UnsupportedDistribution(release.to_string()))?;

        let total_size = options.size.bytes();
        if options.split_boot {
            if options.boot_size_mib < MIN_BOOT_SIZE_MIB {
                return Err(ConfigError::BootSizeTooSmall(options.boot_size_mib).into());
            }
            if options.boot_size_mib.saturating_mul(MIB) >= total_size {
                return Err(ConfigError::BootSizeTooLarge {
                    boot_mib: options.boot_size_mib,
                    disk_bytes: total_size,
                }
                .into());
            }
        }

        let boot_fs = if options.split_boot {
            options.boot_fs()
        } else {
            BootFs::Ext4
        };
        let boot = BootConfig::for_profile(profile, options.split_boot);
        let ctx = BootloaderContext {
            boot: boot.clone(),
            release: release.clone(),
            arch,
            mbr_file: options.mbr_file.clone(),
        };
        let bootloader = provider.create(&ctx)?;
        bootloader.validate(boot_fs)?;

        let mut tools = deps::BASE_TOOLS.to_vec();
        if options.split_boot && boot_fs == BootFs::Fat32 {
            tools.push(deps::MKFS_FAT);
        }
        if luks {
            tools.push(deps::CRYPTSETUP);
        }
        tools.extend(bootloader.required_tools());
        tools.extend(source.required_tools());
        if let Err(e) = check_tools(&tools) {
            if !exec.dry_run {
                return Err(e.into());
            }
            emit(Level::Warn, "image.builder.deps", &e.to_string(), None);
        }

        let layout = DiskLayout::new(
            &workdir,
            &options.disk_name,
            options.format,
            total_size,
            options.split_boot,
            options.boot_size_mib,
            boot_fs,
        );
        std::fs::create_dir_all(&layout.mountpoint)
            .with_context(|| format!("creating {}", layout.mountpoint.display()))?;

        emit(
            Level::Debug,
            "image.builder.config",
            &format!(
                "{release}, bootloader {}, {} boot, {} {}",
                bootloader.name(),
                if options.split_boot { "split" } else { "single" },
                options.format,
                options.size
            ),
            None,
        );

        Ok(Self {
            exec,
            options,
            release,
            profile,
            boot,
            bootloader,
            source,
            layout,
            completed: Vec::new(),
        })
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    pub fn completed(&self) -> &[BuildStage] {
        &self.completed
    }

    pub fn bootloader_name(&self) -> &'static str {
        self.bootloader.name()
    }

    /// Run the pipeline until it finishes or `cancel` resolves. On any
    /// failure held resources are released and the raw and converted disks
    /// are removed before the original error is returned.
    pub async fn build(&mut self, cancel: impl Future<Output = ()>) -> Result<PathBuf> {
        emit(
            Level::Info,
            "image.build",
            &format!(
                "Building {} from {} ({})",
                self.layout.output_path.display(),
                self.source.describe(),
                self.release
            ),
            None,
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel => Err(Cancelled.into()),
            result = self.run_stages() => result,
        };

        match outcome {
            Ok(()) => Ok(self.layout.output_path.clone()),
            Err(e) => {
                emit(
                    Level::Error,
                    "image.build.failed",
                    &format!("Build failed: {e:#}"),
                    None,
                );
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self) -> Result<()> {
        for stage in BuildStage::ALL {
            emit(
                Level::Info,
                "image.stage",
                stage.description(),
                Some(serde_json::json!({ "stage": stage })),
            );
            self.run_stage(stage)
                .await
                .with_context(|| stage.description().to_lowercase())?;
            self.completed.push(stage);
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage: BuildStage) -> Result<()> {
        match stage {
            BuildStage::Clean => remove_file_if_exists(&self.layout.raw_path),
            BuildStage::Allocate => self.allocate(),
            BuildStage::Partition => {
                self.exec
                    .run(Command::new("parted").args(self.layout.parted_args()))
                    .await?;
                Ok(())
            }
            BuildStage::Attach => self.attach().await,
            BuildStage::Encrypt => self.encrypt().await,
            BuildStage::MakeFilesystems => self.make_filesystems().await,
            BuildStage::Mount => self.mount().await,
            BuildStage::CopyRootfs => {
                self.source
                    .flatten(self.exec, &self.layout.mountpoint)
                    .await
            }
            BuildStage::ConfigureRootfs => self.configure_rootfs().await,
            BuildStage::ComputeCmdline => {
                let root_uuid = self
                    .layout
                    .root_uuid
                    .as_deref()
                    .context("root filesystem UUID unknown")?;
                let cmdline = self.boot.build_cmdline(
                    self.profile.crypt_style,
                    root_uuid,
                    self.layout.crypt_uuid.as_deref(),
                    &self.options.cmdline,
                );
                emit(
                    Level::Debug,
                    "image.cmdline",
                    &format!("Kernel command line: {cmdline}"),
                    None,
                );
                self.layout.cmdline = Some(cmdline);
                Ok(())
            }
            BuildStage::InstallBootloader => {
                let device = self
                    .layout
                    .loop_device
                    .as_deref()
                    .context("no loop device attached")?;
                let cmdline = self
                    .layout
                    .cmdline
                    .as_ref()
                    .context("kernel command line not computed")?;
                self.bootloader
                    .setup(self.exec, device, &self.layout.mountpoint, cmdline)
                    .await
            }
            BuildStage::Unmount => Ok(self.teardown().await?),
            BuildStage::Convert => {
                qemu_img::convert(
                    self.exec,
                    self.layout.format,
                    &self.layout.raw_path,
                    &self.layout.output_path,
                )
                .await
            }
            BuildStage::Finalize => remove_file_if_exists(&self.layout.raw_path),
        }
    }

    fn allocate(&self) -> Result<()> {
        let file = std::fs::File::create(&self.layout.raw_path)
            .with_context(|| format!("creating {}", self.layout.raw_path.display()))?;
        file.set_len(self.layout.total_size)
            .with_context(|| format!("sizing {}", self.layout.raw_path.display()))?;
        Ok(())
    }

    async fn attach(&mut self) -> Result<()> {
        // Until losetup reports the device, teardown finds it through the
        // backing file.
        self.layout.held.attached = true;
        let output = self
            .exec
            .run_with_output(
                Command::new("losetup")
                    .args(["--show", "-f"])
                    .arg(&self.layout.raw_path),
            )
            .await;
        let device = match output {
            Ok(Some(out)) => out.trim().to_string(),
            Ok(None) => DRY_RUN_LOOP_DEVICE.to_string(),
            Err(e) => {
                self.layout.held.attached = false;
                return Err(e.into());
            }
        };
        if device.is_empty() {
            anyhow::bail!("losetup did not report a loop device");
        }
        self.layout.set_loop_device(&device);

        acquire(
            self.exec,
            &mut self.layout.held.partitions_mapped,
            Command::new("kpartx").args(["-a", "-s"]).arg(&device),
        )
        .await?;
        Ok(())
    }

    async fn encrypt(&mut self) -> Result<()> {
        let Some(password) = self.options.luks_password.as_deref() else {
            emit(
                Level::Debug,
                "image.encrypt.skip",
                "No LUKS password, root stays unencrypted",
                None,
            );
            return Ok(());
        };
        let partition = self
            .layout
            .root_partition
            .clone()
            .context("root partition not mapped")?;

        // Created 0600 and removed when dropped.
        let mut key = tempfile::Builder::new()
            .prefix("diskforge-key-")
            .tempfile()
            .context("creating LUKS key file")?;
        key.write_all(password.as_bytes())
            .and_then(|()| key.flush())
            .context("writing LUKS key file")?;

        self.exec
            .run(
                Command::new("cryptsetup")
                    .args(["luksFormat", "--batch-mode", "--type", "luks2"])
                    .arg(&partition)
                    .arg(key.path()),
            )
            .await?;

        let suffix: u32 = rand::random();
        let name = format!("diskforge-{suffix:08x}-root");
        self.layout.crypt_partition = Some(partition.clone());
        self.layout.crypt_name = Some(name.clone());
        acquire(
            self.exec,
            &mut self.layout.held.crypt_open,
            Command::new("cryptsetup")
                .arg("open")
                .arg("--key-file")
                .arg(key.path())
                .arg(&partition)
                .arg(&name),
        )
        .await?;
        Ok(())
    }

    async fn make_filesystems(&self) -> Result<()> {
        let root = self.layout.root_device().context("root device unknown")?;
        self.exec
            .run(Command::new("mkfs.ext4").arg("-F").arg(&root))
            .await?;

        if self.layout.split_boot {
            let boot = self
                .layout
                .boot_partition
                .as_deref()
                .context("boot partition not mapped")?;
            let (program, args) = self.layout.boot_fs.mkfs();
            self.exec
                .run(Command::new(program).args(args).arg(boot))
                .await?;
        }
        Ok(())
    }

    async fn mount(&mut self) -> Result<()> {
        let root = self.layout.root_device().context("root device unknown")?;
        std::fs::create_dir_all(&self.layout.mountpoint)
            .with_context(|| format!("creating {}", self.layout.mountpoint.display()))?;
        acquire(
            self.exec,
            &mut self.layout.held.root_mounted,
            Command::new("mount").arg(&root).arg(&self.layout.mountpoint),
        )
        .await?;

        if self.layout.split_boot {
            let boot = self
                .layout
                .boot_partition
                .clone()
                .context("boot partition not mapped")?;
            let boot_mount = self.layout.boot_mountpoint();
            std::fs::create_dir_all(&boot_mount)
                .with_context(|| format!("creating {}", boot_mount.display()))?;
            acquire(
                self.exec,
                &mut self.layout.held.boot_mounted,
                Command::new("mount").arg(&boot).arg(&boot_mount),
            )
            .await?;
        }
        Ok(())
    }

    async fn configure_rootfs(&mut self) -> Result<()> {
        let root_device = self.layout.root_device().context("root device unknown")?;
        let root_uuid = self.read_uuid(&root_device).await?;

        let boot_uuid = if self.layout.split_boot {
            let boot = self
                .layout
                .boot_partition
                .clone()
                .context("boot partition not mapped")?;
            self.read_uuid(&boot).await?
        } else {
            root_uuid.clone()
        };
        if let Some(crypt) = self.layout.crypt_partition.clone() {
            self.layout.crypt_uuid = Some(self.read_uuid(&crypt).await?);
        }

        let fstab = fstab::render(
            &root_uuid,
            self.layout
                .split_boot
                .then(|| (boot_uuid.as_str(), self.layout.boot_fs)),
        );
        rootfs::configure(&self.layout.mountpoint, &fstab, self.profile)?;

        self.layout.root_uuid = Some(root_uuid);
        self.layout.boot_uuid = Some(boot_uuid);
        Ok(())
    }

    async fn read_uuid(&self, device: &str) -> Result<String> {
        let output = self
            .exec
            .run_with_output(Command::new("blkid").args(["-s", "UUID", "-o", "value", device]))
            .await?;
        match output {
            Some(out) => {
                let uuid = out.trim();
                if uuid.is_empty() {
                    anyhow::bail!("{device} has no filesystem UUID");
                }
                Ok(uuid.to_string())
            }
            None => Ok(dry_run_uuid(device)),
        }
    }

    /// Release every held resource in reverse acquisition order. Each step
    /// is attempted even when an earlier one failed; flags are cleared only
    /// on success so a later call retries what is left.
    pub async fn teardown(&mut self) -> Result<(), TeardownError> {
        let exec = self.exec;
        let layout = &mut self.layout;
        let mut errors = TeardownError::default();

        if layout.held.boot_mounted {
            match exec
                .run(Command::new("umount").arg(layout.boot_mountpoint()))
                .await
            {
                Ok(()) => layout.held.boot_mounted = false,
                Err(e) => errors.push(e),
            }
        }
        if layout.held.root_mounted {
            match exec
                .run(Command::new("umount").arg(&layout.mountpoint))
                .await
            {
                Ok(()) => layout.held.root_mounted = false,
                Err(e) => errors.push(e),
            }
        }
        if layout.held.crypt_open
            && let Some(name) = &layout.crypt_name
        {
            match exec
                .run(Command::new("cryptsetup").args(["close", name.as_str()]))
                .await
            {
                Ok(()) => layout.held.crypt_open = false,
                Err(e) => errors.push(e),
            }
        }
        let devices = match &layout.loop_device {
            Some(device) => vec![device.clone()],
            None if layout.held.attached => {
                match associated_loop_devices(exec, &layout.raw_path).await {
                    Ok(devices) => devices,
                    Err(e) => {
                        errors.push(e);
                        return errors.into_result();
                    }
                }
            }
            None => Vec::new(),
        };
        // Flags survive only for devices whose release failed.
        let mut still_mapped = false;
        let mut still_attached = false;
        for device in &devices {
            if layout.held.partitions_mapped
                && let Err(e) = exec.run(Command::new("kpartx").args(["-d", device.as_str()])).await
            {
                still_mapped = true;
                errors.push(e);
            }
            if layout.held.attached
                && let Err(e) = exec.run(Command::new("losetup").args(["-d", device.as_str()])).await
            {
                still_attached = true;
                errors.push(e);
            }
        }
        layout.held.partitions_mapped = still_mapped;
        layout.held.attached = still_attached;

        errors.into_result()
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.teardown().await {
            emit(
                Level::Error,
                "image.cleanup",
                &format!("Cleanup after failure incomplete: {e}"),
                None,
            );
        }
        for path in [&self.layout.raw_path, &self.layout.output_path] {
            if let Err(e) = remove_file_if_exists(path) {
                emit(
                    Level::Error,
                    "image.cleanup",
                    &format!("{e:#}"),
                    None,
                );
            }
        }
    }

    /// Whether any loop device, mapping or mount is still held.
    pub fn holds_resources(&self) -> bool {
        self.layout.held.any()
    }

    /// Remove the mountpoint directory. Refuses while anything is still
    /// mounted below it.
    pub fn close(self) -> Result<()> {
        if self.layout.held.any() {
            anyhow::bail!(
                "{} still holds mounted or attached devices",
                self.layout.mountpoint.display()
            );
        }
        if self.layout.mountpoint.exists() {
            std::fs::remove_dir_all(&self.layout.mountpoint).with_context(|| {
                format!("removing {}", self.layout.mountpoint.display())
            })?;
        }
        Ok(())
    }
}

impl Drop for Builder<'_> {
    /// Last resort when the builder goes away while still holding devices,
    /// e.g. the build future was dropped mid-stage.
    fn drop(&mut self) {
        if self.exec.dry_run || !self.layout.held.any() {
            return;
        }
        emit(
            Level::Warn,
            "image.cleanup.drop",
            "Releasing devices left behind by an interrupted build",
            None,
        );
        for failure in force_release(&self.layout) {
            emit(Level::Error, "image.cleanup.drop", &failure, None);
        }
    }
}

/// Synchronous release for `Drop`. Returns one message per failed step.
fn force_release(layout: &DiskLayout) -> Vec<String> {
    use nix::mount::{MntFlags, umount2};

    let Held {
        attached,
        partitions_mapped,
        crypt_open,
        root_mounted,
        boot_mounted,
    } = layout.held;
    let mut failures = Vec::new();

    let mut detach = |target: &Path| {
        if let Err(e) = umount2(target, MntFlags::MNT_DETACH) {
            failures.push(format!("detaching {}: {e}", target.display()));
        }
    };
    if boot_mounted {
        detach(&layout.boot_mountpoint());
    }
    if root_mounted {
        detach(&layout.mountpoint);
    }

    let mut run = |program: &str, args: &[&str]| -> Option<String> {
        let line = format!("{program} {}", args.join(" "));
        match std::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(output) => {
                failures.push(format!(
                    "`{line}` failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
                None
            }
            Err(e) => {
                failures.push(format!("failed to start `{line}`: {e}"));
                None
            }
        }
    };
    if crypt_open && let Some(name) = &layout.crypt_name {
        run("cryptsetup", &["close", name.as_str()]);
    }

    let devices = match &layout.loop_device {
        Some(device) => vec![device.clone()],
        None if attached => {
            let raw = layout.raw_path.display().to_string();
            run("losetup", &["-j", raw.as_str()])
                .map(|out| parse_losetup_associations(&out))
                .unwrap_or_default()
        }
        None => Vec::new(),
    };
    for device in &devices {
        if partitions_mapped {
            run("kpartx", &["-d", device.as_str()]);
        }
        if attached {
            run("losetup", &["-d", device.as_str()]);
        }
    }
    failures
}

/// Loop devices backed by `raw`. Always empty in dry-run mode.
async fn associated_loop_devices(exec: &CommandExecutor, raw: &Path) -> Result<Vec<String>> {
    let output = exec
        .run_with_output(Command::new("losetup").arg("-j").arg(raw))
        .await?;
    Ok(output
        .as_deref()
        .map(parse_losetup_associations)
        .unwrap_or_default())
}

/// Device names from `losetup -j` lines such as
/// `/dev/loop3: [2049]:1311 (/tmp/disk0.raw)`.
fn parse_losetup_associations(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| device.trim())
        .filter(|device| device.starts_with("/dev/"))
        .map(str::to_string)
        .collect()
}

/// Mark `held` before running `command`, so a command interrupted by
/// cancellation is still released; clear it if the command failed.
async fn acquire(
    exec: &CommandExecutor,
    held: &mut bool,
    command: &mut Command,
) -> Result<(), ExecError> {
    *held = true;
    let result = exec.run(command).await;
    if result.is_err() {
        *held = false;
    }
    result
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Stable stand-in for `blkid` output in dry-run mode.
pub fn dry_run_uuid(device: &str) -> String {
    let mut hasher = DefaultHasher::new();
    device.hash(&mut hasher);
    let h = hasher.finish();
    format!(
        "{:08x}-{:04x}-4{:03x}-8{:03x}-{:012x}",
        (h >> 32) as u32,
        (h >> 16) as u16,
        (h >> 4) & 0xfff,
        h & 0xfff,
        h & 0xffff_ffff_ffff
    )
}
