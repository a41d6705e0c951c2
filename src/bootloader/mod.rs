//! Bootloader strategies.
//!
//! Each strategy is a provider registered by name in [`registry::REGISTRY`].
//! The provider checks the target (architecture, distribution) when it
//! creates the strategy; the strategy then checks the boot filesystem and
//! finally installs itself into the mounted image.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::distro::{BootConfig, KernelCmdline, OsRelease};
use crate::exec::CommandExecutor;
use crate::exec::deps::HostTool;
use crate::image::error::ConfigError;
use crate::image::options::Arch;

pub mod fs;
pub mod grub;
pub mod grub_bios;
pub mod grub_efi;
pub mod grub_hybrid;
pub mod mbr;
pub mod registry;
pub mod syslinux;

use self::fs::BootFs;

/// What a provider needs to know to build a strategy.
#[derive(Debug, Clone)]
pub struct BootloaderContext {
    pub boot: BootConfig,
    pub release: OsRelease,
    pub arch: Arch,
    /// Explicit syslinux MBR blob instead of the well-known locations.
    pub mbr_file: Option<PathBuf>,
}

#[async_trait]
pub trait Bootloader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject boot filesystems the bootloader cannot read.
    fn validate(&self, boot_fs: BootFs) -> Result<(), ConfigError>;

    fn required_tools(&self) -> Vec<HostTool> {
        Vec::new()
    }

    /// Install into the image whose root is mounted at `root` and whose
    /// whole-disk device is `device`.
    async fn setup(
        &self,
        exec: &CommandExecutor,
        device: &str,
        root: &Path,
        cmdline: &KernelCmdline,
    ) -> Result<()>;
}

pub trait BootloaderProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Boot filesystem this bootloader cannot work without. Selecting it
    /// forces a separate boot partition with that filesystem.
    fn mandated_boot_fs(&self) -> Option<BootFs> {
        None
    }

    fn create(&self, ctx: &BootloaderContext) -> Result<Box<dyn Bootloader>, ConfigError>;
}

/// Shared check for strategies that only accept some boot filesystems.
pub(crate) fn require_boot_fs(
    bootloader: &'static str,
    accepted: &[BootFs],
    actual: BootFs,
) -> Result<(), ConfigError> {
    if accepted.contains(&actual) {
        return Ok(());
    }
    Err(ConfigError::IncompatibleBootFs {
        bootloader,
        required: accepted
            .first()
            .map(|fs| fs.as_str())
            .unwrap_or_default(),
        actual: actual.to_string(),
    })
}

pub(crate) fn require_arch(
    bootloader: &'static str,
    supported: &[Arch],
    actual: Arch,
) -> Result<(), ConfigError> {
    if supported.contains(&actual) {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedArch {
            bootloader,
            arch: actual.to_string(),
        })
    }
}
