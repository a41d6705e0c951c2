use super::fs::BootFs;
use super::grub::{Grub, GrubTarget};
use super::{Bootloader, BootloaderContext, BootloaderProvider, require_arch};
use crate::image::error::ConfigError;
use crate::image::options::Arch;

const NAME: &str = "grub-efi";

/// Checks shared by every strategy that installs an EFI image.
pub(crate) fn require_efi_distribution(
    bootloader: &'static str,
    ctx: &BootloaderContext,
) -> Result<&'static str, ConfigError> {
    match ctx.release.profile() {
        Some(profile) if profile.efi_supported => Ok(profile.grub_name),
        _ => Err(ConfigError::UnsupportedByBootloader {
            bootloader,
            distribution: ctx.release.id.to_string(),
        }),
    }
}

#[derive(Debug, Default)]
pub struct GrubEfiProvider;

impl BootloaderProvider for GrubEfiProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "GRUB for UEFI (removable path), fat32 boot"
    }

    fn mandated_boot_fs(&self) -> Option<BootFs> {
        Some(BootFs::Fat32)
    }

    fn create(&self, ctx: &BootloaderContext) -> Result<Box<dyn Bootloader>, ConfigError> {
        require_arch(NAME, &[Arch::X86_64, Arch::Arm64], ctx.arch)?;
        let grub_name = require_efi_distribution(NAME, ctx)?;
        Ok(Box::new(Grub {
            name: NAME,
            grub_name,
            targets: vec![GrubTarget::Efi(ctx.arch)],
            accepted: &[BootFs::Fat32],
        }))
    }
}
