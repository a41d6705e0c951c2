use super::fs::BootFs;
use super::grub::{Grub, GrubTarget};
use super::{Bootloader, BootloaderContext, BootloaderProvider, require_arch};
use crate::image::error::ConfigError;
use crate::image::options::Arch;

const NAME: &str = "grub-bios";

#[derive(Debug, Default)]
pub struct GrubBiosProvider;

impl BootloaderProvider for GrubBiosProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "GRUB for legacy BIOS (i386-pc), ext4 or fat32 boot"
    }

    fn create(&self, ctx: &BootloaderContext) -> Result<Box<dyn Bootloader>, ConfigError> {
        require_arch(NAME, &[Arch::X86_64], ctx.arch)?;
        let grub_name = ctx.release.profile().map(|p| p.grub_name).unwrap_or("grub");
        Ok(Box::new(Grub {
            name: NAME,
            grub_name,
            targets: vec![GrubTarget::Bios],
            accepted: &[BootFs::Ext4, BootFs::Fat32],
        }))
    }
}
