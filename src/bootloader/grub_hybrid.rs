use super::fs::BootFs;
use super::grub::{Grub, GrubTarget};
use super::grub_efi::require_efi_distribution;
use super::{Bootloader, BootloaderContext, BootloaderProvider, require_arch};
use crate::image::error::ConfigError;
use crate::image::options::Arch;

const NAME: &str = "grub";

/// Installs GRUB for both BIOS and UEFI so the disk boots either way.
#[derive(Debug, Default)]
pub struct GrubHybridProvider;

impl BootloaderProvider for GrubHybridProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "GRUB for both BIOS and UEFI, fat32 boot"
    }

    fn mandated_boot_fs(&self) -> Option<BootFs> {
        Some(BootFs::Fat32)
    }

    fn create(&self, ctx: &BootloaderContext) -> Result<Box<dyn Bootloader>, ConfigError> {
        require_arch(NAME, &[Arch::X86_64], ctx.arch)?;
        let grub_name = require_efi_distribution(NAME, ctx)?;
        Ok(Box::new(Grub {
            name: NAME,
            grub_name,
            targets: vec![GrubTarget::Bios, GrubTarget::Efi(Arch::X86_64)],
            accepted: &[BootFs::Fat32],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::{BootConfig, KernelCmdline, OsRelease};
    use crate::exec::CommandExecutor;

    fn ctx(os_release: &str, arch: Arch) -> BootloaderContext {
        BootloaderContext {
            boot: BootConfig {
                kernel: "/vmlinuz".into(),
                initrd: "/initrd.img".into(),
            },
            release: OsRelease::parse(os_release),
            arch,
            mbr_file: None,
        }
    }

    #[tokio::test]
    async fn installs_bios_then_efi() {
        let dir = tempfile::tempdir().unwrap();
        let grub = GrubHybridProvider
            .create(&ctx("ID=ubuntu\nVERSION_ID=22.04", Arch::X86_64))
            .unwrap();
        assert!(grub.validate(BootFs::Fat32).is_ok());
        assert!(grub.validate(BootFs::Ext4).is_err());

        let exec = CommandExecutor::new(true);
        grub.setup(&exec, "/dev/loop0", dir.path(), &KernelCmdline::default())
            .await
            .unwrap();
        let installs: Vec<String> = exec
            .journal()
            .into_iter()
            .filter(|l| l.contains("grub-install"))
            .collect();
        assert_eq!(installs.len(), 2);
        assert!(installs[0].contains("--target=i386-pc"));
        assert!(installs[1].contains("--target=x86_64-efi"));
    }

    #[test]
    fn rejects_centos_and_arm() {
        assert!(
            GrubHybridProvider
                .create(&ctx("ID=centos\nVERSION_ID=8", Arch::X86_64))
                .is_err()
        );
        assert!(
            GrubHybridProvider
                .create(&ctx("ID=debian\nVERSION_ID=12", Arch::Arm64))
                .is_err()
        );
    }
}
