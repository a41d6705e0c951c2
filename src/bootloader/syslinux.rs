use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::fs::BootFs;
use super::{Bootloader, BootloaderContext, BootloaderProvider, mbr, require_arch, require_boot_fs};
use crate::distro::KernelCmdline;
use crate::exec::CommandExecutor;
use crate::exec::deps::{self, HostTool};
use crate::image::error::ConfigError;
use crate::image::options::Arch;
use crate::ui::prelude::*;

const NAME: &str = "syslinux";

/// Where distributions install the syslinux MBR boot code.
pub const MBR_PATHS: &[&str] = &[
    // debian
    "/usr/lib/syslinux/mbr/mbr.bin",
    // ubuntu
    "/usr/lib/EXTLINUX/mbr.bin",
    // alpine, centos
    "/usr/share/syslinux/mbr.bin",
    // arch
    "/usr/lib/syslinux/bios/mbr.bin",
];

pub fn render_config(kernel: &str, cmdline: &KernelCmdline) -> String {
    format!(
        "DEFAULT linux\n  SAY Now booting the kernel from SYSLINUX...\n LABEL linux\n  KERNEL {kernel}\n  APPEND {cmdline}\n"
    )
}

fn locate_mbr(candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::MissingMbr {
            searched: candidates.to_vec(),
        })
}

#[derive(Debug)]
pub struct Syslinux {
    kernel: String,
    mbr: PathBuf,
}

#[async_trait]
impl Bootloader for Syslinux {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, boot_fs: BootFs) -> Result<(), ConfigError> {
        require_boot_fs(NAME, &[BootFs::Ext4], boot_fs)
    }

    fn required_tools(&self) -> Vec<HostTool> {
        vec![deps::EXTLINUX]
    }

    async fn setup(
        &self,
        exec: &CommandExecutor,
        device: &str,
        root: &Path,
        cmdline: &KernelCmdline,
    ) -> Result<()> {
        emit(Level::Info, "bootloader.syslinux", "Setting up syslinux bootloader", None);

        let boot_dir = root.join("boot");
        exec.run(Command::new("extlinux").arg("--install").arg(&boot_dir))
            .await?;

        std::fs::create_dir_all(&boot_dir)
            .with_context(|| format!("creating {}", boot_dir.display()))?;
        let cfg = boot_dir.join("syslinux.cfg");
        std::fs::write(&cfg, render_config(&self.kernel, cmdline))
            .with_context(|| format!("writing {}", cfg.display()))?;

        if exec.dry_run {
            emit(
                Level::Info,
                "bootloader.syslinux.mbr",
                &format!(
                    "[DRY RUN] write {} bytes of {} to {}",
                    mbr::BOOT_CODE_LEN,
                    self.mbr.display(),
                    device
                ),
                None,
            );
            return Ok(());
        }

        emit(Level::Info, "bootloader.syslinux.mbr", "Writing MBR", None);
        mbr::write_boot_code(&self.mbr, Path::new(device))
    }
}

#[derive(Debug, Default)]
pub struct SyslinuxProvider;

impl BootloaderProvider for SyslinuxProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "extlinux with syslinux MBR boot code (BIOS, ext4 boot)"
    }

    fn create(&self, ctx: &BootloaderContext) -> Result<Box<dyn Bootloader>, ConfigError> {
        require_arch(NAME, &[Arch::X86_64], ctx.arch)?;
        let candidates: Vec<PathBuf> = match &ctx.mbr_file {
            Some(path) => vec![path.clone()],
            None => MBR_PATHS.iter().map(PathBuf::from).collect(),
        };
        Ok(Box::new(Syslinux {
            kernel: ctx.boot.kernel.clone(),
            mbr: locate_mbr(&candidates)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::{BootConfig, OsRelease};

    fn context(dir: &Path, arch: Arch) -> BootloaderContext {
        let mbr = dir.join("mbr.bin");
        std::fs::write(&mbr, [0x90u8; mbr::BOOT_CODE_LEN]).unwrap();
        BootloaderContext {
            boot: BootConfig {
                kernel: "/boot/vmlinuz".into(),
                initrd: "/boot/initrd.img".into(),
            },
            release: OsRelease::parse("ID=debian\nVERSION_ID=12\n"),
            arch,
            mbr_file: Some(mbr),
        }
    }

    #[test]
    fn config_layout() {
        let mut cmdline = KernelCmdline::default();
        cmdline.push("ro");
        cmdline.push("root=UUID=abc");
        assert_eq!(
            render_config("/vmlinuz", &cmdline),
            "DEFAULT linux\n  SAY Now booting the kernel from SYSLINUX...\n LABEL linux\n  KERNEL /vmlinuz\n  APPEND ro root=UUID=abc\n"
        );
    }

    #[test]
    fn requires_ext4_and_x86() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SyslinuxProvider;

        let bootloader = provider.create(&context(dir.path(), Arch::X86_64)).unwrap();
        assert!(bootloader.validate(BootFs::Ext4).is_ok());
        assert!(matches!(
            bootloader.validate(BootFs::Fat32),
            Err(ConfigError::IncompatibleBootFs { .. })
        ));

        assert!(matches!(
            provider.create(&context(dir.path(), Arch::Arm64)),
            Err(ConfigError::UnsupportedArch { .. })
        ));
    }

    #[test]
    fn missing_mbr_fails_creation() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Arch::X86_64);
        ctx.mbr_file = Some(dir.path().join("nope.bin"));
        assert!(matches!(
            SyslinuxProvider.create(&ctx),
            Err(ConfigError::MissingMbr { .. })
        ));
    }

    #[tokio::test]
    async fn dry_run_setup_writes_config_but_not_mbr() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let device = dir.path().join("disk.raw");
        std::fs::write(&device, [0u8; 512]).unwrap();

        let bootloader = SyslinuxProvider
            .create(&context(dir.path(), Arch::X86_64))
            .unwrap();
        let exec = CommandExecutor::new(true);
        let mut cmdline = KernelCmdline::default();
        cmdline.push("ro");

        bootloader
            .setup(&exec, device.to_str().unwrap(), &root, &cmdline)
            .await
            .unwrap();

        let journal = exec.journal();
        assert_eq!(journal.len(), 1);
        assert!(journal[0].starts_with("extlinux --install"));
        let cfg = std::fs::read_to_string(root.join("boot/syslinux.cfg")).unwrap();
        assert!(cfg.contains("KERNEL /boot/vmlinuz"));
        assert!(cfg.contains("APPEND ro"));
        assert_eq!(std::fs::read(&device).unwrap(), vec![0u8; 512]);
    }
}
