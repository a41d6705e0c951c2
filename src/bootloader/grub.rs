//! GRUB installation shared by the `grub`, `grub-bios` and `grub-efi`
//! strategies. GRUB is installed from inside the image with `chroot`, so the
//! host's `/dev`, `/proc` and `/sys` are bind-mounted into it for the
//! duration of the install.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::fs::BootFs;
use super::{Bootloader, require_boot_fs};
use crate::distro::KernelCmdline;
use crate::exec::{CommandExecutor, ExecError};
use crate::exec::deps::{self, HostTool};
use crate::image::error::{ConfigError, TeardownError};
use crate::image::options::Arch;
use crate::ui::prelude::*;

const BIND_MOUNTS: &[&str] = &["dev", "proc", "sys"];

pub fn render_defaults(cmdline: &KernelCmdline) -> String {
    format!(
        "GRUB_DEFAULT=0\n\
         GRUB_HIDDEN_TIMEOUT=0\n\
         GRUB_HIDDEN_TIMEOUT_QUIET=true\n\
         GRUB_TIMEOUT=0\n\
         GRUB_CMDLINE_LINUX_DEFAULT=\"{cmdline}\"\n\
         GRUB_CMDLINE_LINUX=\"\"\n\
         GRUB_TERMINAL=console\n"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrubTarget {
    Bios,
    Efi(Arch),
}

impl GrubTarget {
    pub fn install_args(self, device: &str) -> Vec<String> {
        match self {
            GrubTarget::Bios => vec![
                "--target=i386-pc".to_string(),
                "--boot-directory=/boot".to_string(),
                device.to_string(),
            ],
            GrubTarget::Efi(arch) => vec![
                format!("--target={}", arch.efi_target()),
                "--efi-directory=/boot".to_string(),
                "--no-nvram".to_string(),
                "--removable".to_string(),
                "--no-floppy".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrubState {
    Uninitialized,
    BindMounted,
    Installed,
    Configured,
    BindUnmounted,
}

/// Host pseudo-filesystems bind-mounted into the image.
///
/// `release` is the normal way out. If the owning future is dropped before
/// that (cancellation), `Drop` detaches whatever is still mounted.
struct BindMounts {
    mounted: Vec<PathBuf>,
    dry_run: bool,
}

impl BindMounts {
    fn new(dry_run: bool) -> Self {
        Self {
            mounted: Vec::new(),
            dry_run,
        }
    }

    async fn mount(&mut self, exec: &CommandExecutor, root: &Path) -> Result<()> {
        for name in BIND_MOUNTS {
            let target = root.join(name);
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
            // Tracked before mounting: an interrupted mount may still land.
            self.mounted.push(target.clone());
            if let Err(e) = exec
                .run(
                    Command::new("mount")
                        .args(["-o", "bind"])
                        .arg(format!("/{name}"))
                        .arg(&target),
                )
                .await
            {
                self.mounted.pop();
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn release(&mut self, exec: &CommandExecutor) -> Result<(), TeardownError> {
        let mut errors = TeardownError::default();
        let mut still_mounted = Vec::new();
        while let Some(target) = self.mounted.pop() {
            match exec.run(Command::new("umount").arg(&target)).await {
                Ok(()) => {}
                Err(e) if not_mounted(&e) => {}
                Err(e) => {
                    errors.push(e);
                    still_mounted.push(target);
                }
            }
        }
        still_mounted.reverse();
        self.mounted = still_mounted;
        errors.into_result()
    }
}

impl Drop for BindMounts {
    fn drop(&mut self) {
        if self.dry_run {
            return;
        }
        while let Some(target) = self.mounted.pop() {
            emit(
                Level::Warn,
                "bootloader.grub.detach",
                &format!("Lazily detaching {}", target.display()),
                None,
            );
            match nix::mount::umount2(&target, nix::mount::MntFlags::MNT_DETACH) {
                // EINVAL: not a mount point, the bind mount never happened
                Ok(()) | Err(nix::errno::Errno::EINVAL) => {}
                Err(e) => emit(
                    Level::Error,
                    "bootloader.grub.detach",
                    &format!("Detaching {}: {e}", target.display()),
                    None,
                ),
            }
        }
    }
}

/// `umount` refusing because the target is not a mount point.
fn not_mounted(error: &ExecError) -> bool {
    matches!(error, ExecError::Failed { stderr, .. } if stderr.contains("not mounted"))
}

/// One run of the GRUB installer against a mounted image.
pub struct GrubSession<'a> {
    exec: &'a CommandExecutor,
    root: &'a Path,
    grub_name: &'static str,
    state: GrubState,
    mounts: BindMounts,
}

impl<'a> GrubSession<'a> {
    pub fn new(exec: &'a CommandExecutor, root: &'a Path, grub_name: &'static str) -> Self {
        Self {
            exec,
            root,
            grub_name,
            state: GrubState::Uninitialized,
            mounts: BindMounts::new(exec.dry_run),
        }
    }

    pub fn state(&self) -> GrubState {
        self.state
    }

    fn advance(&mut self, next: GrubState) {
        emit(
            Level::Debug,
            "bootloader.grub.state",
            &format!("grub: {:?} -> {:?}", self.state, next),
            None,
        );
        self.state = next;
    }

    pub async fn prepare(&mut self, cmdline: &KernelCmdline) -> Result<()> {
        let defaults = self.root.join("etc/default/grub");
        if let Some(parent) = defaults.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&defaults, render_defaults(cmdline))
            .with_context(|| format!("writing {}", defaults.display()))?;

        let grub_dir = self.root.join("boot").join(self.grub_name);
        std::fs::create_dir_all(&grub_dir)
            .with_context(|| format!("creating {}", grub_dir.display()))?;

        self.mounts.mount(self.exec, self.root).await?;
        self.advance(GrubState::BindMounted);
        Ok(())
    }

    pub async fn install(&mut self, target: GrubTarget, device: &str) -> Result<()> {
        if !matches!(self.state, GrubState::BindMounted | GrubState::Installed) {
            anyhow::bail!("grub install attempted in state {:?}", self.state);
        }
        self.exec
            .run(
                Command::new("chroot")
                    .arg(self.root)
                    .arg(format!("{}-install", self.grub_name))
                    .args(target.install_args(device)),
            )
            .await?;
        self.advance(GrubState::Installed);
        Ok(())
    }

    pub async fn mkconfig(&mut self) -> Result<()> {
        if self.state != GrubState::Installed {
            anyhow::bail!("grub-mkconfig attempted in state {:?}", self.state);
        }
        self.exec
            .run(
                Command::new("chroot")
                    .arg(self.root)
                    .arg(format!("{}-mkconfig", self.grub_name))
                    .arg("-o")
                    .arg(format!("/boot/{}/grub.cfg", self.grub_name)),
            )
            .await?;
        self.advance(GrubState::Configured);
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<(), TeardownError> {
        self.mounts.release(self.exec).await?;
        self.advance(GrubState::BindUnmounted);
        Ok(())
    }
}

/// Run the complete sequence. Bind mounts are released on every path.
pub async fn install_grub(
    exec: &CommandExecutor,
    root: &Path,
    grub_name: &'static str,
    targets: &[GrubTarget],
    device: &str,
    cmdline: &KernelCmdline,
) -> Result<GrubState> {
    let mut session = GrubSession::new(exec, root, grub_name);

    let result = async {
        session.prepare(cmdline).await?;
        for target in targets {
            session.install(*target, device).await?;
        }
        session.mkconfig().await
    }
    .await;

    let released = session.finish().await;
    match (result, released) {
        (Ok(()), Ok(())) => Ok(session.state()),
        (Ok(()), Err(teardown)) => Err(teardown.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            emit(
                Level::Error,
                "bootloader.grub.cleanup",
                &format!("Failed to release bind mounts: {teardown}"),
                None,
            );
            Err(e)
        }
    }
}

/// A GRUB strategy: which targets to install and which boot filesystems
/// it can live on.
#[derive(Debug)]
pub struct Grub {
    pub name: &'static str,
    pub grub_name: &'static str,
    pub targets: Vec<GrubTarget>,
    pub accepted: &'static [BootFs],
}

#[async_trait]
impl Bootloader for Grub {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, boot_fs: BootFs) -> Result<(), ConfigError> {
        require_boot_fs(self.name, self.accepted, boot_fs)
    }

    fn required_tools(&self) -> Vec<HostTool> {
        vec![deps::CHROOT]
    }

    async fn setup(
        &self,
        exec: &CommandExecutor,
        device: &str,
        root: &Path,
        cmdline: &KernelCmdline,
    ) -> Result<()> {
        emit(
            Level::Info,
            "bootloader.grub",
            &format!("Setting up {} bootloader", self.name),
            None,
        );
        install_grub(exec, root, self.grub_name, &self.targets, device, cmdline).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmdline() -> KernelCmdline {
        let mut c = KernelCmdline::default();
        c.push("ro");
        c.push("root=UUID=abc");
        c
    }

    #[test]
    fn defaults_file_carries_cmdline() {
        let text = render_defaults(&cmdline());
        assert!(text.starts_with("GRUB_DEFAULT=0\nGRUB_HIDDEN_TIMEOUT=0\n"));
        assert!(text.contains("GRUB_CMDLINE_LINUX_DEFAULT=\"ro root=UUID=abc\"\n"));
        assert!(text.contains("GRUB_CMDLINE_LINUX=\"\"\n"));
        assert!(text.ends_with("GRUB_TERMINAL=console\n"));
    }

    #[test]
    fn install_arguments() {
        assert_eq!(
            GrubTarget::Bios.install_args("/dev/loop0"),
            vec!["--target=i386-pc", "--boot-directory=/boot", "/dev/loop0"]
        );
        let efi = GrubTarget::Efi(Arch::Arm64).install_args("/dev/loop0");
        assert_eq!(efi[0], "--target=arm64-efi");
        assert!(efi.contains(&"--removable".to_string()));
        assert!(!efi.contains(&"/dev/loop0".to_string()));
    }

    #[tokio::test]
    async fn full_sequence_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(true);

        let state = install_grub(
            &exec,
            dir.path(),
            "grub2",
            &[GrubTarget::Bios, GrubTarget::Efi(Arch::X86_64)],
            "/dev/loop0",
            &cmdline(),
        )
        .await
        .unwrap();
        assert_eq!(state, GrubState::BindUnmounted);

        let journal = exec.journal();
        let programs: Vec<&str> = journal
            .iter()
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(
            programs,
            vec![
                "mount", "mount", "mount", "chroot", "chroot", "chroot", "umount", "umount",
                "umount"
            ]
        );
        assert!(journal[3].contains("grub2-install --target=i386-pc"));
        assert!(journal[4].contains("grub2-install --target=x86_64-efi"));
        assert!(journal[5].ends_with("grub2-mkconfig -o /boot/grub2/grub.cfg"));
        assert!(journal[6].ends_with("/sys"));
        assert!(journal[8].ends_with("/dev"));
        assert!(dir.path().join("boot/grub2").is_dir());
        assert!(dir.path().join("etc/default/grub").is_file());
    }

    #[tokio::test]
    async fn bind_mounts_released_when_install_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(true).failing_on("chroot");

        let err = install_grub(
            &exec,
            dir.path(),
            "grub",
            &[GrubTarget::Bios],
            "/dev/loop0",
            &cmdline(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("grub-install"));

        let journal = exec.journal();
        let unmounts = journal.iter().filter(|l| l.starts_with("umount")).count();
        assert_eq!(unmounts, 3);
        assert!(!journal.iter().any(|l| l.contains("grub-mkconfig")));
    }

    #[tokio::test]
    async fn mkconfig_requires_install() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(true);
        let mut session = GrubSession::new(&exec, dir.path(), "grub");
        assert!(session.mkconfig().await.is_err());
        assert!(session.install(GrubTarget::Bios, "/dev/loop0").await.is_err());
        assert_eq!(session.state(), GrubState::Uninitialized);
    }

    #[tokio::test]
    async fn failed_bind_mount_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(true).failing_on("mount");
        let mut mounts = BindMounts::new(true);
        assert!(mounts.mount(&exec, dir.path()).await.is_err());
        assert!(mounts.mounted.is_empty());
        assert!(mounts.release(&exec).await.is_ok());
        assert_eq!(exec.journal().len(), 1);
    }

    #[tokio::test]
    async fn unreleased_targets_stay_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(true);
        let mut mounts = BindMounts::new(true);
        mounts.mount(&exec, dir.path()).await.unwrap();
        assert_eq!(mounts.mounted.len(), 3);

        let failing = CommandExecutor::new(true).failing_on("umount");
        assert!(mounts.release(&failing).await.is_err());
        assert_eq!(mounts.mounted.len(), 3);
        assert_eq!(mounts.mounted[0], dir.path().join("dev"));

        mounts.release(&exec).await.unwrap();
        assert!(mounts.mounted.is_empty());
    }

    #[test]
    fn not_mounted_is_recognized() {
        let failed = |stderr: &str| ExecError::Failed {
            command: "umount /mnt/sys".into(),
            status: "exit status: 32".into(),
            stdout: String::new(),
            stderr: stderr.into(),
        };
        assert!(not_mounted(&failed("umount: /mnt/sys: not mounted.")));
        assert!(!not_mounted(&failed("umount: /mnt/sys: target is busy.")));
    }
}
