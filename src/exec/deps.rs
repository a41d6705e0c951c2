//! Host tool requirements.
//!
//! Every tool the pipeline shells out to is declared up front so that a
//! build fails before touching any disk when the host is incomplete.

use duct::cmd;
use std::fmt;
use thiserror::Error;

/// Tests for determining whether a dependency is available on the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallTest {
    /// Succeeds when `which <program>` resolves.
    WhichSucceeds(&'static str),
    /// Succeeds when the command exits with status 0.
    CommandSucceeds {
        program: &'static str,
        args: &'static [&'static str],
    },
}

impl InstallTest {
    pub fn run(self) -> bool {
        match self {
            InstallTest::WhichSucceeds(program) => which::which(program).is_ok(),
            InstallTest::CommandSucceeds { program, args } => cmd(program, args)
                .stdout_null()
                .stderr_null()
                .unchecked()
                .run()
                .map(|output| output.status.success())
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTool {
    pub name: &'static str,
    /// Package that usually ships the tool, shown in error messages.
    pub package: &'static str,
    pub test: InstallTest,
}

impl HostTool {
    pub const fn binary(name: &'static str, package: &'static str) -> Self {
        Self {
            name,
            package,
            test: InstallTest::WhichSucceeds(name),
        }
    }

    pub fn is_available(&self) -> bool {
        self.test.run()
    }
}

impl fmt::Display for HostTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.name, self.package)
    }
}

pub const MOUNT: HostTool = HostTool::binary("mount", "util-linux");
pub const UMOUNT: HostTool = HostTool::binary("umount", "util-linux");
pub const BLKID: HostTool = HostTool::binary("blkid", "util-linux");
pub const LOSETUP: HostTool = HostTool::binary("losetup", "util-linux");
pub const TAR: HostTool = HostTool::binary("tar", "tar");
pub const CP: HostTool = HostTool::binary("cp", "coreutils");
pub const PARTED: HostTool = HostTool::binary("parted", "parted");
pub const KPARTX: HostTool = HostTool::binary("kpartx", "kpartx / multipath-tools");
pub const QEMU_IMG: HostTool = HostTool::binary("qemu-img", "qemu-utils / qemu-img");
pub const MKFS_EXT4: HostTool = HostTool::binary("mkfs.ext4", "e2fsprogs");
pub const MKFS_FAT: HostTool = HostTool::binary("mkfs.fat", "dosfstools");
pub const CRYPTSETUP: HostTool = HostTool::binary("cryptsetup", "cryptsetup");
pub const EXTLINUX: HostTool = HostTool::binary("extlinux", "extlinux / syslinux");
pub const CHROOT: HostTool = HostTool::binary("chroot", "coreutils");
pub const DOCKER: HostTool = HostTool {
    name: "docker",
    package: "docker (with a running daemon)",
    test: InstallTest::CommandSucceeds {
        program: "docker",
        args: &["info"],
    },
};

/// Tools every image build needs regardless of options.
pub const BASE_TOOLS: &[HostTool] = &[
    MOUNT, UMOUNT, BLKID, LOSETUP, PARTED, KPARTX, QEMU_IMG, MKFS_EXT4,
];

#[derive(Debug, Error)]
#[error("missing host dependencies: {}", list(.missing))]
pub struct DependencyError {
    pub missing: Vec<HostTool>,
}

fn list(tools: &[HostTool]) -> String {
    tools
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks every tool and reports all missing ones at once.
pub fn check_tools(tools: &[HostTool]) -> Result<(), DependencyError> {
    check_with(tools, HostTool::is_available)
}

fn check_with(
    tools: &[HostTool],
    available: impl Fn(&HostTool) -> bool,
) -> Result<(), DependencyError> {
    let mut missing: Vec<HostTool> = Vec::new();
    for tool in tools {
        if !missing.iter().any(|m| m.name == tool.name) && !available(tool) {
            missing.push(*tool);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DependencyError { missing })
    }
}
