use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with a build request, all detected before any disk is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid format: {value}, valid formats are: {valid}")]
    InvalidFormat { value: String, valid: String },
    #[error("unsupported platform: {0}, supported platforms are: linux/amd64, linux/arm64")]
    InvalidPlatform(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("invalid boot filesystem: {0}, valid values are: ext4, fat32")]
    InvalidBootFs(String),
    #[error("unknown bootloader: {name}, available bootloaders are: {available}")]
    UnknownBootloader { name: String, available: String },
    #[error("{0}: distribution not supported")]
    UnsupportedDistribution(String),
    #[error("a boot filesystem can only be used with a separate boot partition")]
    BootFsRequiresSplitBoot,
    #[error("disk encryption requires a separate boot partition")]
    LuksRequiresSplitBoot,
    #[error("disk encryption is not supported on {0}")]
    LuksUnsupported(String),
    #[error("boot partition must be at least 50 MiB (got {0} MiB)")]
    BootSizeTooSmall(u64),
    #[error("boot partition ({boot_mib} MiB) must be smaller than the disk ({disk_bytes} bytes)")]
    BootSizeTooLarge { boot_mib: u64, disk_bytes: u64 },
    #[error("{bootloader} requires a {required} boot filesystem, got {actual}")]
    IncompatibleBootFs {
        bootloader: &'static str,
        required: &'static str,
        actual: String,
    },
    #[error("{bootloader} does not support the {arch} architecture")]
    UnsupportedArch { bootloader: &'static str, arch: String },
    #[error("{bootloader} is not supported on {distribution}")]
    UnsupportedByBootloader {
        bootloader: &'static str,
        distribution: String,
    },
    #[error("syslinux MBR boot code not found, searched: {}", display_paths(.searched))]
    MissingMbr { searched: Vec<PathBuf> },
    #[error("{} already exists, use --force to overwrite", .0.display())]
    OutputExists(PathBuf),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The caller asked the build to stop.
#[derive(Debug, Error)]
#[error("build cancelled")]
pub struct Cancelled;

/// Every failure collected while releasing loop devices, mappings and mounts.
#[derive(Debug, Default)]
pub struct TeardownError {
    pub errors: Vec<anyhow::Error>,
}

impl TeardownError {
    pub fn push(&mut self, error: impl Into<anyhow::Error>) {
        self.errors.push(error.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), TeardownError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teardown failed with {} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {error:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}
