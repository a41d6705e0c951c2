use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::ConfigError;
use crate::bootloader::fs::BootFs;
use crate::ui::prelude::*;

pub const DEFAULT_DISK_NAME: &str = "disk0";
pub const DEFAULT_BOOT_SIZE_MIB: u64 = 100;
pub const MIN_BOOT_SIZE_MIB: u64 = 50;
pub const MIB: u64 = 1024 * 1024;

/// Output formats `qemu-img` is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageFormat {
    Qcow2,
    Qed,
    #[default]
    Raw,
    Vdi,
    Vhdx,
    Vhd,
    Vmdk,
}

impl ImageFormat {
    pub const ALL: &'static [ImageFormat] = &[
        ImageFormat::Qcow2,
        ImageFormat::Qed,
        ImageFormat::Raw,
        ImageFormat::Vdi,
        ImageFormat::Vhdx,
        ImageFormat::Vhd,
        ImageFormat::Vmdk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Qed => "qed",
            ImageFormat::Raw => "raw",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vmdk => "vmdk",
        }
    }

    /// `qemu-img` calls the vhd format `vpc`.
    pub fn qemu_name(self) -> &'static str {
        match self {
            ImageFormat::Vhd => "vpc",
            other => other.as_str(),
        }
    }

    /// Format implied by an output path's extension; `raw` without one.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            None => Ok(ImageFormat::Raw),
            Some(ext) => ext.parse(),
        }
    }

    pub fn valid_list() -> String {
        Self::ALL
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for ImageFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| ConfigError::InvalidFormat {
                value: s.to_string(),
                valid: Self::valid_list(),
            })
    }
}

impl TryFrom<String> for ImageFormat {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageFormat> for String {
    fn from(format: ImageFormat) -> Self {
        format.as_str().to_string()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    pub fn efi_target(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64-efi",
            Arch::Arm64 => "arm64-efi",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        })
    }
}

/// Target platform in container notation (`linux/amd64`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(pub String);

impl Platform {
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Platform("linux/arm64".to_string()),
            _ => Platform("linux/amd64".to_string()),
        }
    }

    pub fn arch(&self) -> Result<Arch, ConfigError> {
        match self.0.trim() {
            "linux/amd64" => Ok(Arch::X86_64),
            "linux/arm64" | "linux/aarch64" => Ok(Arch::Arm64),
            other => Err(ConfigError::InvalidPlatform(other.to_string())),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical disk size in bytes. Parses `10G`, `512M`, `1.5T`, or plain bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DiskSize(pub u64);

impl DiskSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for DiskSize {
    fn default() -> Self {
        DiskSize(10 * 1024 * MIB)
    }
}

impl FromStr for DiskSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSize(s.to_string());
        let trimmed = s.trim();
        let upper = trimmed.to_uppercase();
        let number = upper
            .trim_end_matches("IB")
            .trim_end_matches('B');
        let (digits, multiplier) = match number.chars().last() {
            Some('K') => (&number[..number.len() - 1], 1024),
            Some('M') => (&number[..number.len() - 1], MIB),
            Some('G') => (&number[..number.len() - 1], 1024 * MIB),
            Some('T') => (&number[..number.len() - 1], 1024 * 1024 * MIB),
            Some(c) if c.is_ascii_digit() => (number, 1),
            _ => return Err(invalid()),
        };
        let value: f64 = digits.trim().parse().map_err(|_| invalid())?;
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid());
        }
        Ok(DiskSize((value * multiplier as f64) as u64))
    }
}

impl TryFrom<String> for DiskSize {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DiskSize> for String {
    fn from(size: DiskSize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 4] = [
            ("T", 1024 * 1024 * MIB),
            ("G", 1024 * MIB),
            ("M", MIB),
            ("K", 1024),
        ];
        for (unit, factor) in UNITS {
            if self.0 >= factor && self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, unit);
            }
        }
        write!(f, "{}", self.0)
    }
}

/// Everything a build can be asked to do, as loaded from a TOML file or
/// assembled from command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    pub size: DiskSize,
    pub format: ImageFormat,
    pub disk_name: String,
    pub cmdline: Vec<String>,
    pub split_boot: bool,
    pub boot_size_mib: u64,
    pub boot_fs: Option<BootFs>,
    #[serde(skip_serializing)]
    pub luks_password: Option<String>,
    pub bootloader: Option<String>,
    pub platform: Platform,
    /// syslinux MBR boot code to use instead of searching the host.
    pub mbr_file: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            size: DiskSize::default(),
            format: ImageFormat::default(),
            disk_name: DEFAULT_DISK_NAME.to_string(),
            cmdline: Vec::new(),
            split_boot: false,
            boot_size_mib: DEFAULT_BOOT_SIZE_MIB,
            boot_fs: None,
            luks_password: None,
            bootloader: None,
            platform: Platform::default(),
            mbr_file: None,
        }
    }
}

impl BuildOptions {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading build options from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing build options from {}", path.display()))
    }

    /// Split an extra kernel command line the way a shell would.
    pub fn set_cmdline(&mut self, raw: &str) -> Result<()> {
        self.cmdline = shell_words::split(raw)
            .with_context(|| format!("invalid kernel command line: {raw}"))?;
        Ok(())
    }

    /// Bootloader to use when none was requested: `grub-efi` is the only
    /// choice on arm64.
    pub fn bootloader_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = &self.bootloader {
            return Ok(name.clone());
        }
        Ok(match self.platform.arch()? {
            Arch::Arm64 => "grub-efi".to_string(),
            Arch::X86_64 => "syslinux".to_string(),
        })
    }

    pub fn boot_fs(&self) -> BootFs {
        self.boot_fs.unwrap_or_default()
    }

    /// Turn on a separate boot partition where the other options need one.
    pub fn normalize(&mut self) {
        if self.luks_password.is_some() && !self.split_boot {
            emit(
                Level::Warn,
                "image.options.split_boot",
                "Disk encryption needs a separate boot partition, enabling split boot",
                None,
            );
            self.split_boot = true;
        }
        if self.boot_fs.is_some() && !self.split_boot {
            emit(
                Level::Warn,
                "image.options.split_boot",
                "A boot filesystem was selected, enabling split boot",
                None,
            );
            self.split_boot = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!("QCOW2".parse::<ImageFormat>().unwrap(), ImageFormat::Qcow2);
        assert_eq!("vmdk".parse::<ImageFormat>().unwrap(), ImageFormat::Vmdk);
        let err = "iso".parse::<ImageFormat>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid format: iso, valid formats are: qcow2, qed, raw, vdi, vhdx, vhd, vmdk"
        );
    }

    #[test]
    fn format_from_output_path() {
        assert_eq!(ImageFormat::from_path(Path::new("out/disk")).unwrap(), ImageFormat::Raw);
        assert_eq!(ImageFormat::from_path(Path::new("disk.vhd")).unwrap(), ImageFormat::Vhd);
        assert!(ImageFormat::from_path(Path::new("disk.iso")).is_err());
        assert_eq!(ImageFormat::Vhd.qemu_name(), "vpc");
    }

    #[test]
    fn platforms_map_to_architectures() {
        assert_eq!(Platform("linux/amd64".into()).arch().unwrap(), Arch::X86_64);
        assert_eq!(Platform("linux/arm64".into()).arch().unwrap(), Arch::Arm64);
        assert_eq!(Platform("linux/aarch64".into()).arch().unwrap(), Arch::Arm64);
        assert!(Platform("windows/amd64".into()).arch().is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!("10G".parse::<DiskSize>().unwrap().bytes(), 10 * 1024 * MIB);
        assert_eq!("512M".parse::<DiskSize>().unwrap().bytes(), 512 * MIB);
        assert_eq!("512MiB".parse::<DiskSize>().unwrap().bytes(), 512 * MIB);
        assert_eq!("1.5G".parse::<DiskSize>().unwrap().bytes(), 1536 * MIB);
        assert_eq!("4096".parse::<DiskSize>().unwrap().bytes(), 4096);
        assert!("".parse::<DiskSize>().is_err());
        assert!("ten".parse::<DiskSize>().is_err());
        assert!("-1G".parse::<DiskSize>().is_err());
        assert_eq!(DiskSize(10 * 1024 * MIB).to_string(), "10G");
        assert_eq!(DiskSize(1536 * MIB).to_string(), "1536M");
    }

    #[test]
    fn default_bootloader_follows_architecture() {
        let mut opts = BuildOptions {
            platform: Platform("linux/amd64".into()),
            ..Default::default()
        };
        assert_eq!(opts.bootloader_name().unwrap(), "syslinux");
        opts.platform = Platform("linux/arm64".into());
        assert_eq!(opts.bootloader_name().unwrap(), "grub-efi");
        opts.bootloader = Some("grub-bios".into());
        assert_eq!(opts.bootloader_name().unwrap(), "grub-bios");
    }

    #[test]
    fn normalize_enables_split_boot() {
        let mut opts = BuildOptions {
            luks_password: Some("secret".into()),
            ..Default::default()
        };
        opts.normalize();
        assert!(opts.split_boot);

        let mut opts = BuildOptions {
            boot_fs: Some(BootFs::Fat32),
            ..Default::default()
        };
        opts.normalize();
        assert!(opts.split_boot);

        let mut opts = BuildOptions::default();
        opts.normalize();
        assert!(!opts.split_boot);
    }

    #[test]
    fn cmdline_is_split_like_a_shell() {
        let mut opts = BuildOptions::default();
        opts.set_cmdline(r#"quiet console=ttyS1 "init=/bin/sh -x""#).unwrap();
        assert_eq!(opts.cmdline, vec!["quiet", "console=ttyS1", "init=/bin/sh -x"]);
        assert!(opts.set_cmdline("unterminated \"quote").is_err());
    }

    #[test]
    fn loads_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.toml");
        std::fs::write(
            &path,
            r#"
size = "2G"
format = "qcow2"
split_boot = true
boot_fs = "fat32"
bootloader = "grub-efi"
cmdline = ["quiet"]
"#,
        )
        .unwrap();
        let opts = BuildOptions::from_file(&path).unwrap();
        assert_eq!(opts.size.bytes(), 2 * 1024 * MIB);
        assert_eq!(opts.format, ImageFormat::Qcow2);
        assert_eq!(opts.boot_fs, Some(BootFs::Fat32));
        assert_eq!(opts.disk_name, DEFAULT_DISK_NAME);
        assert_eq!(opts.boot_size_mib, DEFAULT_BOOT_SIZE_MIB);

        std::fs::write(&path, "format = \"iso\"\n").unwrap();
        let err = BuildOptions::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid format: iso"));
    }
}
