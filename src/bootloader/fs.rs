use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::image::error::ConfigError;

const MKFS_EXT4_ARGS: &[&str] = &["-F"];
const MKFS_FAT32_ARGS: &[&str] = &["-F32"];

/// Filesystem of the boot partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BootFs {
    #[default]
    Ext4,
    Fat32,
}

impl BootFs {
    pub fn as_str(self) -> &'static str {
        match self {
            BootFs::Ext4 => "ext4",
            BootFs::Fat32 => "fat32",
        }
    }

    /// Type name used in fstab and by mount.
    pub fn linux_name(self) -> &'static str {
        match self {
            BootFs::Ext4 => "ext4",
            BootFs::Fat32 => "vfat",
        }
    }

    /// mkfs program and arguments preceding the device.
    pub fn mkfs(self) -> (&'static str, &'static [&'static str]) {
        match self {
            BootFs::Ext4 => ("mkfs.ext4", MKFS_EXT4_ARGS),
            BootFs::Fat32 => ("mkfs.fat", MKFS_FAT32_ARGS),
        }
    }
}

impl FromStr for BootFs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ext4" => Ok(BootFs::Ext4),
            "fat32" | "vfat" => Ok(BootFs::Fat32),
            _ => Err(ConfigError::InvalidBootFs(s.to_string())),
        }
    }
}

impl fmt::Display for BootFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem of the root partition. Only ext4 is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootFs {
    #[default]
    Ext4,
}

impl RootFs {
    pub fn linux_name(self) -> &'static str {
        match self {
            RootFs::Ext4 => "ext4",
        }
    }
}
