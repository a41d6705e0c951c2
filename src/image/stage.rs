use serde::{Deserialize, Serialize};
use std::fmt;

/// Build pipeline stages, in execution order.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    /// Remove a stale raw disk
    Clean,
    /// Create the sparse raw disk
    Allocate,
    /// Write the partition table
    Partition,
    /// Attach a loop device and map partitions
    Attach,
    /// Encrypt the root partition
    Encrypt,
    /// Create filesystems
    MakeFilesystems,
    /// Mount root and boot
    Mount,
    /// Copy the root filesystem
    CopyRootfs,
    /// Write fstab and host configuration
    ConfigureRootfs,
    /// Assemble the kernel command line
    ComputeCmdline,
    /// Install the bootloader
    InstallBootloader,
    /// Release mounts, mappings and the loop device
    Unmount,
    /// Convert to the output format
    Convert,
    /// Remove the raw disk
    Finalize,
}

impl BuildStage {
    pub const ALL: [BuildStage; 14] = [
        BuildStage::Clean,
        BuildStage::Allocate,
        BuildStage::Partition,
        BuildStage::Attach,
        BuildStage::Encrypt,
        BuildStage::MakeFilesystems,
        BuildStage::Mount,
        BuildStage::CopyRootfs,
        BuildStage::ConfigureRootfs,
        BuildStage::ComputeCmdline,
        BuildStage::InstallBootloader,
        BuildStage::Unmount,
        BuildStage::Convert,
        BuildStage::Finalize,
    ];

    pub fn description(self) -> &'static str {
        match self {
            BuildStage::Clean => "Removing stale disk",
            BuildStage::Allocate => "Allocating disk",
            BuildStage::Partition => "Partitioning disk",
            BuildStage::Attach => "Attaching loop device",
            BuildStage::Encrypt => "Encrypting root partition",
            BuildStage::MakeFilesystems => "Creating filesystems",
            BuildStage::Mount => "Mounting filesystems",
            BuildStage::CopyRootfs => "Copying root filesystem",
            BuildStage::ConfigureRootfs => "Configuring root filesystem",
            BuildStage::ComputeCmdline => "Computing kernel command line",
            BuildStage::InstallBootloader => "Installing bootloader",
            BuildStage::Unmount => "Unmounting",
            BuildStage::Convert => "Converting disk",
            BuildStage::Finalize => "Cleaning up",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
