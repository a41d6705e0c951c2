use std::path::{Path, PathBuf};

use super::options::ImageFormat;
use crate::bootloader::fs::BootFs;
use crate::distro::KernelCmdline;

/// Host resources a build currently holds. Teardown clears each flag once
/// the matching release succeeded, so it can run any number of times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Held {
    pub attached: bool,
    pub partitions_mapped: bool,
    pub crypt_open: bool,
    pub root_mounted: bool,
    pub boot_mounted: bool,
}

impl Held {
    pub fn any(&self) -> bool {
        self.attached
            || self.partitions_mapped
            || self.crypt_open
            || self.root_mounted
            || self.boot_mounted
    }
}

/// Paths, devices and identifiers of one disk under construction.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    pub raw_path: PathBuf,
    pub output_path: PathBuf,
    pub mountpoint: PathBuf,
    pub format: ImageFormat,
    pub total_size: u64,
    pub split_boot: bool,
    pub boot_size_mib: u64,
    pub boot_fs: BootFs,

    pub loop_device: Option<String>,
    pub boot_partition: Option<String>,
    pub root_partition: Option<String>,
    /// Raw partition carrying the LUKS header.
    pub crypt_partition: Option<String>,
    /// Mapper name of the opened LUKS volume.
    pub crypt_name: Option<String>,

    pub root_uuid: Option<String>,
    pub boot_uuid: Option<String>,
    pub crypt_uuid: Option<String>,
    pub cmdline: Option<KernelCmdline>,

    pub held: Held,
}

impl DiskLayout {
    pub fn new(
        workdir: &Path,
        disk_name: &str,
        format: ImageFormat,
        total_size: u64,
        split_boot: bool,
        boot_size_mib: u64,
        boot_fs: BootFs,
    ) -> Self {
        Self {
            raw_path: workdir.join(format!("{disk_name}.diskforge.raw")),
            output_path: workdir.join(format!("{disk_name}.{}", format.as_str())),
            mountpoint: workdir.join("mnt"),
            format,
            total_size,
            split_boot,
            boot_size_mib,
            boot_fs,
            loop_device: None,
            boot_partition: None,
            root_partition: None,
            crypt_partition: None,
            crypt_name: None,
            root_uuid: None,
            boot_uuid: None,
            crypt_uuid: None,
            cmdline: None,
            held: Held::default(),
        }
    }

    /// Arguments for `parted`: an msdos label with either one bootable
    /// partition or a bootable boot partition followed by root.
    pub fn parted_args(&self) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.raw_path.display().to_string(),
            "mklabel".to_string(),
            "msdos".to_string(),
        ];
        let parts: Vec<String> = if self.split_boot {
            let boot_end = format!("{}MiB", self.boot_size_mib);
            vec![
                "mkpart".into(),
                "primary".into(),
                "1MiB".into(),
                boot_end.clone(),
                "mkpart".into(),
                "primary".into(),
                boot_end,
                "100%".into(),
            ]
        } else {
            vec!["mkpart".into(), "primary".into(), "1MiB".into(), "100%".into()]
        };
        args.extend(parts);
        args.extend(["set", "1", "boot", "on"].map(String::from));
        args
    }

    /// Record the attached loop device and derive the partition devices
    /// kpartx creates for it.
    pub fn set_loop_device(&mut self, device: &str) {
        let first = partition_path(device, 1);
        if self.split_boot {
            self.boot_partition = Some(first);
            self.root_partition = Some(partition_path(device, 2));
        } else {
            self.boot_partition = Some(first.clone());
            self.root_partition = Some(first);
        }
        self.loop_device = Some(device.to_string());
    }

    /// Device holding the root filesystem: the opened LUKS volume when the
    /// root is encrypted.
    pub fn root_device(&self) -> Option<String> {
        match &self.crypt_name {
            Some(name) => Some(mapper_path(name)),
            None => self.root_partition.clone(),
        }
    }

    pub fn boot_mountpoint(&self) -> PathBuf {
        self.mountpoint.join("boot")
    }
}

pub fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

/// `/dev/loop3`, 2 -> `/dev/mapper/loop3p2`
pub fn partition_path(loop_device: &str, index: u32) -> String {
    let name = Path::new(loop_device)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| loop_device.to_string());
    mapper_path(&format!("{name}p{index}"))
}
