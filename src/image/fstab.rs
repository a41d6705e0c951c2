use crate::bootloader::fs::{BootFs, RootFs};

fn entry(uuid: &str, mountpoint: &str, fstype: &str, pass: u8) -> String {
    format!("UUID={uuid} {mountpoint} {fstype} errors=remount-ro 0 {pass}\n")
}

/// fstab for the image. `boot` is set only with a separate boot partition.
pub fn render(root_uuid: &str, boot: Option<(&str, BootFs)>) -> String {
    let mut fstab = entry(root_uuid, "/", RootFs::Ext4.linux_name(), 1);
    if let Some((boot_uuid, boot_fs)) = boot {
        fstab.push_str(&entry(boot_uuid, "/boot", boot_fs.linux_name(), 2));
    }
    fstab
}
