use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Bytes of x86 boot code at the start of an MBR. The disk signature and
/// partition table follow and must not be touched.
pub const BOOT_CODE_LEN: usize = 440;

/// Copy the boot code from `blob` over the start of `device`.
pub fn write_boot_code(blob: &Path, device: &Path) -> Result<()> {
    let mut code = [0u8; BOOT_CODE_LEN];
    File::open(blob)
        .and_then(|mut f| f.read_exact(&mut code))
        .with_context(|| {
            format!(
                "reading {BOOT_CODE_LEN} bytes of boot code from {}",
                blob.display()
            )
        })?;

    let mut target = OpenOptions::new()
        .write(true)
        .open(device)
        .with_context(|| format!("opening {} for writing", device.display()))?;
    target.seek(SeekFrom::Start(0))?;
    target
        .write_all(&code)
        .with_context(|| format!("writing boot code to {}", device.display()))?;
    target
        .sync_all()
        .with_context(|| format!("syncing {}", device.display()))?;
    Ok(())
}
