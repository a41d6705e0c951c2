use sudo::RunningAs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("building a disk image requires root privileges (loop devices, mounts), try sudo or --dry-run")]
    NeedRoot,
}

/// Loop devices, device-mapper and mounts are root-only. A dry run touches
/// none of them.
pub fn require_root_unless(dry_run: bool) -> Result<(), PrivilegeError> {
    check(dry_run, sudo::check())
}

fn check(dry_run: bool, current: RunningAs) -> Result<(), PrivilegeError> {
    match (dry_run, current) {
        (true, _) | (false, RunningAs::Root) => Ok(()),
        (false, _) => Err(PrivilegeError::NeedRoot),
    }
}
