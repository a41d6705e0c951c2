//! What the copied root filesystem is, and how it wants to be booted.

pub mod cmdline;
pub mod profile;
pub mod release;
pub mod version;

pub use cmdline::{BootConfig, KernelCmdline};
pub use profile::DistroProfile;
pub use release::{Distribution, OsRelease, read_os_release};
