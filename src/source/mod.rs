//! Where the root filesystem comes from.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::distro::OsRelease;
use crate::exec::CommandExecutor;
use crate::exec::deps::HostTool;

pub mod directory;
pub mod docker;
pub mod tarball;

pub use directory::DirectorySource;
pub use docker::DockerSource;
pub use tarball::TarballSource;

#[async_trait]
pub trait RootfsSource: Send + Sync {
    fn describe(&self) -> String;

    fn required_tools(&self) -> Vec<HostTool>;

    /// Raw os-release content of the filesystem.
    async fn os_release(&self, exec: &CommandExecutor) -> Result<String>;

    /// Materialize the complete filesystem below `dest`.
    async fn flatten(&self, exec: &CommandExecutor, dest: &Path) -> Result<()>;
}

pub async fn detect_release(source: &dyn RootfsSource, exec: &CommandExecutor) -> Result<OsRelease> {
    Ok(OsRelease::parse(&source.os_release(exec).await?))
}

/// Pick a source from a command-line argument: an existing directory, an
/// existing tar archive, or else a container image reference.
pub fn from_arg(arg: &str, pull: bool) -> Box<dyn RootfsSource> {
    let path = PathBuf::from(shellexpand::tilde(arg).to_string());
    if path.is_dir() {
        Box::new(DirectorySource::new(path))
    } else if path.is_file() {
        Box::new(TarballSource::new(path))
    } else {
        Box::new(DockerSource::new(arg, pull))
    }
}
