use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestEnvironment {
    temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Minimal unpacked root filesystem with the given os-release.
    pub fn rootfs(&self, name: &str, os_release: &str) -> Result<PathBuf> {
        let root = self.path().join(name);
        std::fs::create_dir_all(root.join("etc"))?;
        std::fs::create_dir_all(root.join("boot"))?;
        std::fs::write(root.join("etc/os-release"), os_release)?;
        std::fs::write(root.join("etc/hostname"), "")?;
        Ok(root)
    }

    /// The same root filesystem packed into a tar archive.
    pub fn rootfs_archive(&self, name: &str, os_release: &str) -> Result<PathBuf> {
        let root = self.rootfs(name, os_release)?;
        let archive = self.path().join(format!("{name}.tar"));
        let status = std::process::Command::new("tar")
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(&root)
            .arg(".")
            .status()?;
        anyhow::ensure!(status.success(), "tar failed for {}", root.display());
        Ok(archive)
    }

    /// Work directory base for builds, kept inside the test's tempdir.
    pub fn workdir(&self) -> Result<PathBuf> {
        let dir = self.path().join("work");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Entries below the work directory base, i.e. leaked build directories.
    pub fn leftover_workdirs(&self) -> Result<Vec<PathBuf>> {
        let dir = self.workdir()?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}
