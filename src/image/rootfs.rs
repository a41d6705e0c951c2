//! Files written into the copied root filesystem before it is sealed.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::distro::profile::{DistroProfile, Fixup};
use crate::ui::prelude::*;

pub const RESOLV_CONF: &str = "nameserver 8.8.8.8";
pub const HOSTNAME: &str = "localhost";
pub const HOSTS: &str = "127.0.0.1 localhost

# The following lines are desirable for IPv6 capable hosts
::1 ip6-localhost ip6-loopback
fe00::0 ip6-localnet
ff00::0 ip6-mcastprefix
ff02::1 ip6-allnodes
ff02::2 ip6-allrouters
ff02::3 ip6-allhosts
";

/// Container leftovers that break a booted system.
const ARTIFACTS: &[&str] = &["/.dockerenv", "/usr/sbin/policy-rc.d"];

/// `/etc/fstab` below `root`, never escaping it.
pub fn in_root(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// Write `content` to `path` unless it already holds something. A symlink
/// pointing at nothing (e.g. a resolver stub under /run) is replaced by a
/// plain file. Returns whether the file was written.
pub fn write_if_empty(root: &Path, path: &str, content: &str) -> Result<bool> {
    let target = in_root(root, path);
    match fs::symlink_metadata(&target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let link = fs::read_link(&target)
                .with_context(|| format!("reading link {}", target.display()))?;
            let resolved = if link.is_absolute() {
                in_root(root, &link.to_string_lossy())
            } else {
                target.parent().unwrap_or(root).join(link)
            };
            if fs::metadata(&resolved).is_ok_and(|m| m.len() > 0) {
                return Ok(false);
            }
            fs::remove_file(&target)
                .with_context(|| format!("removing dangling link {}", target.display()))?;
        }
        Ok(meta) if meta.len() > 0 => return Ok(false),
        _ => {}
    }
    write(&target, content)?;
    Ok(true)
}

fn write(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(target, content).with_context(|| format!("writing {}", target.display()))
}

fn remove(root: &Path, path: &str) -> Result<()> {
    let target = in_root(root, path);
    let Ok(meta) = fs::symlink_metadata(&target) else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(&target)
    } else {
        fs::remove_file(&target)
    }
    .with_context(|| format!("removing {}", target.display()))
}

fn append_line(root: &Path, path: &str, line: &str) -> Result<()> {
    let target = in_root(root, path);
    let mut content = match fs::read_to_string(&target) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", target.display())),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    write(&target, &content)
}

pub fn apply_fixup(root: &Path, fixup: &Fixup) -> Result<()> {
    match *fixup {
        Fixup::AppendLine { path, line } => append_line(root, path, line),
        Fixup::EnsureFile { path, content } => write_if_empty(root, path, content).map(|_| ()),
    }
}

/// Make the copied tree bootable as a VM: fstab, name resolution, hostname
/// and the distribution's own adjustments.
pub fn configure(root: &Path, fstab: &str, profile: &DistroProfile) -> Result<()> {
    write(&in_root(root, "/etc/fstab"), fstab)?;

    for (path, content) in [
        ("/etc/resolv.conf", RESOLV_CONF),
        ("/etc/hostname", HOSTNAME),
        ("/etc/hosts", HOSTS),
    ] {
        if !write_if_empty(root, path, content)? {
            emit(
                Level::Debug,
                "image.rootfs.keep",
                &format!("Keeping existing {path}"),
                None,
            );
        }
    }

    for artifact in ARTIFACTS {
        remove(root, artifact)?;
    }

    for fixup in profile.fixups {
        apply_fixup(root, fixup)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::Distribution;
    use crate::distro::profile::lookup;

    fn rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        dir
    }

    #[test]
    fn existing_hostname_is_kept() {
        let root = rootfs();
        fs::write(root.path().join("etc/hostname"), "builder").unwrap();
        assert!(!write_if_empty(root.path(), "/etc/hostname", HOSTNAME).unwrap());
        assert_eq!(
            fs::read_to_string(root.path().join("etc/hostname")).unwrap(),
            "builder"
        );
    }

    #[test]
    fn empty_file_is_filled() {
        let root = rootfs();
        fs::write(root.path().join("etc/hostname"), "").unwrap();
        assert!(write_if_empty(root.path(), "/etc/hostname", HOSTNAME).unwrap());
        assert_eq!(
            fs::read_to_string(root.path().join("etc/hostname")).unwrap(),
            "localhost"
        );
    }

    #[test]
    fn dangling_resolver_link_is_replaced_inside_root() {
        let root = rootfs();
        std::os::unix::fs::symlink(
            "/run/systemd/resolve/stub-resolv.conf",
            root.path().join("etc/resolv.conf"),
        )
        .unwrap();
        assert!(write_if_empty(root.path(), "/etc/resolv.conf", RESOLV_CONF).unwrap());
        let meta = fs::symlink_metadata(root.path().join("etc/resolv.conf")).unwrap();
        assert!(meta.file_type().is_file());
        assert!(!root.path().join("run").exists());
    }

    #[test]
    fn configure_debian() {
        let root = rootfs();
        fs::write(root.path().join(".dockerenv"), "").unwrap();
        fs::create_dir_all(root.path().join("usr/sbin")).unwrap();
        fs::write(root.path().join("usr/sbin/policy-rc.d"), "exit 101").unwrap();

        let profile = lookup(&Distribution::Debian).unwrap();
        configure(root.path(), "UUID=1 / ext4 errors=remount-ro 0 1\n", profile).unwrap();

        let read = |p: &str| fs::read_to_string(in_root(root.path(), p)).unwrap();
        assert_eq!(read("/etc/fstab"), "UUID=1 / ext4 errors=remount-ro 0 1\n");
        assert_eq!(read("/etc/resolv.conf"), "nameserver 8.8.8.8");
        assert_eq!(read("/etc/hosts"), HOSTS);
        assert!(!root.path().join(".dockerenv").exists());
        assert!(!root.path().join("usr/sbin/policy-rc.d").exists());
        assert!(!root.path().join("etc/network/interfaces").exists());
    }

    #[test]
    fn configure_alpine_adds_serial_console() {
        let root = rootfs();
        fs::write(
            root.path().join("etc/inittab"),
            "::sysinit:/sbin/openrc sysinit",
        )
        .unwrap();

        let profile = lookup(&Distribution::Alpine).unwrap();
        configure(root.path(), "", profile).unwrap();

        let inittab = fs::read_to_string(root.path().join("etc/inittab")).unwrap();
        assert_eq!(
            inittab,
            "::sysinit:/sbin/openrc sysinit\nttyS0::respawn:/sbin/getty -L ttyS0 115200 vt100\n"
        );
        assert!(root.path().join("etc/network/interfaces").is_file());
    }
}
