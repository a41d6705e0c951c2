use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;

use super::profile::{self, DistroProfile};
use super::version::Version;

/// Locations of os-release below a root, in lookup order.
pub const OS_RELEASE_PATHS: [&str; 2] = ["etc/os-release", "usr/lib/os-release"];

/// Raw os-release content of the filesystem at `root`.
pub fn read_os_release(root: &Path) -> Result<String> {
    for candidate in OS_RELEASE_PATHS {
        let path = root.join(candidate);
        if path.exists() {
            return std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()));
        }
    }
    anyhow::bail!("no os-release file found below {}", root.display())
}

/// Distribution identifier taken from the `ID=` field of os-release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Distribution {
    Ubuntu,
    Debian,
    /// Kali Linux (Debian-based, rolling)
    Kali,
    Alpine,
    CentOS,
    /// Red Hat Enterprise Linux, recognized but not buildable
    Rhel,
    /// Any other ID, kept verbatim for error messages
    Other(String),
}

impl Distribution {
    pub fn from_id(id: &str) -> Self {
        match id.trim().to_lowercase().as_str() {
            "ubuntu" => Self::Ubuntu,
            "debian" => Self::Debian,
            "kali" => Self::Kali,
            "alpine" => Self::Alpine,
            "centos" => Self::CentOS,
            "rhel" => Self::Rhel,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::Debian => "debian",
            Self::Kali => "kali",
            Self::Alpine => "alpine",
            Self::CentOS => "centos",
            Self::Rhel => "rhel",
            Self::Other(id) => id,
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Parsed identity of the operating system inside a root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub id: Distribution,
    pub name: String,
    pub version_id: String,
    pub version: String,
    pub codename: String,
}

impl OsRelease {
    /// Parse os-release content (`KEY=value` lines, optionally quoted).
    pub fn parse(content: &str) -> Self {
        let mut release = OsRelease {
            id: Distribution::Other(String::new()),
            name: String::new(),
            version_id: String::new(),
            version: String::new(),
            codename: String::new(),
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, raw)) = line.split_once('=') else {
                continue;
            };
            let value = unquote(raw.trim());
            match key.trim() {
                "ID" => release.id = Distribution::from_id(&value),
                "NAME" => release.name = value,
                "VERSION_ID" => release.version_id = value,
                "VERSION" => release.version = value,
                "VERSION_CODENAME" => release.codename = value,
                _ => {}
            }
        }

        release
    }

    pub fn profile(&self) -> Option<&'static DistroProfile> {
        profile::lookup(&self.id)
    }

    /// Whether root-partition encryption can boot on this release.
    pub fn supports_disk_encryption(&self) -> bool {
        let Some(profile) = self.profile() else {
            return false;
        };
        match profile.luks_since {
            None => false,
            Some(profile::LuksSupport::Always) => true,
            Some(profile::LuksSupport::Since(min)) => Version::parse(&self.version_id)
                .is_some_and(|version| version >= Version::parse(min).unwrap_or_default()),
        }
    }
}

impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version_id.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} {}", self.id, self.version_id)
        }
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return value[1..value.len() - 1].replace("\\\"", "\"");
        }
    }
    value.to_string()
}
