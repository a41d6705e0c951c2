use std::fmt;

use super::profile::DistroProfile;
use crate::bootloader::fs::RootFs;

/// Device-mapper target name the initramfs opens the root volume as.
pub const CRYPT_TARGET: &str = "root";
pub const CRYPT_TARGET_DEVICE: &str = "/dev/mapper/root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSpec {
    Uuid(String),
}

impl fmt::Display for RootSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootSpec::Uuid(uuid) => write!(f, "UUID={uuid}"),
        }
    }
}

/// How an initramfs expects to be told about an encrypted root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptStyle {
    /// Debian initramfs-tools: one combined `cryptopts=` parameter.
    Cryptopts,
    /// dracut: separate `rd.luks.*` parameters.
    RdLuks,
    /// Alpine mkinitfs: `cryptroot=` and `cryptdm=`.
    CryptRoot,
}

#[derive(Debug, Clone, Copy)]
pub struct CryptKeys<'a> {
    /// Filesystem UUID inside the opened volume.
    pub root_uuid: &'a str,
    /// UUID of the LUKS header on the raw partition.
    pub crypt_uuid: &'a str,
}

impl CryptStyle {
    fn root(self, keys: CryptKeys<'_>) -> Option<RootSpec> {
        match self {
            CryptStyle::Cryptopts => None,
            CryptStyle::RdLuks | CryptStyle::CryptRoot => {
                Some(RootSpec::Uuid(keys.root_uuid.to_string()))
            }
        }
    }

    fn params(self, keys: CryptKeys<'_>) -> Vec<String> {
        match self {
            CryptStyle::Cryptopts => vec![
                format!("root={CRYPT_TARGET_DEVICE}"),
                format!(
                    "cryptopts=target={CRYPT_TARGET},source=UUID={},key=none,luks",
                    keys.crypt_uuid
                ),
            ],
            CryptStyle::RdLuks => vec![
                format!("rd.luks.name=UUID={}", keys.root_uuid),
                format!("rd.luks.uuid={}", keys.crypt_uuid),
                "rd.luks.crypttab=0".to_string(),
            ],
            CryptStyle::CryptRoot => vec![
                format!("root={CRYPT_TARGET_DEVICE}"),
                format!("cryptdm={CRYPT_TARGET}"),
                format!("cryptroot=UUID={}", keys.crypt_uuid),
            ],
        }
    }
}

/// Kernel and initrd locations as seen by the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel: String,
    pub initrd: String,
}

impl BootConfig {
    /// With a separate boot partition the bootloader sees `/boot` as its
    /// root, so the prefix is dropped.
    pub fn for_profile(profile: &DistroProfile, split_boot: bool) -> Self {
        let locate = |path: &str| {
            if split_boot {
                match path.strip_prefix("/boot") {
                    Some(rest) if rest.starts_with('/') => rest.to_string(),
                    _ => path.to_string(),
                }
            } else {
                path.to_string()
            }
        };
        Self {
            kernel: locate(profile.kernel),
            initrd: locate(profile.initrd),
        }
    }

    pub fn cmdline(&self, root: Option<&RootSpec>, rootfs: RootFs, extra: &[String]) -> KernelCmdline {
        let mut cmdline = KernelCmdline::default();
        cmdline.push("ro");
        cmdline.push(format!("initrd={}", self.initrd));
        if let Some(root) = root {
            cmdline.push(format!("root={root}"));
        }
        cmdline.push("net.ifnames=0");
        cmdline.push(format!("rootfstype={}", rootfs.linux_name()));
        cmdline.push("console=tty0");
        cmdline.push("console=ttyS0,115200n8");
        cmdline.extend(extra.iter().cloned());
        cmdline
    }

    /// Command line for a built disk: root by filesystem UUID, or the
    /// distribution's unlock parameters when the root is encrypted.
    pub fn build_cmdline(
        &self,
        style: CryptStyle,
        root_uuid: &str,
        crypt_uuid: Option<&str>,
        extra: &[String],
    ) -> KernelCmdline {
        match crypt_uuid {
            None => self.cmdline(Some(&RootSpec::Uuid(root_uuid.to_string())), RootFs::Ext4, extra),
            Some(crypt_uuid) => {
                let keys = CryptKeys {
                    root_uuid,
                    crypt_uuid,
                };
                let mut params = style.params(keys);
                params.extend(extra.iter().cloned());
                self.cmdline(style.root(keys).as_ref(), RootFs::Ext4, &params)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    tokens: Vec<String>,
}

impl KernelCmdline {
    pub fn push(&mut self, token: impl Into<String>) {
        let token = token.into();
        if !token.trim().is_empty() {
            self.tokens.push(token);
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

impl Extend<String> for KernelCmdline {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        for token in iter {
            self.push(token);
        }
    }
}

impl fmt::Display for KernelCmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}
