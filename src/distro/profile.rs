use super::cmdline::CryptStyle;
use super::release::Distribution;

/// When root-partition encryption became bootable for a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuksSupport {
    Always,
    /// Minimum `VERSION_ID`, compared numerically.
    Since(&'static str),
}

/// Change applied inside the copied root filesystem before it is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// Append a line, creating the file if needed.
    AppendLine {
        path: &'static str,
        line: &'static str,
    },
    /// Create the file with `content` unless it already has content.
    EnsureFile {
        path: &'static str,
        content: &'static str,
    },
}

/// Per-distribution boot facts. Everything that varies by distribution
/// lives in this table rather than in branches spread over the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistroProfile {
    pub id: &'static str,
    pub kernel: &'static str,
    pub initrd: &'static str,
    /// Name used for `/boot/<name>`, `<name>-install` and `<name>-mkconfig`.
    pub grub_name: &'static str,
    pub luks_since: Option<LuksSupport>,
    pub crypt_style: CryptStyle,
    pub efi_supported: bool,
    pub fixups: &'static [Fixup],
}

const DEBIAN_KERNEL: &str = "/boot/vmlinuz";
const DEBIAN_INITRD: &str = "/boot/initrd.img";

const ALPINE_FIXUPS: &[Fixup] = &[
    Fixup::AppendLine {
        path: "/etc/inittab",
        line: "ttyS0::respawn:/sbin/getty -L ttyS0 115200 vt100",
    },
    Fixup::EnsureFile {
        path: "/etc/network/interfaces",
        content: "",
    },
];

pub const PROFILES: &[DistroProfile] = &[
    DistroProfile {
        id: "ubuntu",
        kernel: DEBIAN_KERNEL,
        initrd: DEBIAN_INITRD,
        grub_name: "grub",
        luks_since: Some(LuksSupport::Since("20.04")),
        crypt_style: CryptStyle::Cryptopts,
        efi_supported: true,
        fixups: &[],
    },
    DistroProfile {
        id: "debian",
        kernel: DEBIAN_KERNEL,
        initrd: DEBIAN_INITRD,
        grub_name: "grub",
        luks_since: Some(LuksSupport::Since("10")),
        crypt_style: CryptStyle::Cryptopts,
        efi_supported: true,
        fixups: &[],
    },
    DistroProfile {
        id: "kali",
        kernel: DEBIAN_KERNEL,
        initrd: DEBIAN_INITRD,
        grub_name: "grub",
        luks_since: Some(LuksSupport::Always),
        crypt_style: CryptStyle::Cryptopts,
        efi_supported: true,
        fixups: &[],
    },
    DistroProfile {
        id: "alpine",
        kernel: "/boot/vmlinuz-virt",
        initrd: "/boot/initramfs-virt",
        grub_name: "grub",
        luks_since: Some(LuksSupport::Since("3.15")),
        crypt_style: CryptStyle::CryptRoot,
        efi_supported: true,
        fixups: ALPINE_FIXUPS,
    },
    DistroProfile {
        id: "centos",
        kernel: DEBIAN_KERNEL,
        initrd: DEBIAN_INITRD,
        grub_name: "grub2",
        luks_since: Some(LuksSupport::Since("8")),
        crypt_style: CryptStyle::RdLuks,
        efi_supported: false,
        fixups: &[],
    },
];

pub fn lookup(distribution: &Distribution) -> Option<&'static DistroProfile> {
    if matches!(distribution, Distribution::Other(_)) {
        return None;
    }
    PROFILES.iter().find(|p| p.id == distribution.id())
}
