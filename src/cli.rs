use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::bootloader::fs::BootFs;
use crate::bootloader::registry::REGISTRY;
use crate::convert::{container_disk, qemu_img};
use crate::distro::profile::{LuksSupport, PROFILES};
use crate::exec::CommandExecutor;
use crate::exec::logging::CommandLogger;
use crate::image::options::{BuildOptions, DiskSize, ImageFormat, Platform};
use crate::image::{self, ContainerDiskTarget, ConvertRequest};
use crate::privileges;
use crate::source;
use crate::ui::prelude::*;
use crate::ui::is_debug_enabled;

/// Turn container root filesystems into bootable virtual machine disks
#[derive(Parser, Debug)]
#[command(name = "diskforge", author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug events and record every host command
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Output format for events
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a bootable disk image from a root filesystem
    Build(BuildArgs),

    /// Package a disk image as a container image
    ContainerDisk {
        /// Disk image to package
        disk: PathBuf,
        /// Tag of the resulting container image
        #[arg(short, long)]
        tag: String,
        /// Push the image after building it
        #[arg(long)]
        push: bool,
        /// Print commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show format and size information of a disk image
    Info {
        /// Disk image to inspect
        image: PathBuf,
    },

    /// List output formats, bootloaders and supported distributions
    List,

    /// View recorded host command logs
    Logs {
        /// Number of recent logs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Clear all logs
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Root filesystem: a directory, a tar archive or a container image
    pub source: String,

    /// Disk image to write, its extension selects the format
    #[arg(short, long, default_value = "disk0.qcow2")]
    pub output: String,

    /// Disk size, e.g. 10G or 512M
    #[arg(short, long)]
    pub size: Option<DiskSize>,

    /// Overwrite the output if it exists
    #[arg(short, long)]
    pub force: bool,

    /// Extra kernel command line arguments
    #[arg(long)]
    pub append_to_cmdline: Option<String>,

    /// Put /boot on its own partition
    #[arg(long)]
    pub split_boot: bool,

    /// Size of the boot partition in MiB
    #[arg(long)]
    pub boot_size: Option<u64>,

    /// Filesystem of the boot partition
    #[arg(long, value_enum)]
    pub boot_fs: Option<BootFs>,

    /// Bootloader to install (see `diskforge list`)
    #[arg(long)]
    pub bootloader: Option<String>,

    /// Encrypt the root partition with this passphrase
    #[arg(long, env = "DISKFORGE_LUKS_PASSWORD", hide_env_values = true)]
    pub luks_password: Option<String>,

    /// Target platform, linux/amd64 or linux/arm64
    #[arg(long)]
    pub platform: Option<String>,

    /// Build options file (TOML); flags override its values
    #[arg(short, long)]
    pub config: Option<String>,

    /// syslinux MBR boot code to use instead of the host's
    #[arg(long)]
    pub mbr_file: Option<PathBuf>,

    /// Directory to create the work directory in
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Keep the work directory after the build
    #[arg(long)]
    pub keep_cache: bool,

    /// Pull the container image before using it
    #[arg(long)]
    pub pull: bool,

    /// Print commands instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Show the output of host commands as they run
    #[arg(short, long)]
    pub verbose: bool,

    /// Also publish the disk as a container image with this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Push the container disk image (requires --tag)
    #[arg(long, requires = "tag")]
    pub push: bool,
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

impl BuildArgs {
    /// Options file first, then flags, then the cross-option fixups.
    pub fn resolve(&self) -> Result<(BuildOptions, PathBuf)> {
        let mut options = match &self.config {
            Some(path) => BuildOptions::from_file(&expand(path))?,
            None => BuildOptions::default(),
        };

        let output = expand(&self.output);
        if output.extension().is_some() {
            options.format = ImageFormat::from_path(&output)?;
        }
        if let Some(size) = self.size {
            options.size = size;
        }
        if let Some(raw) = &self.append_to_cmdline {
            options.set_cmdline(raw)?;
        }
        if self.split_boot {
            options.split_boot = true;
        }
        if let Some(size) = self.boot_size {
            options.boot_size_mib = size;
        }
        if let Some(fs) = self.boot_fs {
            options.boot_fs = Some(fs);
        }
        if let Some(name) = &self.bootloader {
            options.bootloader = Some(name.clone());
        }
        if let Some(password) = &self.luks_password {
            options.luks_password = Some(password.clone());
        }
        if let Some(platform) = &self.platform {
            options.platform = Platform(platform.clone());
        }
        if let Some(mbr) = &self.mbr_file {
            options.mbr_file = Some(mbr.clone());
        }
        options.platform.arch()?;
        options.normalize();
        Ok((options, output))
    }
}

fn executor(dry_run: bool, verbose: bool) -> Result<CommandExecutor> {
    let exec = CommandExecutor::new(dry_run).verbose(verbose);
    if is_debug_enabled() && !dry_run {
        return Ok(exec.with_logger(CommandLogger::new()?));
    }
    Ok(exec)
}

pub async fn handle_build(args: BuildArgs) -> Result<()> {
    let (options, output) = args.resolve()?;
    privileges::require_root_unless(args.dry_run)?;

    let exec = executor(args.dry_run, args.verbose)?;
    let request = ConvertRequest {
        source: source::from_arg(&args.source, args.pull),
        output,
        options,
        force: args.force,
        workdir_base: args.workdir.clone(),
        keep_workdir: args.keep_cache,
        container_disk: args.tag.clone().map(|tag| ContainerDiskTarget {
            tag,
            push: args.push,
        }),
    };

    let path = image::convert_image(request, &exec).await?;
    emit(
        Level::Success,
        "build.done",
        &format!("Disk image written to {}", path.display()),
        Some(serde_json::json!({ "path": path, "dry_run": args.dry_run })),
    );
    Ok(())
}

pub async fn handle_container_disk(disk: &Path, tag: &str, push: bool, dry_run: bool) -> Result<()> {
    let exec = executor(dry_run, false)?;
    container_disk::make(&exec, disk, tag, push).await?;
    emit(
        Level::Success,
        "container_disk.done",
        &format!("Container disk {tag} built from {}", disk.display()),
        None,
    );
    Ok(())
}

pub async fn handle_info(image: &Path) -> Result<()> {
    let exec = executor(false, false)?;
    let Some(info) = qemu_img::info(&exec, image).await? else {
        return Ok(());
    };
    emit(
        Level::Info,
        "info",
        &format!(
            "{}: {}, virtual size {} bytes, {} bytes on disk{}",
            info.filename,
            info.format,
            info.virtual_size,
            info.actual_size,
            if info.dirty_flag { ", dirty" } else { "" }
        ),
        Some(serde_json::to_value(&info)?),
    );
    Ok(())
}

fn luks_label(support: Option<LuksSupport>) -> String {
    match support {
        None => "no".to_string(),
        Some(LuksSupport::Always) => "yes".to_string(),
        Some(LuksSupport::Since(version)) => format!(">= {version}"),
    }
}

pub fn handle_list() -> Result<()> {
    let formats: Vec<&str> = ImageFormat::ALL.iter().map(|f| f.as_str()).collect();
    emit(
        Level::Info,
        "list.formats",
        &format!("Formats: {}", formats.join(", ")),
        Some(serde_json::json!({ "formats": formats })),
    );

    separator();
    emit(Level::Info, "list.bootloaders", "Bootloaders:", None);
    for provider in REGISTRY.providers() {
        emit(
            Level::Info,
            "list.bootloader",
            &format!("  {:<10} {}", provider.name(), provider.description()),
            Some(serde_json::json!({
                "name": provider.name(),
                "description": provider.description(),
            })),
        );
    }

    separator();
    emit(Level::Info, "list.distributions", "Distributions:", None);
    for profile in PROFILES {
        let luks = luks_label(profile.luks_since);
        emit(
            Level::Info,
            "list.distribution",
            &format!(
                "  {:<10} kernel {}, LUKS {}, EFI {}",
                profile.id,
                profile.kernel,
                luks,
                if profile.efi_supported { "yes" } else { "no" }
            ),
            Some(serde_json::json!({
                "id": profile.id,
                "luks": luks,
                "efi": profile.efi_supported,
            })),
        );
    }
    Ok(())
}

pub fn handle_logs(limit: usize, clear: bool) -> Result<()> {
    let logger = CommandLogger::new()?;
    if clear {
        logger.clear_logs()?;
        emit(
            Level::Success,
            "logs.cleared",
            "Cleared all command logs.",
            None,
        );
        return Ok(());
    }
    logger.print_recent_logs(limit)
}

pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Build(args) => handle_build(args).await,
        Commands::ContainerDisk {
            disk,
            tag,
            push,
            dry_run,
        } => handle_container_disk(&disk, &tag, push, dry_run).await,
        Commands::Info { image } => handle_info(&image).await,
        Commands::List => handle_list(),
        Commands::Logs { limit, clear } => handle_logs(limit, clear),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::error::ConfigError;

    fn parse(args: &[&str]) -> BuildArgs {
        let cli = Cli::try_parse_from([&["diskforge", "build"][..], args].concat()).unwrap();
        match cli.command {
            Commands::Build(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn output_extension_selects_format() {
        let (options, output) = parse(&["alpine", "-o", "vm.vmdk", "--platform", "linux/amd64"])
            .resolve()
            .unwrap();
        assert_eq!(options.format, ImageFormat::Vmdk);
        assert_eq!(output, PathBuf::from("vm.vmdk"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = parse(&["alpine", "-o", "vm.iso"]).resolve().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("build.toml");
        std::fs::write(
            &config,
            "size = \"20G\"\nbootloader = \"grub-bios\"\nplatform = \"linux/amd64\"\ncmdline = [\"quiet\"]\n",
        )
        .unwrap();

        let (options, _) = parse(&[
            "debian",
            "--config",
            config.to_str().unwrap(),
            "--bootloader",
            "syslinux",
            "--append-to-cmdline",
            "console=ttyS1 'foo=bar baz'",
        ])
        .resolve()
        .unwrap();
        assert_eq!(options.size, "20G".parse::<DiskSize>().unwrap());
        assert_eq!(options.bootloader.as_deref(), Some("syslinux"));
        assert_eq!(options.cmdline, vec!["console=ttyS1", "foo=bar baz"]);
    }

    #[test]
    fn luks_password_enables_split_boot() {
        let (options, _) = parse(&[
            "ubuntu",
            "--platform",
            "linux/amd64",
            "--luks-password",
            "secret",
        ])
        .resolve()
        .unwrap();
        assert!(options.split_boot);
    }

    #[test]
    fn push_requires_tag() {
        assert!(Cli::try_parse_from(["diskforge", "build", "alpine", "--push"]).is_err());
    }

    #[test]
    fn luks_labels() {
        assert_eq!(luks_label(None), "no");
        assert_eq!(luks_label(Some(LuksSupport::Always)), "yes");
        assert_eq!(luks_label(Some(LuksSupport::Since("3.15"))), ">= 3.15");
    }
}
