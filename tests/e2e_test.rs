mod common;
mod utils;

use anyhow::Result;
use common::TestEnvironment;
use utils::path_arg;

const UBUNTU: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";

#[test]
fn test_list_shows_formats_bootloaders_and_distributions() -> Result<()> {
    let env = TestEnvironment::new()?;
    let output = utils::run_diskforge_command(&env, &["list"])?;
    assert_eq!(output.exit_code, 0, "list failed: {}", output.stderr);

    for expected in ["qcow2", "vmdk", "syslinux", "grub-bios", "grub-efi", "alpine", "centos"] {
        assert!(output.stdout.contains(expected), "{expected} missing:\n{}", output.stdout);
    }
    Ok(())
}

#[test]
fn test_list_json_is_one_event_per_line() -> Result<()> {
    let env = TestEnvironment::new()?;
    let output = utils::run_diskforge_command(&env, &["--format", "json", "list"])?;
    assert_eq!(output.exit_code, 0, "list failed: {}", output.stderr);

    let events: Vec<serde_json::Value> = output
        .stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert!(events.iter().any(|e| e["code"] == "list.bootloader" && e["data"]["name"] == "grub"));
    Ok(())
}

#[test]
fn test_invalid_format_creates_nothing() -> Result<()> {
    let env = TestEnvironment::new()?;
    let rootfs = env.rootfs("rootfs", UBUNTU)?;
    let disk = env.path().join("vm.iso");

    let output = utils::run_diskforge_command(
        &env,
        &["build", &path_arg(&rootfs), "-o", &path_arg(&disk), "--dry-run"],
    )?;
    assert_ne!(output.exit_code, 0);
    assert!(output.stderr.contains("invalid format: iso"), "{}", output.stderr);
    assert!(!disk.exists());
    Ok(())
}

#[test]
fn test_dry_run_build_prints_pipeline() -> Result<()> {
    let env = TestEnvironment::new()?;
    let rootfs = env.rootfs("rootfs", UBUNTU)?;
    let disk = env.path().join("vm.qcow2");
    let workdir = env.workdir()?;

    let output = utils::run_diskforge_command(
        &env,
        &[
            "build",
            &path_arg(&rootfs),
            "-o",
            &path_arg(&disk),
            "--size",
            "2G",
            "--bootloader",
            "grub-bios",
            "--platform",
            "linux/amd64",
            "--workdir",
            &path_arg(&workdir),
            "--dry-run",
        ],
    )?;
    assert_eq!(output.exit_code, 0, "build failed: {}", output.stderr);

    let parted = output.stdout.find("[DRY RUN] parted -s").expect("no parted");
    let convert = output
        .stdout
        .find("[DRY RUN] qemu-img convert -O qcow2")
        .expect("no qemu-img");
    assert!(parted < convert);
    assert!(output.stdout.contains("[DRY RUN] chroot"));
    assert!(!disk.exists());
    assert!(env.leftover_workdirs()?.is_empty());
    Ok(())
}

#[test]
fn test_dry_run_build_from_archive() -> Result<()> {
    let env = TestEnvironment::new()?;
    let archive = env.rootfs_archive("rootfs", UBUNTU)?;
    let disk = env.path().join("vm.raw");
    let workdir = env.workdir()?;

    let output = utils::run_diskforge_command(
        &env,
        &[
            "build",
            &path_arg(&archive),
            "-o",
            &path_arg(&disk),
            "--size",
            "2G",
            "--bootloader",
            "grub-bios",
            "--platform",
            "linux/amd64",
            "--workdir",
            &path_arg(&workdir),
            "--dry-run",
        ],
    )?;
    assert_eq!(output.exit_code, 0, "build failed: {}", output.stderr);
    assert!(output.stdout.contains("[DRY RUN] tar --numeric-owner -xpf"));
    assert!(!disk.exists());
    assert!(env.leftover_workdirs()?.is_empty());
    Ok(())
}

#[test]
fn test_existing_output_needs_force() -> Result<()> {
    let env = TestEnvironment::new()?;
    let rootfs = env.rootfs("rootfs", UBUNTU)?;
    let disk = env.path().join("vm.qcow2");
    std::fs::write(&disk, "previous build")?;

    let output = utils::run_diskforge_command(
        &env,
        &[
            "build",
            &path_arg(&rootfs),
            "-o",
            &path_arg(&disk),
            "--platform",
            "linux/amd64",
            "--bootloader",
            "grub-bios",
            "--dry-run",
        ],
    )?;
    assert_ne!(output.exit_code, 0);
    assert!(output.stderr.contains("already exists"), "{}", output.stderr);
    assert_eq!(std::fs::read_to_string(&disk)?, "previous build");
    Ok(())
}

#[test]
fn test_unknown_bootloader_lists_alternatives() -> Result<()> {
    let env = TestEnvironment::new()?;
    let rootfs = env.rootfs("rootfs", UBUNTU)?;
    let workdir = env.workdir()?;

    let output = utils::run_diskforge_command(
        &env,
        &[
            "build",
            &path_arg(&rootfs),
            "-o",
            &path_arg(&env.path().join("vm.raw")),
            "--platform",
            "linux/amd64",
            "--bootloader",
            "lilo",
            "--workdir",
            &path_arg(&workdir),
            "--dry-run",
        ],
    )?;
    assert_ne!(output.exit_code, 0);
    assert!(
        output.stderr.contains("unknown bootloader: lilo"),
        "{}",
        output.stderr
    );
    assert!(output.stderr.contains("grub-efi"));
    assert!(env.leftover_workdirs()?.is_empty());
    Ok(())
}

#[test]
fn test_luks_rejected_on_old_release() -> Result<()> {
    let env = TestEnvironment::new()?;
    let rootfs = env.rootfs("rootfs", "ID=ubuntu\nVERSION_ID=\"18.04\"\n")?;
    let workdir = env.workdir()?;

    let output = utils::run_diskforge_command(
        &env,
        &[
            "build",
            &path_arg(&rootfs),
            "-o",
            &path_arg(&env.path().join("vm.qcow2")),
            "--platform",
            "linux/amd64",
            "--bootloader",
            "grub-bios",
            "--luks-password",
            "secret",
            "--workdir",
            &path_arg(&workdir),
            "--dry-run",
        ],
    )?;
    assert_ne!(output.exit_code, 0);
    assert!(
        output.stderr.contains("disk encryption is not supported on ubuntu 18.04"),
        "{}",
        output.stderr
    );
    Ok(())
}
