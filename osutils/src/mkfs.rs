use std::path::Path;

use anyhow::{Context, Error};
use log::info;

use blockgraph_api::storage_graph::device::FilesystemType;

use crate::dependencies::{CommandRunner, Dependency};

/// Creates a filesystem of the given type on the device, overwriting any
/// existing signature.
pub fn run(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    fs_type: FilesystemType,
    label: Option<&str>,
) -> Result<(), Error> {
    info!(
        "Creating {fs_type} filesystem on '{}'",
        device_path.as_ref().display()
    );

    let (dependency, force, label_flag) = match fs_type {
        FilesystemType::Btrfs => (Dependency::MkfsBtrfs, Some("--force"), "--label"),
        FilesystemType::Ext2 => (Dependency::MkfsExt2, Some("-F"), "-L"),
        FilesystemType::Ext3 => (Dependency::MkfsExt3, Some("-F"), "-L"),
        FilesystemType::Ext4 => (Dependency::MkfsExt4, Some("-F"), "-L"),
        FilesystemType::Xfs => (Dependency::MkfsXfs, Some("-f"), "-L"),
        FilesystemType::Vfat => (Dependency::MkfsVfat, None, "-n"),
        FilesystemType::Swap => (Dependency::Mkswap, Some("--force"), "--label"),
    };

    let mut cmd = dependency.cmd();
    if let Some(force) = force {
        cmd.arg(force);
    }
    if let Some(label) = label {
        cmd.arg(label_flag).arg(label);
    }
    cmd.arg(device_path.as_ref());

    runner
        .run_and_check(&cmd)
        .with_context(|| format!("Failed to execute {dependency}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::MockRunner;

    #[test]
    fn test_run() {
        let runner = MockRunner::new();
        run(&runner, "/dev/sda2", FilesystemType::Btrfs, Some("root")).unwrap();
        run(&runner, "/dev/sda3", FilesystemType::Ext4, None).unwrap();
        run(&runner, "/dev/sda1", FilesystemType::Vfat, Some("EFI")).unwrap();
        run(&runner, "/dev/sda4", FilesystemType::Swap, None).unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "mkfs.btrfs --force --label root /dev/sda2",
                "mkfs.ext4 -F /dev/sda3",
                "mkfs.vfat -n EFI /dev/sda1",
                "mkswap --force /dev/sda4",
            ]
        );
    }

    #[test]
    fn test_run_failure() {
        let runner = MockRunner::new();
        runner.on("mkfs.xfs", 1, "");
        assert_eq!(
            run(&runner, "/dev/sda2", FilesystemType::Xfs, None)
                .unwrap_err()
                .to_string(),
            "Failed to execute mkfs.xfs"
        );
    }
}
