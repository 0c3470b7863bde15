use std::path::Path;

use anyhow::{bail, Context, Error};

use blockgraph_api::storage_graph::device::FilesystemType;

use crate::{
    btrfs,
    dependencies::{CommandRunner, Dependency},
};

/// Resizes an ext2/3/4 filesystem to `size` bytes, or to fill its device when
/// `size` is `None`.
pub fn resize2fs(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    size: Option<u64>,
) -> Result<(), Error> {
    let mut cmd = Dependency::Resize2fs.cmd();
    cmd.arg(device_path.as_ref());
    if let Some(size) = size {
        // resize2fs reads a bare "K" suffix as KiB.
        cmd.arg(format!("{}K", size / 1024));
    }

    runner
        .run_and_check(&cmd)
        .context("Failed to execute resize2fs")
}

/// Grows a mounted XFS filesystem to fill its device.
pub fn xfs_growfs(runner: &dyn CommandRunner, mount_path: impl AsRef<Path>) -> Result<(), Error> {
    runner
        .run_and_check(Dependency::XfsGrowfs.cmd().arg(mount_path.as_ref()))
        .context("Failed to execute xfs_growfs")
}

/// Sets the label of an existing filesystem using the tool matching its type.
pub fn set_label(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    fs_type: FilesystemType,
    label: &str,
) -> Result<(), Error> {
    let device_path = device_path.as_ref();
    let cmd = match fs_type {
        FilesystemType::Btrfs => return btrfs::set_label(runner, device_path, label),
        FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4 => Dependency::E2label
            .cmd()
            .with_arg(device_path)
            .with_arg(label),
        FilesystemType::Xfs => Dependency::XfsAdmin
            .cmd()
            .with_arg("-L")
            .with_arg(label)
            .with_arg(device_path),
        FilesystemType::Vfat => Dependency::Fatlabel
            .cmd()
            .with_arg(device_path)
            .with_arg(label),
        FilesystemType::Swap => bail!("Cannot set label of swap space '{}'", device_path.display()),
    };

    runner
        .run_and_check(&cmd)
        .with_context(|| format!("Failed to set label of '{}'", device_path.display()))
}
