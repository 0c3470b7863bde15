use std::path::Path;

use anyhow::{Context, Error};
use log::debug;

use crate::dependencies::{CommandRunner, Dependency};

/// Mounts the block device at `path` on `mount_dir`.
pub fn mount(
    runner: &dyn CommandRunner,
    path: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    fs_type: Option<&str>,
    options: &[String],
) -> Result<(), Error> {
    let mut cmd = Dependency::Mount.cmd();
    if !options.is_empty() {
        cmd.arg("-o").arg(options.join(","));
    }
    if let Some(fs_type) = fs_type {
        cmd.arg("-t").arg(fs_type);
    }
    cmd.arg(path.as_ref()).arg(mount_dir.as_ref());

    debug!(
        "Mounting '{}' on '{}'",
        path.as_ref().display(),
        mount_dir.as_ref().display()
    );
    runner.run_and_check(&cmd).with_context(|| {
        format!(
            "Failed to mount {} to path {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        )
    })
}

/// Unmounts given directory mount_dir.
pub fn umount(runner: &dyn CommandRunner, mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    runner
        .run_and_check(Dependency::Umount.cmd().arg(mount_dir.as_ref()))
        .with_context(|| {
            format!(
                "Failed to unmount directory {}",
                mount_dir.as_ref().display()
            )
        })
}
