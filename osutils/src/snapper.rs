use std::path::Path;

use anyhow::{Context, Error};
use log::debug;

use crate::dependencies::{CommandRunner, Dependency};

/// Arguments shared by all steps of snapper's installation helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationHelperArgs<'a> {
    pub device: &'a str,
    pub root_prefix: &'a Path,
    pub config_name: &'a str,
    /// Path of the default subvolume, empty for the top-level subvolume.
    pub default_subvolume: &'a str,
}

/// Runs one step of `installation-helper`. Steps 1 to 4 set up snapshots on a
/// freshly created btrfs filesystem: 1 after creation, 2 and 3 around the
/// mount, 4 after the fstab entry was added.
pub fn installation_helper_step(
    runner: &dyn CommandRunner,
    step: u8,
    args: &InstallationHelperArgs,
) -> Result<(), Error> {
    debug!("Running snapper installation helper step {step}");

    let mut cmd = Dependency::SnapperInstallationHelper.cmd();
    cmd.arg("--step").arg(step.to_string());
    match step {
        1 | 2 => {
            cmd.arg("--device").arg(args.device);
        }
        _ => {}
    }
    cmd.arg("--root-prefix")
        .arg(args.root_prefix)
        .arg("--config-name")
        .arg(args.config_name)
        .arg("--default-subvolume-name")
        .arg(args.default_subvolume);

    runner
        .run_and_check(&cmd)
        .with_context(|| format!("Failed to run snapper installation helper step {step}"))
}
