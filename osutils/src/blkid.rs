use std::path::Path;

use anyhow::{ensure, Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

fn run(runner: &dyn CommandRunner, device_path: &Path, tag: &str) -> Result<String, Error> {
    let output = runner
        .output_and_check(
            Dependency::Blkid
                .cmd()
                .arg("-o") // output format
                .arg("value") // single value
                .arg("-s") // tag
                .arg(tag)
                .arg(device_path),
        )
        .context("Failed to execute blkid")?;

    Ok(output.trim().to_owned())
}

/// Reads the filesystem (or LUKS) UUID of a device.
pub fn get_uuid(runner: &dyn CommandRunner, device_path: impl AsRef<Path>) -> Result<String, Error> {
    let uuid = run(runner, device_path.as_ref(), "UUID")?;
    ensure!(
        !uuid.is_empty(),
        "Device '{}' has no UUID",
        device_path.as_ref().display()
    );
    Ok(uuid)
}
