use std::path::Path;

use anyhow::{Context, Error};
use log::{debug, info};

use blockgraph_api::primitives::secret::Secret;

use crate::dependencies::{CommandRunner, Dependency};

/// Cipher specification string for the LUKS2 data segment.
pub const CIPHER: &str = "aes-xts-plain64";

/// Key size in bits, limited by the cipher specification.
pub const KEY_SIZE: &str = "512";

/// Exit code cryptsetup uses when no key slot could be unlocked.
const EXIT_WRONG_PASSPHRASE: i32 = 2;

/// Runs `cryptsetup luksFormat` on the given device, reading the passphrase
/// from stdin.
pub fn luks_format(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    passphrase: &Secret,
) -> Result<(), Error> {
    info!(
        "Formatting '{}' as LUKS2 volume",
        device_path.as_ref().display()
    );

    runner
        .run_and_check(
            Dependency::Cryptsetup
                .cmd()
                .arg("luksFormat")
                .arg("--batch-mode")
                .arg("--type")
                .arg("luks2")
                .arg("--cipher")
                .arg(CIPHER)
                .arg("--key-size")
                .arg(KEY_SIZE)
                .arg("--key-file")
                .arg("-")
                .arg(device_path.as_ref())
                .stdin_secret(passphrase),
        )
        .with_context(|| {
            format!(
                "Failed to format '{}' as LUKS2 volume",
                device_path.as_ref().display()
            )
        })
}

/// Runs `cryptsetup luksOpen` with a passphrase piped on stdin.
///
/// Returns `Ok(false)` when the passphrase was rejected, so the caller can ask
/// for another one.
pub fn open(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    dm_name: &str,
    passphrase: &Secret,
) -> Result<bool, Error> {
    let output = runner
        .output(
            Dependency::Cryptsetup
                .cmd()
                .arg("luksOpen")
                .arg("--key-file")
                .arg("-")
                .arg(device_path.as_ref())
                .arg(dm_name)
                .stdin_secret(passphrase),
        )
        .with_context(|| {
            format!(
                "Failed to execute cryptsetup for '{}'",
                device_path.as_ref().display()
            )
        })?;

    if output.code() == Some(EXIT_WRONG_PASSPHRASE) {
        debug!(
            "Passphrase rejected for '{}'",
            device_path.as_ref().display()
        );
        return Ok(false);
    }

    output.check().with_context(|| {
        format!(
            "Failed to open encrypted device '{}' as '{}'",
            device_path.as_ref().display(),
            dm_name
        )
    })?;
    Ok(true)
}

/// Runs `cryptsetup close` on an opened volume.
pub fn close(runner: &dyn CommandRunner, dm_name: &str) -> Result<(), Error> {
    runner
        .run_and_check(Dependency::Cryptsetup.cmd().arg("close").arg(dm_name))
        .with_context(|| format!("Failed to close encrypted volume '{dm_name}'"))
}

/// Reads the LUKS UUID from the header of the underlying device.
pub fn luks_uuid(runner: &dyn CommandRunner, device_path: impl AsRef<Path>) -> Result<String, Error> {
    let output = runner
        .output_and_check(
            Dependency::Cryptsetup
                .cmd()
                .arg("luksUUID")
                .arg(device_path.as_ref()),
        )
        .with_context(|| {
            format!(
                "Failed to read LUKS UUID of '{}'",
                device_path.as_ref().display()
            )
        })?;

    Ok(output.trim().to_owned())
}

/// Runs `cryptsetup resize` on an opened volume. With `size_in_sectors` the
/// volume is shrunk to that size; without it the volume grows to fill its
/// underlying device.
pub fn resize(
    runner: &dyn CommandRunner,
    dm_name: &str,
    size_in_sectors: Option<u64>,
) -> Result<(), Error> {
    let mut cmd = Dependency::Cryptsetup.cmd();
    cmd.arg("resize").arg(dm_name);
    if let Some(sectors) = size_in_sectors {
        cmd.arg("--size").arg(sectors.to_string());
    }

    runner
        .run_and_check(&cmd)
        .with_context(|| format!("Failed to resize encrypted volume '{dm_name}'"))
}
