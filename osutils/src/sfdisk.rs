use std::path::Path;

use anyhow::{ensure, Context, Error};
use log::info;

use blockgraph_api::constants::SECTOR_SIZE;

use crate::dependencies::{CommandRunner, Dependency};

fn to_sectors(bytes: u64) -> Result<u64, Error> {
    ensure!(
        bytes % SECTOR_SIZE == 0,
        "{bytes} bytes is not a multiple of the {SECTOR_SIZE} byte sector size"
    );
    Ok(bytes / SECTOR_SIZE)
}

/// Appends a partition to the partition table of `disk`. Offsets are in bytes.
pub fn create(
    runner: &dyn CommandRunner,
    disk: impl AsRef<Path>,
    start: u64,
    size: u64,
) -> Result<(), Error> {
    info!(
        "Creating partition on '{}' at offset {start} with size {size}",
        disk.as_ref().display()
    );

    let script = format!("start={}, size={}\n", to_sectors(start)?, to_sectors(size)?);
    runner
        .run_and_check(
            Dependency::Sfdisk
                .cmd()
                .arg("--append")
                .arg(disk.as_ref())
                .stdin_text(script),
        )
        .with_context(|| {
            format!(
                "Failed to create partition on '{}'",
                disk.as_ref().display()
            )
        })
}

/// Changes the size of partition `number`, keeping its start.
pub fn resize(
    runner: &dyn CommandRunner,
    disk: impl AsRef<Path>,
    number: u32,
    size: u64,
) -> Result<(), Error> {
    let script = format!(", {}\n", to_sectors(size)?);
    runner
        .run_and_check(
            Dependency::Sfdisk
                .cmd()
                .arg("-N")
                .arg(number.to_string())
                .arg(disk.as_ref())
                .stdin_text(script),
        )
        .with_context(|| {
            format!(
                "Failed to resize partition {number} on '{}'",
                disk.as_ref().display()
            )
        })
}

/// Removes partition `number` from the partition table of `disk`.
pub fn delete(runner: &dyn CommandRunner, disk: impl AsRef<Path>, number: u32) -> Result<(), Error> {
    info!(
        "Deleting partition {number} on '{}'",
        disk.as_ref().display()
    );

    runner
        .run_and_check(
            Dependency::Sfdisk
                .cmd()
                .arg("--delete")
                .arg(disk.as_ref())
                .arg(number.to_string()),
        )
        .with_context(|| {
            format!(
                "Failed to delete partition {number} on '{}'",
                disk.as_ref().display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::{MockCall, MockRunner};

    #[test]
    fn test_create() {
        let runner = MockRunner::new();
        create(&runner, "/dev/sda", 1 << 20, 512 << 20).unwrap();
        assert_eq!(
            runner.calls(),
            vec![MockCall {
                command: "sfdisk --append /dev/sda".into(),
                stdin: Some("start=2048, size=1048576\n".into()),
            }]
        );

        assert_eq!(
            create(&runner, "/dev/sda", 1000, 512 << 20)
                .unwrap_err()
                .to_string(),
            "1000 bytes is not a multiple of the 512 byte sector size"
        );
    }

    #[test]
    fn test_resize_and_delete() {
        let runner = MockRunner::new();
        resize(&runner, "/dev/sda", 2, 1 << 30).unwrap();
        delete(&runner, "/dev/sda", 3).unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0].command, "sfdisk -N 2 /dev/sda");
        assert_eq!(calls[0].stdin.as_deref(), Some(", 2097152\n"));
        assert_eq!(calls[1].command, "sfdisk --delete /dev/sda 3");
    }
}
