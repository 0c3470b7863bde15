use anyhow::{Context, Error};
use log::warn;
use serde::{Deserialize, Serialize};

use blockgraph_api::constants::SECTOR_SIZE;

use crate::dependencies::{CommandRunner, Dependency};

/// Columns requested from lsblk.
const COLUMNS: &str = "NAME,TYPE,SIZE,START,PARTN,FSTYPE,UUID,LABEL,PKNAME";

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub size: u64,
    /// Start of a partition, in sectors.
    pub start: Option<u64>,
    #[serde(rename = "partn")]
    pub partition_number: Option<u32>,
    #[serde(rename = "fstype")]
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<String>,
}

impl BlockDevice {
    /// Returns the start of a partition in bytes.
    pub fn start_bytes(&self) -> Option<u64> {
        self.start.map(|sectors| sectors * SECTOR_SIZE)
    }
}

/// Lists all block devices as a flat list, parents before children.
///
/// Devices with several parents (RAID arrays) are reported once per parent by
/// lsblk; only the first occurrence is kept.
pub fn list(runner: &dyn CommandRunner) -> Result<Vec<BlockDevice>, Error> {
    let result = runner
        .output_and_check(
            Dependency::Lsblk
                .cmd()
                .arg("--json")
                .arg("--bytes")
                .arg("--paths")
                .arg("--list")
                .arg("--output")
                .arg(COLUMNS),
        )
        .context("Failed execute lsblk")?;

    let parsed = parse_lsblk_output(result.as_str());
    if parsed.is_err() {
        warn!("lsblk output: {}", result);
    }

    parsed
}

fn parse_lsblk_output(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    let mut devices: Vec<BlockDevice> = Vec::with_capacity(parsed.blockdevices.len());
    for device in parsed.blockdevices {
        if !devices.iter().any(|d| d.name == device.name) {
            devices.push(device);
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::testutils::MockRunner;

    const OUTPUT: &str = indoc! {r#"
        {
           "blockdevices": [
              {"name":"/dev/sda", "type":"disk", "size":21474836480, "start":null, "partn":null, "fstype":null, "uuid":null, "label":null, "pkname":null},
              {"name":"/dev/sda1", "type":"part", "size":536870912, "start":2048, "partn":1, "fstype":"vfat", "uuid":"84A0-088E", "label":null, "pkname":"/dev/sda"},
              {"name":"/dev/sda2", "type":"part", "size":10737418240, "start":1050624, "partn":2, "fstype":"linux_raid_member", "uuid":"5b1e3c8c-1a5c-4c8e-9c3e-3f3b2a1c0d9e", "label":"host:0", "pkname":"/dev/sda"},
              {"name":"/dev/sdb", "type":"disk", "size":10737418240, "start":null, "partn":null, "fstype":"linux_raid_member", "uuid":"5b1e3c8c-1a5c-4c8e-9c3e-3f3b2a1c0d9e", "label":"host:0", "pkname":null},
              {"name":"/dev/md0", "type":"raid1", "size":10735321088, "start":null, "partn":null, "fstype":"crypto_LUKS", "uuid":"c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e", "label":null, "pkname":"/dev/sda2"},
              {"name":"/dev/md0", "type":"raid1", "size":10735321088, "start":null, "partn":null, "fstype":"crypto_LUKS", "uuid":"c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e", "label":null, "pkname":"/dev/sdb"},
              {"name":"/dev/mapper/cr_data", "type":"crypt", "size":10718543872, "start":null, "partn":null, "fstype":"btrfs", "uuid":"0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4", "label":"data", "pkname":"/dev/md0"}
           ]
        }
    "#};

    #[test]
    fn test_parse_lsblk_output() {
        let devices = parse_lsblk_output(OUTPUT).unwrap();
        assert_eq!(
            devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec![
                "/dev/sda",
                "/dev/sda1",
                "/dev/sda2",
                "/dev/sdb",
                "/dev/md0",
                "/dev/mapper/cr_data"
            ]
        );
        assert_eq!(devices[1].start_bytes(), Some(1024 * 1024));
        assert_eq!(devices[1].partition_number, Some(1));
        assert_eq!(devices[4].device_type, "raid1");
        assert_eq!(devices[5].label.as_deref(), Some("data"));
        assert!(parse_lsblk_output("not json").is_err());
    }

    #[test]
    fn test_list() {
        let runner = MockRunner::new();
        runner.on("lsblk", 0, OUTPUT);
        assert_eq!(list(&runner).unwrap().len(), 6);
        assert_eq!(
            runner.commands(),
            vec![format!(
                "lsblk --json --bytes --paths --list --output {COLUMNS}"
            )]
        );
    }
}
