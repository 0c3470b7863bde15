use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Error};
use log::{debug, info};

use blockgraph_api::storage_graph::device::RaidLevel;

use crate::dependencies::{CommandRunner, Dependency};

pub const METADATA_VERSION: &str = "1.0";

/// Facts reported by `mdadm --detail --export` for one array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdDetail {
    pub level: Option<RaidLevel>,
    pub uuid: Option<String>,
    pub metadata: Option<String>,
    /// Member device paths, in role order.
    pub members: Vec<String>,
}

pub fn create(
    runner: &dyn CommandRunner,
    raid_path: impl AsRef<Path>,
    level: RaidLevel,
    device_paths: &[String],
) -> Result<(), Error> {
    info!("Creating RAID array '{}'", raid_path.as_ref().display());

    runner
        .run_and_check(
            Dependency::Mdadm
                .cmd()
                .arg("--create")
                .arg(raid_path.as_ref())
                .arg("--run")
                .arg(format!("--level={level}"))
                .arg(format!("--raid-devices={}", device_paths.len()))
                .arg(format!("--metadata={METADATA_VERSION}"))
                .args(device_paths),
        )
        .context("Failed to run mdadm create")
}

pub fn stop(runner: &dyn CommandRunner, raid_path: impl AsRef<Path>) -> Result<(), Error> {
    info!("Stopping RAID array '{}'", raid_path.as_ref().display());

    runner
        .run_and_check(Dependency::Mdadm.cmd().arg("--stop").arg(raid_path.as_ref()))
        .with_context(|| format!("Failed to stop RAID array '{}'", raid_path.as_ref().display()))
}

/// Erases the RAID superblock of a former member device.
pub fn zero_superblock(runner: &dyn CommandRunner, device: impl AsRef<Path>) -> Result<(), Error> {
    runner
        .run_and_check(
            Dependency::Mdadm
                .cmd()
                .arg("--zero-superblock")
                .arg(device.as_ref()),
        )
        .with_context(|| {
            format!(
                "Failed to zero RAID superblock of '{}'",
                device.as_ref().display()
            )
        })
}

/// Adds a device to a RAID array.
pub fn add(
    runner: &dyn CommandRunner,
    raid_path: impl AsRef<Path>,
    device: impl AsRef<Path>,
) -> Result<(), Error> {
    info!(
        "Adding RAID device '{}' to '{}'",
        device.as_ref().display(),
        raid_path.as_ref().display()
    );

    runner
        .run_and_check(
            Dependency::Mdadm
                .cmd()
                .arg(raid_path.as_ref())
                .arg("--add")
                .arg(device.as_ref()),
        )
        .context("Failed to run mdadm add device")
}

/// Removes a device from a RAID array, failing it first.
pub fn remove(
    runner: &dyn CommandRunner,
    raid_path: impl AsRef<Path>,
    device: impl AsRef<Path>,
) -> Result<(), Error> {
    info!(
        "Removing RAID device '{}' from '{}'",
        device.as_ref().display(),
        raid_path.as_ref().display()
    );

    runner
        .run_and_check(
            Dependency::Mdadm
                .cmd()
                .arg(raid_path.as_ref())
                .arg("--fail")
                .arg(device.as_ref())
                .arg("--remove")
                .arg(device.as_ref()),
        )
        .context("Failed to run mdadm remove device")
}

/// Assembles every array described by the superblocks found on the system.
///
/// mdadm exits with status 1 when there was nothing left to assemble, which is
/// not an error here.
pub fn assemble_scan(runner: &dyn CommandRunner) -> Result<(), Error> {
    let output = runner
        .output(Dependency::Mdadm.cmd().arg("--assemble").arg("--scan"))
        .context("Failed to run mdadm assemble")?;

    if output.code() == Some(1) {
        debug!("No RAID arrays left to assemble");
        return Ok(());
    }
    output.check().context("Failed to assemble RAID arrays")
}

pub fn detail(runner: &dyn CommandRunner, raid_path: impl AsRef<Path>) -> Result<MdDetail, Error> {
    let output = runner
        .output_and_check(
            Dependency::Mdadm
                .cmd()
                .arg("--detail")
                .arg("--export")
                .arg(raid_path.as_ref()),
        )
        .with_context(|| {
            format!(
                "Failed to get details of RAID array '{}'",
                raid_path.as_ref().display()
            )
        })?;

    parse_detail_export(&output).with_context(|| {
        format!(
            "Failed to parse details of RAID array '{}'",
            raid_path.as_ref().display()
        )
    })
}

fn parse_detail_export(output: &str) -> Result<MdDetail, Error> {
    let mut detail = MdDetail::default();
    let mut roles: BTreeMap<u32, String> = BTreeMap::new();
    let mut member_keys: BTreeMap<String, (Option<u32>, Option<String>)> = BTreeMap::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        match key {
            "MD_LEVEL" => {
                detail.level = Some(
                    value
                        .parse()
                        .with_context(|| format!("Unknown RAID level '{value}'"))?,
                )
            }
            "MD_UUID" => detail.uuid = Some(value.to_owned()),
            "MD_METADATA" => detail.metadata = Some(value.to_owned()),
            _ => {
                let Some(rest) = key.strip_prefix("MD_DEVICE_") else {
                    continue;
                };
                if let Some(id) = rest.strip_suffix("_ROLE") {
                    // Spares report their role as "spare".
                    member_keys.entry(id.to_owned()).or_default().0 = value.parse().ok();
                } else if let Some(id) = rest.strip_suffix("_DEV") {
                    member_keys.entry(id.to_owned()).or_default().1 = Some(value.to_owned());
                }
            }
        }
    }

    let mut spares = Vec::new();
    for (_, (role, dev)) in member_keys {
        let Some(dev) = dev else { continue };
        match role {
            Some(role) => {
                roles.insert(role, dev);
            }
            None => spares.push(dev),
        }
    }

    detail.members = roles.into_values().chain(spares).collect();
    Ok(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::testutils::MockRunner;

    #[test]
    fn test_parse_detail_export() {
        let output = indoc! {"
            MD_LEVEL=raid1
            MD_DEVICES=2
            MD_METADATA=1.0
            MD_UUID=5b1e3c8c:1a5c4c8e:9c3e3f3b:2a1c0d9e
            MD_DEVNAME=0
            MD_DEVICE_dev_sdb_ROLE=1
            MD_DEVICE_dev_sdb_DEV=/dev/sdb
            MD_DEVICE_dev_sda2_ROLE=0
            MD_DEVICE_dev_sda2_DEV=/dev/sda2
            MD_DEVICE_dev_sdc_ROLE=spare
            MD_DEVICE_dev_sdc_DEV=/dev/sdc
        "};

        let detail = parse_detail_export(output).unwrap();
        assert_eq!(detail.level, Some(RaidLevel::Raid1));
        assert_eq!(
            detail.uuid.as_deref(),
            Some("5b1e3c8c:1a5c4c8e:9c3e3f3b:2a1c0d9e")
        );
        assert_eq!(detail.metadata.as_deref(), Some("1.0"));
        assert_eq!(detail.members, vec!["/dev/sda2", "/dev/sdb", "/dev/sdc"]);

        assert!(parse_detail_export("MD_LEVEL=linear\n").is_err());
    }

    #[test]
    fn test_create() {
        let runner = MockRunner::new();
        create(
            &runner,
            "/dev/md/data",
            RaidLevel::Raid5,
            &["/dev/sda".into(), "/dev/sdb".into(), "/dev/sdc".into()],
        )
        .unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "mdadm --create /dev/md/data --run --level=raid5 --raid-devices=3 --metadata=1.0 \
                 /dev/sda /dev/sdb /dev/sdc"
            ]
        );
    }

    #[test]
    fn test_assemble_scan_nothing_to_do() {
        let runner = MockRunner::new();
        runner.once("mdadm --assemble", 1, "").once("mdadm --assemble", 2, "");
        assemble_scan(&runner).unwrap();
        assert!(assemble_scan(&runner).is_err());
    }
}
