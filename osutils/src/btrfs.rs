use std::path::Path;

use anyhow::{bail, Context, Error};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use blockgraph_api::constants::BTRFS_TOP_LEVEL_SUBVOLUME_ID;

use crate::dependencies::{CommandRunner, Dependency};

/// Prefix `btrfs subvolume list -a` puts in front of paths below the
/// top-level subvolume.
const FS_TREE_PREFIX: &str = "<FS_TREE>/";

lazy_static! {
    /// One line of `btrfs subvolume list -a -p`.
    static ref SUBVOLUME_LINE: Regex =
        Regex::new(r"^ID (\d+) gen \d+ parent (\d+) top level \d+ path (.+)$")
            .expect("Failed to compile regex");

    /// Output of `btrfs subvolume get-default`.
    static ref DEFAULT_LINE: Regex = Regex::new(r"^ID (\d+)\b").expect("Failed to compile regex");
}

/// One line of `btrfs subvolume list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeEntry {
    pub id: u64,
    pub parent_id: u64,
    /// Path relative to the top-level subvolume.
    pub path: String,
}

/// Lists all subvolumes of the filesystem mounted at `mount_path`, in the
/// order btrfs reports them. Children may come before their parents.
pub fn list_subvolumes(
    runner: &dyn CommandRunner,
    mount_path: impl AsRef<Path>,
) -> Result<Vec<SubvolumeEntry>, Error> {
    let output = runner
        .output_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("subvolume")
                .arg("list")
                .arg("-a")
                .arg("-p")
                .arg(mount_path.as_ref()),
        )
        .context("Failed to list btrfs subvolumes")?;

    parse_subvolume_list(&output)
}

fn parse_subvolume_list(output: &str) -> Result<Vec<SubvolumeEntry>, Error> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let Some(captures) = SUBVOLUME_LINE.captures(line) else {
                bail!("Unexpected btrfs subvolume list line '{line}'");
            };
            let path = &captures[3];
            Ok(SubvolumeEntry {
                id: captures[1].parse()?,
                parent_id: captures[2].parse()?,
                path: path.strip_prefix(FS_TREE_PREFIX).unwrap_or(path).to_owned(),
            })
        })
        .collect()
}

/// Returns the id of the default subvolume of the filesystem mounted at
/// `mount_path`.
pub fn get_default(runner: &dyn CommandRunner, mount_path: impl AsRef<Path>) -> Result<u64, Error> {
    let output = runner
        .output_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("subvolume")
                .arg("get-default")
                .arg(mount_path.as_ref()),
        )
        .context("Failed to get default btrfs subvolume")?;

    parse_default(&output)
}

fn parse_default(output: &str) -> Result<u64, Error> {
    let line = output.trim();
    match DEFAULT_LINE.captures(line) {
        Some(captures) => Ok(captures[1].parse()?),
        None => bail!("Unexpected btrfs get-default output '{line}'"),
    }
}

/// Makes the subvolume with the given id the default subvolume.
pub fn set_default(
    runner: &dyn CommandRunner,
    id: u64,
    mount_path: impl AsRef<Path>,
) -> Result<(), Error> {
    debug!("Setting default btrfs subvolume to {id}");
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("subvolume")
                .arg("set-default")
                .arg(id.to_string())
                .arg(mount_path.as_ref()),
        )
        .context("Failed to set default btrfs subvolume")
}

/// Resets the default subvolume to the top-level subvolume.
pub fn reset_default(runner: &dyn CommandRunner, mount_path: impl AsRef<Path>) -> Result<(), Error> {
    set_default(runner, BTRFS_TOP_LEVEL_SUBVOLUME_ID, mount_path)
}

pub fn create_subvolume(runner: &dyn CommandRunner, path: impl AsRef<Path>) -> Result<(), Error> {
    info!("Creating btrfs subvolume '{}'", path.as_ref().display());
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("subvolume")
                .arg("create")
                .arg(path.as_ref()),
        )
        .with_context(|| {
            format!(
                "Failed to create btrfs subvolume '{}'",
                path.as_ref().display()
            )
        })
}

pub fn delete_subvolume(runner: &dyn CommandRunner, path: impl AsRef<Path>) -> Result<(), Error> {
    info!("Deleting btrfs subvolume '{}'", path.as_ref().display());
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("subvolume")
                .arg("delete")
                .arg(path.as_ref()),
        )
        .with_context(|| {
            format!(
                "Failed to delete btrfs subvolume '{}'",
                path.as_ref().display()
            )
        })
}

/// Resizes a mounted btrfs filesystem to `size` bytes, or to fill its device
/// when `size` is `None`.
pub fn resize(
    runner: &dyn CommandRunner,
    mount_path: impl AsRef<Path>,
    size: Option<u64>,
) -> Result<(), Error> {
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("filesystem")
                .arg("resize")
                .arg(size.map_or_else(|| "max".to_owned(), |s| s.to_string()))
                .arg(mount_path.as_ref()),
        )
        .context("Failed to resize btrfs filesystem")
}

pub fn set_label(
    runner: &dyn CommandRunner,
    device_path: impl AsRef<Path>,
    label: &str,
) -> Result<(), Error> {
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("filesystem")
                .arg("label")
                .arg(device_path.as_ref())
                .arg(label),
        )
        .context("Failed to set btrfs label")
}

/// Reads the read-only property of a subvolume.
pub fn is_read_only(runner: &dyn CommandRunner, path: impl AsRef<Path>) -> Result<bool, Error> {
    let output = runner
        .output_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("property")
                .arg("get")
                .arg("-ts")
                .arg(path.as_ref())
                .arg("ro"),
        )
        .context("Failed to read btrfs ro property")?;

    match output.trim() {
        "ro=true" => Ok(true),
        "ro=false" => Ok(false),
        other => bail!("Unexpected btrfs property output '{other}'"),
    }
}

pub fn set_read_only(
    runner: &dyn CommandRunner,
    path: impl AsRef<Path>,
    read_only: bool,
) -> Result<(), Error> {
    runner
        .run_and_check(
            Dependency::Btrfs
                .cmd()
                .arg("property")
                .arg("set")
                .arg("-ts")
                .arg(path.as_ref())
                .arg("ro")
                .arg(read_only.to_string()),
        )
        .context("Failed to set btrfs ro property")
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::testutils::MockRunner;

    #[test]
    fn test_parse_subvolume_list() {
        let output = indoc! {"
            ID 258 gen 14 parent 256 top level 256 path <FS_TREE>/@/home
            ID 256 gen 10 parent 5 top level 5 path <FS_TREE>/@
            ID 259 gen 15 parent 256 top level 256 path <FS_TREE>/@/var lib
        "};

        assert_eq!(
            parse_subvolume_list(output).unwrap(),
            vec![
                SubvolumeEntry {
                    id: 258,
                    parent_id: 256,
                    path: "@/home".into()
                },
                SubvolumeEntry {
                    id: 256,
                    parent_id: 5,
                    path: "@".into()
                },
                SubvolumeEntry {
                    id: 259,
                    parent_id: 256,
                    path: "@/var lib".into()
                },
            ]
        );
        assert!(parse_subvolume_list("").unwrap().is_empty());
        assert!(parse_subvolume_list("garbage").is_err());
    }

    #[test]
    fn test_parse_default() {
        assert_eq!(parse_default("ID 5 (FS_TREE)\n").unwrap(), 5);
        assert_eq!(
            parse_default("ID 256 gen 10 top level 5 path @\n").unwrap(),
            256
        );
        assert!(parse_default("").is_err());
    }

    #[test]
    fn test_commands() {
        let runner = MockRunner::new();
        runner.on("btrfs property get", 0, "ro=true\n");

        resize(&runner, "/mnt", Some(1 << 30)).unwrap();
        resize(&runner, "/mnt", None).unwrap();
        reset_default(&runner, "/mnt").unwrap();
        assert!(is_read_only(&runner, "/mnt/@/snap").unwrap());

        assert_eq!(
            runner.commands(),
            vec![
                "btrfs filesystem resize 1073741824 /mnt",
                "btrfs filesystem resize max /mnt",
                "btrfs subvolume set-default 5 /mnt",
                "btrfs property get -ts /mnt/@/snap ro",
            ]
        );
    }
}
