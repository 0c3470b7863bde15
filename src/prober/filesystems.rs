use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Error;
use log::{debug, trace};

use blockgraph_api::{
    constants::BTRFS_SUBVOL_OPTION,
    error::BlockgraphError,
    storage_graph::device::{Filesystem, FilesystemType, MountBy, MountPoint, Subvolume},
    HolderKind, Sid,
};

use crate::inventory::{MountFacts, SystemInventory};

use super::{probe_failure, KindProber, Pass, ProbeContext, SubvolumeMount};

pub(super) struct FilesystemProber;

impl KindProber for FilesystemProber {
    fn name(&self) -> &'static str {
        "filesystems"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        if pass != Pass::Filesystems {
            return Ok(());
        }

        for facts in ctx.block_device_facts()? {
            let Some(fs_type) = facts.fs_type.as_deref() else {
                continue;
            };
            // LUKS signatures, RAID members and the like.
            let Ok(fs_type) = fs_type.parse::<FilesystemType>() else {
                trace!("Ignoring '{fs_type}' signature on '{}'", facts.name);
                continue;
            };
            let Some(block) = ctx.block_devices.get(&facts.name).copied() else {
                continue;
            };
            if ctx.skipped(block) {
                continue;
            }

            let sid = ctx.graph.add_device(Filesystem {
                uuid: facts.uuid.clone(),
                label: facts.label.clone(),
                ..Filesystem::new(fs_type)
            });
            ctx.graph.add_holder(block, sid, HolderKind::FormattedAs)?;
            debug!("Found {fs_type} filesystem on '{}'", facts.name);

            if fs_type == FilesystemType::Btrfs {
                let top_level = ctx.graph.add_device(Subvolume::top_level());
                ctx.graph.add_holder(sid, top_level, HolderKind::SubvolumeOf)?;
            }
            ctx.filesystems.insert(facts.name.clone(), sid);
        }
        Ok(())
    }
}

/// A mount point assembled from the mount table and fstab.
struct Candidate {
    mount_point: MountPoint,
    /// Value of the `subvol=` option, if any.
    subvolume: Option<String>,
}

/// Splits the `subvol=` option off a mount option list.
fn split_subvolume(options: &[String]) -> (Vec<String>, Option<String>) {
    let mut subvolume = None;
    let mut rest = Vec::new();
    for option in options {
        match option
            .strip_prefix(BTRFS_SUBVOL_OPTION)
            .and_then(|o| o.strip_prefix('='))
        {
            Some(value) => subvolume = Some(value.trim_start_matches('/').to_owned()),
            None => rest.push(option.clone()),
        }
    }
    (rest, subvolume)
}

/// Merges active mounts and fstab entries of one device by path. Fstab wins
/// for options and naming.
fn merge(active: &[MountFacts], registered: &[MountFacts]) -> BTreeMap<PathBuf, Candidate> {
    let mut candidates = BTreeMap::new();

    for mount in active.iter().filter(|m| m.path.is_absolute()) {
        let (options, subvolume) = split_subvolume(&mount.options);
        candidates.insert(
            mount.path.clone(),
            Candidate {
                mount_point: MountPoint {
                    options,
                    mount_by: MountBy::Device,
                    in_fstab: false,
                    active: true,
                    ..MountPoint::new(&mount.path)
                },
                subvolume,
            },
        );
    }

    for entry in registered.iter().filter(|m| m.path.is_absolute()) {
        let (options, subvolume) = split_subvolume(&entry.options);
        let candidate = candidates
            .entry(entry.path.clone())
            .or_insert_with(|| Candidate {
                mount_point: MountPoint {
                    active: false,
                    ..MountPoint::new(&entry.path)
                },
                subvolume: None,
            });

        candidate.mount_point.in_fstab = true;
        candidate.mount_point.options = options;
        candidate.mount_point.mount_by = entry.mount_by();
        if subvolume.is_some() {
            candidate.subvolume = subvolume;
        }
    }

    candidates
}

fn mount_facts(
    inventory: &dyn SystemInventory,
    device: &str,
) -> Result<(Vec<MountFacts>, Vec<MountFacts>), Error> {
    Ok((inventory.mounts_for(device)?, inventory.fstab_for(device)?))
}

pub(super) struct MountPointProber;

impl MountPointProber {
    fn discover(ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        for (device, fs) in ctx.filesystems.clone() {
            if ctx.skipped(fs) {
                continue;
            }

            let (active, registered) = match mount_facts(ctx.inventory, &device) {
                Ok(facts) => facts,
                Err(e) => {
                    ctx.fail(
                        Some(fs),
                        Pass::MountPoints,
                        probe_failure(&device, Pass::MountPoints, "mount points"),
                        e,
                    )?;
                    continue;
                }
            };

            let is_btrfs = ctx
                .graph
                .device(fs)?
                .as_filesystem()
                .is_some_and(|f| f.is_btrfs());

            for (path, candidate) in merge(&active, &registered) {
                if candidate.mount_point.active && candidate.subvolume.as_deref() == Some("") {
                    ctx.top_level_mounts.entry(fs).or_insert(path.clone());
                }

                match candidate.subvolume {
                    Some(subvolume) if is_btrfs => {
                        trace!(
                            "Deferring mount of subvolume '{subvolume}' at '{}'",
                            path.display()
                        );
                        ctx.subvolume_mounts.push(SubvolumeMount {
                            filesystem: fs,
                            path: subvolume,
                            mount_point: candidate.mount_point,
                        });
                    }
                    _ => attach(ctx, fs, candidate.mount_point)?,
                }
            }
        }
        Ok(())
    }

    fn attach_subvolume_mounts(ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        for pending in std::mem::take(&mut ctx.subvolume_mounts) {
            if ctx.skipped(pending.filesystem) {
                continue;
            }

            match ctx
                .graph
                .find_subvolume_by_path(pending.filesystem, &pending.path)
            {
                Ok(subvolume) => attach(ctx, subvolume, pending.mount_point)?,
                Err(e) => {
                    let path = pending.mount_point.path.display().to_string();
                    ctx.fail(
                        None,
                        Pass::Refine,
                        probe_failure(path, Pass::Refine, "mounted subvolume"),
                        e.into(),
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn attach(
    ctx: &mut ProbeContext,
    parent: Sid,
    mount_point: MountPoint,
) -> Result<(), BlockgraphError> {
    debug!("Found mount point '{}'", mount_point.path.display());
    let sid = ctx.graph.add_device(mount_point);
    ctx.graph.add_holder(parent, sid, HolderKind::MountedAt)?;
    Ok(())
}

impl KindProber for MountPointProber {
    fn name(&self) -> &'static str {
        "mount points"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        match pass {
            Pass::MountPoints => Self::discover(ctx),
            Pass::Refine => Self::attach_subvolume_mounts(ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    fn facts(device: &str, path: &str, options: &[&str]) -> MountFacts {
        MountFacts {
            device: device.into(),
            path: path.into(),
            fs_type: Some("btrfs".into()),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn test_split_subvolume() {
        let options = vec!["rw".to_owned(), "subvol=/@/home".into(), "noatime".into()];
        assert_eq!(
            split_subvolume(&options),
            (vec!["rw".to_owned(), "noatime".into()], Some("@/home".into()))
        );
        assert_eq!(
            split_subvolume(&["subvol=/".to_owned()]),
            (vec![], Some(String::new()))
        );
        assert_eq!(split_subvolume(&[]), (vec![], None));
    }

    #[test]
    fn test_merge() {
        let active = vec![
            facts("/dev/sda2", "/", &["rw", "subvol=/@"]),
            facts("/dev/sda2", "/mnt/top", &["rw", "subvol=/"]),
        ];
        let registered = vec![
            facts("UUID=1234", "/", &["defaults"]),
            facts("LABEL=data", "/data", &["subvol=@data"]),
            facts("/dev/sda2", "none", &[]),
        ];

        let merged = merge(&active, &registered);
        assert_eq!(merged.len(), 3);

        let root = &merged[Path::new("/")];
        assert!(root.mount_point.active && root.mount_point.in_fstab);
        assert_eq!(root.mount_point.options, vec!["defaults"]);
        assert_eq!(root.mount_point.mount_by, MountBy::Uuid);
        assert_eq!(root.subvolume.as_deref(), Some("@"));

        let top = &merged[Path::new("/mnt/top")];
        assert!(!top.mount_point.in_fstab);
        assert_eq!(top.mount_point.mount_by, MountBy::Device);
        assert_eq!(top.subvolume.as_deref(), Some(""));

        let data = &merged[Path::new("/data")];
        assert!(!data.mount_point.active);
        assert_eq!(data.mount_point.mount_by, MountBy::Label);
        assert_eq!(data.subvolume.as_deref(), Some("@data"));
    }
}
