use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Error};
use log::{debug, trace};

use blockgraph_api::{
    constants::{BTRFS_SUBVOL_OPTION, BTRFS_TOP_LEVEL_SUBVOLUME_ID},
    error::{BlockgraphError, ProbeError},
    storage_graph::device::Subvolume,
    HolderKind, Sid,
};

use crate::inventory::BtrfsFacts;

use super::{probe_failure, BtrfsState, KindProber, Pass, ProbeContext};

/// Subvolumes of btrfs filesystems. Listing them requires the top-level
/// subvolume to be mounted, so this runs after every pass 1 fact is known.
pub(super) struct SubvolumeProber;

impl SubvolumeProber {
    fn btrfs_filesystems(ctx: &ProbeContext) -> Vec<(String, Sid)> {
        ctx.filesystems
            .iter()
            .filter(|(_, sid)| {
                ctx.graph
                    .find_device(**sid)
                    .and_then(|dev| dev.as_filesystem())
                    .is_some_and(|fs| fs.is_btrfs())
            })
            .filter(|(_, sid)| !ctx.skipped(**sid))
            .map(|(name, sid)| (name.clone(), *sid))
            .collect()
    }

    /// Lists the subvolumes while the top-level subvolume is mounted.
    fn list(ctx: &mut ProbeContext, device: &str, fs: Sid) -> Result<(), BlockgraphError> {
        let existing = ctx.top_level_mounts.get(&fs).cloned();
        let lease = match ctx.mounts.ensure_mounted(
            device,
            Some("btrfs"),
            &[format!("{BTRFS_SUBVOL_OPTION}=/")],
            existing.as_deref(),
        ) {
            Ok(lease) => lease,
            Err(e) => {
                return ctx.fail(
                    Some(fs),
                    Pass::Subvolumes,
                    ProbeError::EnsureMounted {
                        device: device.into(),
                    },
                    e,
                );
            }
        };

        let facts = ctx.inventory.btrfs(device, lease.path());
        drop(lease);

        match facts {
            Ok(facts) => Self::add_subvolumes(ctx, device, fs, facts),
            Err(e) => ctx.fail(
                Some(fs),
                Pass::Subvolumes,
                probe_failure(device, Pass::Subvolumes, "subvolumes"),
                e,
            ),
        }
    }

    /// Every id is listed once and every subvolume reaches the top level
    /// through its parents.
    fn check_listing(facts: &BtrfsFacts) -> Result<(), Error> {
        let mut parents = BTreeMap::new();
        for entry in &facts.subvolumes {
            if entry.id == BTRFS_TOP_LEVEL_SUBVOLUME_ID {
                continue;
            }
            if parents.insert(entry.id, entry.parent_id).is_some() {
                bail!("Subvolume id {} is listed more than once", entry.id);
            }
        }

        for entry in &facts.subvolumes {
            let mut id = entry.id;
            let mut steps = 0;
            while id != BTRFS_TOP_LEVEL_SUBVOLUME_ID {
                let Some(parent) = parents.get(&id) else {
                    bail!("Subvolume '{}' has unknown parent id {id}", entry.path);
                };
                steps += 1;
                if steps > parents.len() {
                    bail!("Subvolume '{}' is not below the top level", entry.path);
                }
                id = *parent;
            }
        }
        Ok(())
    }

    /// The tool may list children before their parents. Nodes are created
    /// first, edges second, and per-node refinement is left to pass 2b.
    fn add_subvolumes(
        ctx: &mut ProbeContext,
        device: &str,
        fs: Sid,
        facts: BtrfsFacts,
    ) -> Result<(), BlockgraphError> {
        if let Err(e) = Self::check_listing(&facts) {
            return ctx.fail(
                Some(fs),
                Pass::Subvolumes,
                probe_failure(device, Pass::Subvolumes, "subvolumes"),
                e,
            );
        }

        let mut ids = BTreeMap::new();
        ids.insert(BTRFS_TOP_LEVEL_SUBVOLUME_ID, ctx.graph.top_level_subvolume(fs)?);
        for entry in &facts.subvolumes {
            if entry.id == BTRFS_TOP_LEVEL_SUBVOLUME_ID {
                continue;
            }
            let sid = ctx.graph.add_device(Subvolume {
                id: Some(entry.id),
                ..Subvolume::new(&entry.path)
            });
            ids.insert(entry.id, sid);
        }

        for entry in &facts.subvolumes {
            if let (Some(parent), Some(child)) = (ids.get(&entry.parent_id), ids.get(&entry.id)) {
                ctx.graph.add_holder(*parent, *child, HolderKind::SubvolumeOf)?;
            }
        }

        debug!("Found {} subvolumes on '{device}'", facts.subvolumes.len());
        ctx.btrfs.insert(fs, BtrfsState { facts, ids });
        Ok(())
    }

    /// Applies per-subvolume facts in id order.
    fn refine(ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        let states = std::mem::take(&mut ctx.btrfs);
        for (fs, state) in &states {
            if ctx.skipped(*fs) {
                continue;
            }

            let mut entries = state.facts.subvolumes.iter().collect::<Vec<_>>();
            entries.sort_by_key(|entry| entry.id);
            for entry in entries {
                let Some(sid) = state.ids.get(&entry.id) else {
                    continue;
                };
                if let Some(subvolume) = ctx.graph.device_mut(*sid)?.as_subvolume_mut() {
                    subvolume.read_only = entry.read_only;
                    subvolume.default = entry.id == state.facts.default_subvolume;
                    trace!("Refined subvolume '{}'", subvolume.path);
                }
            }

            if state.facts.default_subvolume == BTRFS_TOP_LEVEL_SUBVOLUME_ID {
                if let Some(sid) = state.ids.get(&BTRFS_TOP_LEVEL_SUBVOLUME_ID) {
                    if let Some(top_level) = ctx.graph.device_mut(*sid)?.as_subvolume_mut() {
                        top_level.default = true;
                    }
                }
            }
        }
        ctx.btrfs = states;
        Ok(())
    }
}

impl KindProber for SubvolumeProber {
    fn name(&self) -> &'static str {
        "btrfs subvolumes"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        match pass {
            Pass::Subvolumes => {
                for (device, fs) in Self::btrfs_filesystems(ctx) {
                    Self::list(ctx, &device, fs)?;
                }
                Ok(())
            }
            Pass::Refine => Self::refine(ctx),
            _ => Ok(()),
        }
    }
}
