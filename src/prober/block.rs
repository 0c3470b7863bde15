use anyhow::{anyhow, Error};
use log::{debug, trace};

use blockgraph_api::{
    constants::DEVICE_MAPPER_PREFIX,
    error::{BlockgraphError, ProbeError},
    storage_graph::device::{Disk, EncryptedVolume, Partition, RaidArray},
    HolderKind, Sid,
};

use crate::inventory::{BlockDeviceFacts, BlockKind, CryptFacts};

use super::{probe_failure, KindProber, Pass, ProbeContext};

/// Adds holders of `kind` from every parent of `facts` to `sid`. A missing
/// parent fails the device.
fn attach_parents(
    ctx: &mut ProbeContext,
    facts: &BlockDeviceFacts,
    sid: Sid,
    kind: HolderKind,
) -> Result<(), BlockgraphError> {
    for parent in &facts.parents {
        let Some(parent_sid) = ctx.block_devices.get(parent).copied() else {
            return ctx.fail(
                Some(sid),
                Pass::Topology,
                probe_failure(&facts.name, Pass::Topology, "parent devices"),
                anyhow!("Parent '{parent}' is not a known block device"),
            );
        };
        ctx.graph.add_holder(parent_sid, sid, kind)?;
    }
    Ok(())
}

pub(super) struct DiskProber;

impl KindProber for DiskProber {
    fn name(&self) -> &'static str {
        "disks"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        if pass != Pass::Nodes {
            return Ok(());
        }

        for facts in ctx.block_device_facts()? {
            if facts.kind != BlockKind::Disk {
                continue;
            }
            let sid = ctx.graph.add_device(Disk {
                name: facts.name.clone(),
                size: facts.size.bytes(),
            });
            trace!("Found disk '{}' as {sid}", facts.name);
            ctx.block_devices.insert(facts.name.clone(), sid);
        }
        Ok(())
    }
}

pub(super) struct PartitionProber;

impl KindProber for PartitionProber {
    fn name(&self) -> &'static str {
        "partitions"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        let facts = ctx
            .block_device_facts()?
            .iter()
            .filter(|facts| facts.kind == BlockKind::Partition);

        match pass {
            Pass::Nodes => {
                for facts in facts {
                    let (Some(number), Some(start)) = (facts.number, facts.start) else {
                        ctx.fail(
                            None,
                            pass,
                            probe_failure(&facts.name, pass, "partition layout"),
                            anyhow!("Partition number or start offset is unknown"),
                        )?;
                        continue;
                    };

                    let sid = ctx.graph.add_device(Partition::new(
                        &facts.name,
                        number,
                        start.bytes(),
                        facts.size.bytes(),
                    ));
                    ctx.block_devices.insert(facts.name.clone(), sid);
                }
            }
            Pass::Topology => {
                for facts in facts {
                    if let Some(sid) = ctx.block_devices.get(&facts.name).copied() {
                        attach_parents(ctx, facts, sid, HolderKind::PartitionOf)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

pub(super) struct RaidProber;

impl KindProber for RaidProber {
    fn name(&self) -> &'static str {
        "RAID arrays"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        let facts = ctx
            .block_device_facts()?
            .iter()
            .filter(|facts| facts.kind == BlockKind::Raid);

        match pass {
            Pass::Nodes => {
                for facts in facts {
                    let details = match ctx.inventory.raid_array(&facts.name) {
                        Ok(details) => details,
                        Err(e) => {
                            ctx.fail(
                                None,
                                pass,
                                probe_failure(&facts.name, pass, "RAID details"),
                                e,
                            )?;
                            continue;
                        }
                    };

                    let sid = ctx.graph.add_device(RaidArray {
                        uuid: details.uuid,
                        ..RaidArray::new(&facts.name, details.level)
                    });
                    debug!("Found {} array '{}'", details.level, facts.name);
                    ctx.block_devices.insert(facts.name.clone(), sid);
                }
            }
            Pass::Topology => {
                for facts in facts {
                    if let Some(sid) = ctx.block_devices.get(&facts.name).copied() {
                        attach_parents(ctx, facts, sid, HolderKind::MemberOf)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// LUKS containers are found through the `crypto_LUKS` signature on their
/// underlying device. When the container is open, the device-mapper device
/// on top of it supplies name and size. Otherwise the name comes from
/// crypttab or the name sequence, and the size is derived from the parent.
pub(super) struct LuksProber;

impl LuksProber {
    fn discover(ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        let all = ctx.block_device_facts()?;
        let crypttab = ctx
            .inventory
            .crypttab()
            .map_err(|e| inventory_error(e, "crypttab"))?;

        for facts in all.iter().filter(|facts| facts.kind == BlockKind::Crypt) {
            ctx.names.reserve(dm_name(&facts.name));
        }
        for entry in crypttab {
            ctx.names.reserve(&entry.name);
        }

        for facts in all.iter().filter(|facts| facts.is_luks()) {
            let opened = all.iter().find(|child| {
                child.kind == BlockKind::Crypt && child.parents.iter().any(|p| *p == facts.name)
            });

            let registered = match Self::crypttab_entry(ctx, &facts.name, opened) {
                Ok(entry) => entry,
                Err(e) => {
                    ctx.fail(
                        None,
                        Pass::Nodes,
                        probe_failure(&facts.name, Pass::Nodes, "crypttab entry"),
                        e,
                    )?;
                    continue;
                }
            };

            let mut volume = match opened {
                Some(child) => EncryptedVolume::new(dm_name(&child.name), child.size.bytes()),
                None => {
                    let name = match &registered {
                        Some(entry) => entry.name.clone(),
                        None => ctx.names.next_name(),
                    };
                    EncryptedVolume {
                        active: false,
                        ..EncryptedVolume::new(name, 0)
                    }
                }
            };
            if let Some(entry) = registered {
                volume.in_crypttab = true;
                volume.mount_by = entry.mount_by();
                volume.crypt_options = entry.options;
            }

            debug!(
                "Found {} LUKS container '{}' on '{}'",
                if volume.active { "active" } else { "inactive" },
                volume.name(),
                facts.name
            );
            let name = volume.name();
            let sid = ctx.graph.add_device(volume);
            ctx.luks.insert(facts.name.clone(), sid);
            ctx.block_devices.insert(name, sid);
        }
        Ok(())
    }

    fn crypttab_entry(
        ctx: &ProbeContext,
        underlying: &str,
        opened: Option<&BlockDeviceFacts>,
    ) -> Result<Option<CryptFacts>, Error> {
        if let Some(entry) = ctx.inventory.crypttab_for_device(underlying)? {
            return Ok(Some(entry));
        }
        match opened {
            Some(child) => ctx.inventory.crypttab_by_name(dm_name(&child.name)),
            None => Ok(None),
        }
    }
}

impl KindProber for LuksProber {
    fn name(&self) -> &'static str {
        "encrypted volumes"
    }

    fn probe(&self, pass: Pass, ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        match pass {
            Pass::Nodes => Self::discover(ctx)?,
            Pass::Topology => {
                for (underlying, sid) in ctx.luks.clone() {
                    let Some(parent) = ctx.block_devices.get(&underlying).copied() else {
                        ctx.fail(
                            Some(sid),
                            pass,
                            probe_failure(&underlying, pass, "parent devices"),
                            anyhow!("LUKS container sits on unknown device '{underlying}'"),
                        )?;
                        continue;
                    };
                    ctx.graph.add_holder(parent, sid, HolderKind::Encrypts)?;

                    let inactive = ctx
                        .graph
                        .device(sid)?
                        .as_encrypted_volume()
                        .is_some_and(|luks| !luks.active);
                    if inactive {
                        ctx.graph.compute_derived(sid)?;
                    }
                }
            }
            Pass::Identities => {
                for (underlying, sid) in ctx.luks.clone() {
                    if ctx.skipped(sid) {
                        continue;
                    }

                    match ctx.inventory.luks_uuid(&underlying) {
                        Ok(uuid) => {
                            let device = ctx.graph.device_mut(sid)?;
                            if let Some(luks) = device.as_encrypted_volume_mut() {
                                luks.uuid = Some(uuid);
                            }
                        }
                        Err(e) => {
                            let name = ctx.graph.device(sid)?.name().unwrap_or(underlying);
                            ctx.fail(Some(sid), pass, probe_failure(name, pass, "luks uuid"), e)?;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Device-mapper name of a `/dev/mapper/` device.
fn dm_name(name: &str) -> &str {
    name.strip_prefix(DEVICE_MAPPER_PREFIX).unwrap_or(name)
}

fn inventory_error(error: Error, what: &str) -> BlockgraphError {
    BlockgraphError::with_source(ProbeError::Inventory(what.into()), error)
}
