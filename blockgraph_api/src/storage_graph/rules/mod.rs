//! # Rule Declarations
//!
//! This module contains the structural rules evaluated by
//! `DeviceGraph::check()`. Insertion-time invariants (no dangling endpoints,
//! no duplicate holders) are enforced by the graph itself and are not
//! repeated here.
//!
//! Every rule collects all of its violations instead of stopping at the
//! first one. The rules are declared roughly in the order they are evaluated.

use std::collections::{BTreeMap, BTreeSet};

use crate::{constants::LUKS_METADATA_SIZE, primitives::bytes::ByteCount};

use super::{
    device::DeviceKind,
    error::{Reference, Violation, ViolationList},
    graph::DeviceGraph,
    holder::{HolderKey, HolderKind},
    sid::Sid,
};

/// A structural rule over a whole graph.
pub trait Validator {
    /// Short name of the rule, used in logs.
    fn name(&self) -> &'static str;

    /// Appends every violation of this rule found in the graph.
    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>);
}

/// All rules, in evaluation order.
pub const DEFAULT_RULES: &[&dyn Validator] = &[
    &HolderEndpointRule,
    &HolderCycleRule,
    &ParentCardinalityRule,
    &ExclusiveUseRule,
    &MountRule,
    &RaidMemberRule,
    &EncryptionOverheadRule,
    &BtrfsSubvolumeRule,
    &PartitionLayoutRule,
    &UniqueNameRule,
];

impl DeviceGraph {
    /// Runs the given rules and returns every violation found.
    pub fn check(&self, validators: &[&dyn Validator]) -> ViolationList {
        let mut violations = Vec::new();
        for validator in validators {
            let before = violations.len();
            validator.validate(self, &mut violations);
            log::trace!(
                "Rule '{}' reported {} violation(s)",
                validator.name(),
                violations.len() - before
            );
        }
        violations.into()
    }

    /// Runs all rules.
    pub fn check_all(&self) -> ViolationList {
        self.check(DEFAULT_RULES)
    }
}

fn device_violation(graph: &DeviceGraph, sid: Sid, message: impl Into<String>) -> Violation {
    Violation {
        reference: Reference::Device {
            sid,
            description: graph
                .find_device(sid)
                .map(|dev| dev.describe())
                .unwrap_or_else(|| sid.to_string()),
        },
        message: message.into(),
    }
}

fn holder_violation(key: HolderKey, message: impl Into<String>) -> Violation {
    Violation {
        reference: Reference::Holder(key),
        message: message.into(),
    }
}

/// Holder endpoints must be of the kinds the holder kind connects.
pub struct HolderEndpointRule;

impl Validator for HolderEndpointRule {
    fn name(&self) -> &'static str {
        "holder-endpoints"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for key in graph.holders() {
            let (Some(source), Some(target)) =
                (graph.find_device(key.source), graph.find_device(key.target))
            else {
                continue;
            };

            if !key.kind.valid_sources().contains(source.kind().as_flag()) {
                violations.push(holder_violation(
                    key,
                    format!(
                        "source is a {}, but '{}' holders must start at one of: {}",
                        source.kind(),
                        key.kind,
                        key.kind.valid_sources()
                    ),
                ));
            }

            if target.kind() != key.kind.valid_target() {
                violations.push(holder_violation(
                    key,
                    format!(
                        "target is a {}, but '{}' holders must end at a {}",
                        target.kind(),
                        key.kind,
                        key.kind.valid_target()
                    ),
                ));
            }
        }
    }
}

/// Holders form a forest: no device is its own ancestor. Together with the
/// parent cardinality rule this roots every device at a disk.
pub struct HolderCycleRule;

impl Validator for HolderCycleRule {
    fn name(&self) -> &'static str {
        "holder-cycles"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for cycle in graph.cycles() {
            let members = cycle
                .iter()
                .map(|sid| sid.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            for sid in &cycle {
                violations.push(device_violation(
                    graph,
                    *sid,
                    format!("is its own ancestor through the holder cycle {members}"),
                ));
            }
        }
    }
}

/// Every device other than a disk has the expected number of structural
/// parents. Disks have none.
pub struct ParentCardinalityRule;

impl Validator for ParentCardinalityRule {
    fn name(&self) -> &'static str {
        "parent-cardinality"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices() {
            let sid = device.sid();
            let in_holders = graph.in_holders(sid);

            let Some(kind) = HolderKind::for_target(device.kind()) else {
                if !in_holders.is_empty() {
                    violations.push(device_violation(
                        graph,
                        sid,
                        format!("{} cannot have parents", device.kind()),
                    ));
                }
                continue;
            };

            let count = in_holders.iter().filter(|key| key.kind == kind).count();
            let cardinality = kind.parent_cardinality();
            if !cardinality.contains(count) {
                violations.push(device_violation(
                    graph,
                    sid,
                    format!(
                        "expected {cardinality} '{kind}' {}, found {count}",
                        cardinality.pluralize("parent", "parents"),
                    ),
                ));
            }
        }
    }
}

/// A block device is either split into partitions or used whole by exactly one
/// user (RAID array, encrypted volume, filesystem).
pub struct ExclusiveUseRule;

impl Validator for ExclusiveUseRule {
    fn name(&self) -> &'static str {
        "exclusive-use"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices().filter(|dev| dev.is_block_device()) {
            let out_holders = graph.out_holders(device.sid());
            let exclusive = out_holders
                .iter()
                .filter(|key| key.kind.is_exclusive_use())
                .count();
            let partitioned = out_holders
                .iter()
                .any(|key| key.kind == HolderKind::PartitionOf);

            if exclusive > 1 {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    format!("used by {exclusive} devices, but can only be used by one"),
                ));
            }

            if exclusive > 0 && partitioned {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    "has partitions and is also used as a whole",
                ));
            }
        }
    }
}

/// Mountable devices are mounted at most once, at unique absolute paths.
pub struct MountRule;

impl Validator for MountRule {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices() {
            let mounts = graph
                .out_holders(device.sid())
                .into_iter()
                .filter(|key| key.kind == HolderKind::MountedAt)
                .count();
            if mounts > 1 {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    format!("has {mounts} mount points, expected at most 1"),
                ));
            }

            if let Some(fs) = device.as_filesystem() {
                if mounts > 0 && !fs.fs_type.is_mountable() {
                    violations.push(device_violation(
                        graph,
                        device.sid(),
                        format!("{} filesystems cannot be mounted", fs.fs_type),
                    ));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for device in graph.devices() {
            let Some(mp) = device.as_mount_point() else {
                continue;
            };

            if !mp.path.is_absolute() {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    "mount point path must be absolute",
                ));
            }

            if !seen.insert(mp.path.clone()) {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    "mount point path is used more than once",
                ));
            }
        }
    }
}

/// RAID arrays have enough members for their level.
pub struct RaidMemberRule;

impl Validator for RaidMemberRule {
    fn name(&self) -> &'static str {
        "raid-members"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices() {
            let Some(array) = device.as_raid_array() else {
                continue;
            };

            // Arrays without members are reported by the cardinality rule.
            let members = graph.parents(device.sid()).len();
            if members > 0 && members < array.level.min_members() {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    format!(
                        "{} requires at least {} members, found {members}",
                        array.level,
                        array.level.min_members()
                    ),
                ));
            }
        }
    }
}

/// The logical size of an encrypted volume plus its metadata fits on the
/// underlying block device.
pub struct EncryptionOverheadRule;

impl Validator for EncryptionOverheadRule {
    fn name(&self) -> &'static str {
        "encryption-overhead"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices() {
            let Some(luks) = device.as_encrypted_volume() else {
                continue;
            };
            let Some(parent) = graph.parent_via(device.sid(), HolderKind::Encrypts) else {
                continue;
            };
            let Ok(Some(parent_size)) = graph.block_size(parent) else {
                continue;
            };

            let required = luks.size.saturating_add(LUKS_METADATA_SIZE);
            if required > parent_size {
                violations.push(device_violation(
                    graph,
                    device.sid(),
                    format!(
                        "size {} plus {} of metadata exceeds the {} of the underlying device",
                        ByteCount(luks.size),
                        ByteCount(LUKS_METADATA_SIZE),
                        ByteCount(parent_size),
                    ),
                ));
            }
        }
    }
}

/// Btrfs filesystems have exactly one top-level subvolume, all other
/// subvolumes nest below it, and at most one of them is the default. Other
/// filesystems have no subvolumes.
pub struct BtrfsSubvolumeRule;

impl Validator for BtrfsSubvolumeRule {
    fn name(&self) -> &'static str {
        "btrfs-subvolumes"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for device in graph.devices() {
            let sid = device.sid();

            if let Some(subvol) = device.as_subvolume() {
                let parent_is_fs = graph.parents(sid).into_iter().any(|p| {
                    graph
                        .find_device(p)
                        .is_some_and(|dev| dev.kind() == DeviceKind::Filesystem)
                });
                if subvol.is_top_level() != parent_is_fs {
                    violations.push(device_violation(
                        graph,
                        sid,
                        if subvol.is_top_level() {
                            "top-level subvolume must sit directly on its filesystem"
                        } else {
                            "subvolume must sit below the top-level subvolume"
                        },
                    ));
                }
                continue;
            }

            let Some(fs) = device.as_filesystem() else {
                continue;
            };
            let subvolumes = graph
                .out_holders(sid)
                .into_iter()
                .filter(|key| key.kind == HolderKind::SubvolumeOf)
                .count();

            if !fs.is_btrfs() {
                if subvolumes > 0 {
                    violations.push(device_violation(
                        graph,
                        sid,
                        format!("{} filesystems cannot have subvolumes", fs.fs_type),
                    ));
                }
                continue;
            }

            if subvolumes != 1 {
                violations.push(device_violation(
                    graph,
                    sid,
                    format!("expected exactly one top-level subvolume, found {subvolumes}"),
                ));
            }

            let defaults = graph
                .descendants(sid, false)
                .unwrap_or_default()
                .into_iter()
                .filter(|s| {
                    graph
                        .find_device(*s)
                        .and_then(|dev| dev.as_subvolume())
                        .is_some_and(|subvol| subvol.default)
                })
                .count();
            if defaults > 1 {
                violations.push(device_violation(
                    graph,
                    sid,
                    format!("has {defaults} default subvolumes, expected at most 1"),
                ));
            }
        }
    }
}

/// Partitions lie inside their disk, do not overlap, and have unique numbers.
pub struct PartitionLayoutRule;

impl Validator for PartitionLayoutRule {
    fn name(&self) -> &'static str {
        "partition-layout"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        for disk in graph.devices() {
            let Some(disk_info) = disk.as_disk() else {
                continue;
            };

            let mut partitions = graph
                .children(disk.sid())
                .into_iter()
                .filter_map(|sid| graph.find_device(sid)?.as_partition().map(|p| (sid, p)))
                .collect::<Vec<_>>();
            partitions.sort_by_key(|(sid, part)| (part.start, *sid));

            let mut numbers = BTreeMap::new();
            for (sid, part) in &partitions {
                if part.end() > disk_info.size {
                    violations.push(device_violation(
                        graph,
                        *sid,
                        format!(
                            "ends at {}, beyond the end of the disk at {}",
                            part.end(),
                            disk_info.size
                        ),
                    ));
                }

                if let Some(other) = numbers.insert(part.number, *sid) {
                    violations.push(device_violation(
                        graph,
                        *sid,
                        format!("partition number {} is also used by {other}", part.number),
                    ));
                }
            }

            for pair in partitions.windows(2) {
                let ((_, prev), (sid, part)) = (pair[0], pair[1]);
                if prev.end() > part.start {
                    violations.push(device_violation(
                        graph,
                        sid,
                        format!("overlaps with partition '{}'", prev.name),
                    ));
                }
            }
        }
    }
}

/// Block device names are unique.
pub struct UniqueNameRule;

impl Validator for UniqueNameRule {
    fn name(&self) -> &'static str {
        "unique-names"
    }

    fn validate(&self, graph: &DeviceGraph, violations: &mut Vec<Violation>) {
        let mut seen = BTreeSet::new();
        for device in graph.devices() {
            if let Some(name) = device.name() {
                if !seen.insert(name) {
                    violations.push(device_violation(
                        graph,
                        device.sid(),
                        "name is used by another device",
                    ));
                }
            }
        }
    }
}
