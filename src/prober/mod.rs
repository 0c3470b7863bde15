//! # Prober
//!
//! Builds a `DeviceGraph` that mirrors the live system. Facts depend on each
//! other (a LUKS UUID can only be read once the underlying device is known,
//! subvolumes can only be listed once the filesystem is mounted), so probing
//! runs in strictly ordered passes:
//!
//! | Pass | Facts                                                      |
//! |------|------------------------------------------------------------|
//! | 1a   | block device nodes: disks, partitions, RAID, LUKS          |
//! | 1b   | block topology (partition-of, member-of, encrypts)         |
//! | 1c   | filesystems and btrfs top-level subvolumes                 |
//! | 1d   | mount points from the mount table and fstab                |
//! | 1e   | facts read off already known devices (LUKS UUIDs)          |
//! | 2a   | btrfs subvolume nodes and edges, while mounted             |
//! | 2b   | per-subvolume refinement and subvolume mounts              |
//!
//! Each device kind has a `KindProber` that only implements the passes it
//! needs. A pass never starts before every prober finished the previous one.
//!
//! A device that cannot be probed either aborts the probe (`Strict`) or is
//! recorded in the `ProbeReport` and removed from the result together with
//! everything stacked on it (`BestEffort`).

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use anyhow::Error;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, IntoStaticStr};

use blockgraph_api::{
    error::{BlockgraphError, BlockgraphResultExt, ProbeError, ReportError},
    storage_graph::device::MountPoint,
    DeviceGraph, Sid,
};

use crate::{
    activation::NameSequence,
    inventory::{BlockDeviceFacts, BtrfsFacts, SystemInventory},
    mounts::MountRegistry,
};

mod block;
mod btrfs;
mod filesystems;

use block::{DiskProber, LuksProber, PartitionProber, RaidProber};
use btrfs::SubvolumeProber;
use filesystems::{FilesystemProber, MountPointProber};

/// Probing passes, in execution order.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    EnumIter,
    IntoStaticStr,
)]
pub enum Pass {
    #[serde(rename = "1a")]
    #[strum(serialize = "1a")]
    Nodes,
    #[serde(rename = "1b")]
    #[strum(serialize = "1b")]
    Topology,
    #[serde(rename = "1c")]
    #[strum(serialize = "1c")]
    Filesystems,
    #[serde(rename = "1d")]
    #[strum(serialize = "1d")]
    MountPoints,
    #[serde(rename = "1e")]
    #[strum(serialize = "1e")]
    Identities,
    #[serde(rename = "2a")]
    #[strum(serialize = "2a")]
    Subvolumes,
    #[serde(rename = "2b")]
    #[strum(serialize = "2b")]
    Refine,
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// What to do when a single device cannot be probed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// Abort the whole probe.
    #[default]
    Strict,
    /// Drop the device's subtree and continue with its siblings.
    BestEffort,
}

/// A device that was dropped from a best-effort probe.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeIssue {
    pub device: String,
    pub pass: Pass,
    pub message: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeReport {
    pub issues: Vec<ProbeIssue>,
}

impl ProbeReport {
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug)]
pub struct ProbeOutcome {
    pub graph: DeviceGraph,
    pub report: ProbeReport,
}

/// A mount of a btrfs subvolume. Attached in pass 2b, once subvolumes exist.
#[derive(Debug, Clone)]
pub(crate) struct SubvolumeMount {
    pub filesystem: Sid,
    /// Subvolume path relative to the top-level subvolume.
    pub path: String,
    pub mount_point: MountPoint,
}

/// Subvolume facts of one btrfs filesystem, gathered in pass 2a.
#[derive(Debug)]
pub(crate) struct BtrfsState {
    pub facts: BtrfsFacts,
    /// Btrfs subvolume id to node.
    pub ids: BTreeMap<u64, Sid>,
}

/// State shared by all probers during one probe.
pub(crate) struct ProbeContext<'a> {
    pub inventory: &'a dyn SystemInventory,
    pub mounts: &'a MountRegistry,
    pub names: &'a mut NameSequence,
    mode: ProbeMode,

    pub graph: DeviceGraph,
    /// Block device node by kernel name. Active LUKS volumes are listed under
    /// their device-mapper name.
    pub block_devices: BTreeMap<String, Sid>,
    /// LUKS node by the name of the device it sits on.
    pub luks: BTreeMap<String, Sid>,
    /// Filesystem node by the name of its block device.
    pub filesystems: BTreeMap<String, Sid>,
    /// Places where the top-level subvolume of a btrfs filesystem is already
    /// mounted.
    pub top_level_mounts: BTreeMap<Sid, PathBuf>,
    pub subvolume_mounts: Vec<SubvolumeMount>,
    pub btrfs: BTreeMap<Sid, BtrfsState>,

    failed: BTreeSet<Sid>,
    report: ProbeReport,
}

impl<'a> ProbeContext<'a> {
    fn new(
        inventory: &'a dyn SystemInventory,
        mounts: &'a MountRegistry,
        names: &'a mut NameSequence,
        mode: ProbeMode,
    ) -> Self {
        Self {
            inventory,
            mounts,
            names,
            mode,
            graph: DeviceGraph::new(),
            block_devices: BTreeMap::new(),
            luks: BTreeMap::new(),
            filesystems: BTreeMap::new(),
            top_level_mounts: BTreeMap::new(),
            subvolume_mounts: Vec::new(),
            btrfs: BTreeMap::new(),
            failed: BTreeSet::new(),
            report: ProbeReport::default(),
        }
    }

    /// All block devices known to the inventory.
    pub fn block_device_facts(&self) -> Result<&'a [BlockDeviceFacts], BlockgraphError> {
        self.inventory
            .block_devices()
            .structured(ProbeError::Inventory("block devices".into()))
    }

    /// Whether the device or anything below which it is stacked failed.
    pub fn skipped(&self, sid: Sid) -> bool {
        self.graph
            .ancestors(sid, true)
            .map(|sids| sids.iter().any(|s| self.failed.contains(s)))
            .unwrap_or(true)
    }

    /// Handles a device that could not be probed. Returns an error in strict
    /// mode. Otherwise records the failure and marks the device's subtree for
    /// removal.
    pub fn fail(
        &mut self,
        sid: Option<Sid>,
        pass: Pass,
        error: ProbeError,
        source: Error,
    ) -> Result<(), BlockgraphError> {
        let device = match &error {
            ProbeError::ProbeFailure { device, .. } | ProbeError::EnsureMounted { device } => {
                device.clone()
            }
            ProbeError::Inventory(_) => String::new(),
        };

        if self.mode == ProbeMode::Strict {
            return Err(BlockgraphError::with_source(error, source));
        }

        warn!("Skipping '{device}': {error}: {source:#}");
        self.report.issues.push(ProbeIssue {
            device,
            pass,
            message: format!("{error}: {source:#}"),
        });
        if let Some(sid) = sid {
            self.failed.insert(sid);
        }
        Ok(())
    }

    /// Removes every failed device and whatever is stacked on it.
    fn prune_failed(&mut self) -> Result<(), BlockgraphError> {
        let mut doomed = BTreeSet::new();
        for sid in &self.failed {
            if self.graph.contains(*sid) {
                doomed.extend(self.graph.descendants(*sid, true)?);
            }
        }

        for sid in doomed {
            let device = self.graph.remove_device(sid)?;
            debug!("Dropped {} from probed graph", device.describe());
        }
        Ok(())
    }
}

/// Builds a `ProbeFailure` for a device.
pub(crate) fn probe_failure(device: impl Into<String>, pass: Pass, what: &str) -> ProbeError {
    ProbeError::ProbeFailure {
        device: device.into(),
        pass: pass.to_string(),
        what: what.into(),
    }
}

/// Probing logic of one device kind.
pub(crate) trait KindProber {
    fn name(&self) -> &'static str;

    /// Runs one pass. Kinds without work in a pass keep the default.
    fn probe(&self, _pass: Pass, _ctx: &mut ProbeContext) -> Result<(), BlockgraphError> {
        Ok(())
    }
}

/// All kind probers, in the order they run within a pass.
const PROBERS: &[&dyn KindProber] = &[
    &DiskProber,
    &PartitionProber,
    &RaidProber,
    &LuksProber,
    &FilesystemProber,
    &SubvolumeProber,
    &MountPointProber,
];

/// Builds probed graphs from a system inventory.
pub struct Prober<'a> {
    inventory: &'a dyn SystemInventory,
    mounts: &'a MountRegistry,
    mode: ProbeMode,
}

impl<'a> Prober<'a> {
    pub fn new(inventory: &'a dyn SystemInventory, mounts: &'a MountRegistry) -> Self {
        Self {
            inventory,
            mounts,
            mode: ProbeMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ProbeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Runs every pass and returns the probed graph. Automatically generated
    /// LUKS names are drawn from `names`.
    #[tracing::instrument(skip_all)]
    pub fn probe(&self, names: &mut NameSequence) -> Result<ProbeOutcome, BlockgraphError> {
        let mut ctx = ProbeContext::new(self.inventory, self.mounts, names, self.mode);

        for pass in Pass::iter() {
            debug!("Running probe pass {pass}");
            for prober in PROBERS {
                prober
                    .probe(pass, &mut ctx)
                    .message(format!("Failed to probe {} in pass {pass}", prober.name()))?;
            }
        }

        ctx.prune_failed()?;
        trace!("Probed graph:\n{}", ctx.graph.describe());
        debug!(
            "Probed {} devices, {} skipped",
            ctx.graph.len(),
            ctx.report.issues.len()
        );

        Ok(ProbeOutcome {
            graph: ctx.graph,
            report: ctx.report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use indoc::indoc;
    use maplit::btreeset;

    use blockgraph_api::{
        error::ErrorKind,
        storage_graph::device::{DeviceKind, FilesystemType, MountBy},
        HolderKind,
    };

    use crate::inventory::StaticInventory;

    const ENCRYPTED_ROOT: &str = indoc! {r#"
        block-devices:
          - name: /dev/sda
            kind: disk
            size: 20G
          - name: /dev/sda1
            kind: partition
            parents: [/dev/sda]
            start: 1M
            number: 1
            size: 512M
            fs-type: vfat
            uuid: 84A0-088E
            label: EFI
          - name: /dev/sda2
            kind: partition
            parents: [/dev/sda]
            start: 513M
            number: 2
            size: 10G
            fs-type: crypto_LUKS
            uuid: c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e
          - name: /dev/mapper/cr_root
            kind: crypt
            parents: [/dev/sda2]
            size: 10224M
            fs-type: btrfs
            uuid: 0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4
        mounts:
          - device: /dev/mapper/cr_root
            path: /
            fs-type: btrfs
            options: [rw, relatime, subvol=/@]
        fstab:
          - device: UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4
            path: /
            fs-type: btrfs
            options: [defaults, subvol=@]
          - device: UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4
            path: /home
            fs-type: btrfs
            options: [subvol=@/home]
          - device: LABEL=EFI
            path: /boot/efi
            fs-type: vfat
            options: [umask=0077]
        crypttab:
          - name: cr_root
            device: UUID=c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e
            options: [luks, discard]
        btrfs:
          /dev/mapper/cr_root:
            default-subvolume: 256
            subvolumes:
              - {id: 257, parent-id: 256, path: "@/home"}
              - {id: 258, parent-id: 257, path: "@/home/.snapshots", read-only: true}
              - {id: 256, parent-id: 5, path: "@"}
    "#};

    fn probe(yaml: &str, mode: ProbeMode) -> Result<ProbeOutcome, BlockgraphError> {
        let inventory = StaticInventory::from_yaml(yaml).unwrap();
        let mounts = MountRegistry::playback();
        let mut names = NameSequence::default();
        Prober::new(&inventory, &mounts)
            .with_mode(mode)
            .probe(&mut names)
    }

    fn find<'g>(
        graph: &'g DeviceGraph,
        pred: impl Fn(&blockgraph_api::Device) -> bool,
    ) -> &'g blockgraph_api::Device {
        graph.devices().find(|dev| pred(dev)).unwrap()
    }

    fn mount_point<'g>(graph: &'g DeviceGraph, path: &str) -> &'g blockgraph_api::Device {
        find(graph, |dev| {
            dev.as_mount_point()
                .is_some_and(|mp| mp.path == Path::new(path))
        })
    }

    #[test]
    fn test_probe_encrypted_root() {
        let outcome = probe(ENCRYPTED_ROOT, ProbeMode::Strict).unwrap();
        let graph = &outcome.graph;
        assert!(outcome.report.is_complete());
        assert_eq!(graph.check_all().0, vec![]);

        let disk = graph.find_by_name("/dev/sda").unwrap().sid();
        let root_part = graph.find_by_name("/dev/sda2").unwrap().sid();
        assert_eq!(graph.parent_via(root_part, HolderKind::PartitionOf), Some(disk));

        let luks = graph.find_by_name("/dev/mapper/cr_root").unwrap();
        let volume = luks.as_encrypted_volume().unwrap();
        assert_eq!(volume.dm_name, "cr_root");
        assert_eq!(volume.size, 10224 << 20);
        assert_eq!(
            volume.uuid.as_deref(),
            Some("c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e")
        );
        assert!(volume.active);
        assert!(volume.in_crypttab);
        assert_eq!(volume.crypt_options, vec!["luks", "discard"]);
        assert_eq!(volume.mount_by, MountBy::Uuid);

        let fs = graph.filesystem_on(luks.sid()).unwrap();
        let fs_device = graph.device(fs).unwrap().as_filesystem().unwrap();
        assert_eq!(fs_device.fs_type, FilesystemType::Btrfs);

        let root_subvol = graph.find_subvolume_by_path(fs, "@").unwrap();
        let subvol = graph.device(root_subvol).unwrap().as_subvolume().unwrap();
        assert!(subvol.default);
        assert_eq!(subvol.id, Some(256));

        let root = mount_point(graph, "/");
        assert_eq!(graph.parents(root.sid()), vec![root_subvol]);
        let root_mp = root.as_mount_point().unwrap();
        assert!(root_mp.active);
        assert!(root_mp.in_fstab);
        assert_eq!(root_mp.options, vec!["defaults"]);
        assert_eq!(root_mp.mount_by, MountBy::Uuid);

        let home = mount_point(graph, "/home").as_mount_point().unwrap();
        assert!(!home.active);
        assert!(home.in_fstab);

        let efi = mount_point(graph, "/boot/efi");
        let efi_mp = efi.as_mount_point().unwrap();
        assert_eq!(efi_mp.mount_by, MountBy::Label);
        assert!(!efi_mp.active);
        let efi_fs = graph.parents(efi.sid())[0];
        assert_eq!(
            graph.underlying_block_device(efi_fs),
            Some(graph.find_by_name("/dev/sda1").unwrap().sid())
        );
    }

    #[test]
    fn test_subvolume_children_listed_before_parents() {
        let outcome = probe(ENCRYPTED_ROOT, ProbeMode::Strict).unwrap();
        let graph = &outcome.graph;
        let fs = find(graph, |dev| {
            dev.as_filesystem().is_some_and(|fs| fs.is_btrfs())
        })
        .sid();

        let root = graph.find_subvolume_by_path(fs, "@").unwrap();
        let home = graph.find_subvolume_by_path(fs, "@/home").unwrap();
        let snapshots = graph.find_subvolume_by_path(fs, "@/home/.snapshots").unwrap();

        assert_eq!(graph.parents(home), vec![root]);
        assert_eq!(graph.parents(snapshots), vec![home]);
        let below_root = graph.descendants(root, false).unwrap();
        assert!(below_root.contains(&home));
        assert!(below_root.contains(&snapshots));

        let snapshots = graph.device(snapshots).unwrap().as_subvolume().unwrap();
        assert!(snapshots.read_only);
        assert!(!snapshots.default);

        let top_level = graph.top_level_subvolume(fs).unwrap();
        assert_eq!(graph.parents(root), vec![top_level]);
        assert_eq!(graph.parents(top_level), vec![fs]);
    }

    #[test]
    fn test_subvolumes_listed_while_mounted() {
        let runner = std::sync::Arc::new(osutils::testutils::MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let mounts = MountRegistry::new(crate::mounts::SystemMounter::new(
            runner.clone(),
            dir.path(),
        ));
        let inventory = StaticInventory::from_yaml(ENCRYPTED_ROOT).unwrap();
        let mut names = NameSequence::default();
        Prober::new(&inventory, &mounts).probe(&mut names).unwrap();

        let mounted = runner.commands_matching("mount ");
        assert_eq!(mounted.len(), 1);
        assert!(mounted[0].starts_with("mount -o subvol=/ -t btrfs /dev/mapper/cr_root "));
        assert_eq!(runner.commands_matching("umount").len(), 1);
        assert_eq!(mounts.active(), 0);
    }

    const INACTIVE_LUKS: &str = indoc! {r#"
        block-devices:
          - {name: /dev/vda, kind: disk, size: 8G}
          - name: /dev/vda1
            kind: partition
            parents: [/dev/vda]
            start: 1M
            number: 1
            size: 1G
            fs-type: crypto_LUKS
            uuid: 11111111-2222-3333-4444-555555555555
          - name: /dev/vda2
            kind: partition
            parents: [/dev/vda]
            start: 1025M
            number: 2
            size: 1G
            fs-type: crypto_LUKS
            uuid: 66666666-7777-8888-9999-000000000000
          - name: /dev/mapper/cr-auto-1
            kind: crypt
            parents: [/dev/vda2]
            size: 1008M
    "#};

    #[test]
    fn test_inactive_luks_gets_free_name() {
        let outcome = probe(INACTIVE_LUKS, ProbeMode::Strict).unwrap();
        let graph = &outcome.graph;

        let part = graph.find_by_name("/dev/vda1").unwrap().sid();
        let luks = graph.children(part)[0];
        let volume = graph.device(luks).unwrap().as_encrypted_volume().unwrap();
        assert_eq!(volume.dm_name, "cr-auto-2");
        assert!(!volume.active);
        assert!(!volume.in_crypttab);
        assert_eq!(volume.size, 1008 << 20);
        assert_eq!(
            volume.uuid.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );

        let active = graph.find_by_name("/dev/mapper/cr-auto-1").unwrap();
        assert!(active.as_encrypted_volume().unwrap().active);
    }

    const BROKEN_LUKS: &str = indoc! {r#"
        block-devices:
          - {name: /dev/vda, kind: disk, size: 8G}
          - name: /dev/vda1
            kind: partition
            parents: [/dev/vda]
            start: 1M
            number: 1
            size: 1G
            fs-type: crypto_LUKS
          - name: /dev/mapper/data
            kind: crypt
            parents: [/dev/vda1]
            size: 1008M
            fs-type: ext4
            uuid: 9b0c3a1e-0000-4000-8000-000000000001
          - name: /dev/vda2
            kind: partition
            parents: [/dev/vda]
            start: 1025M
            number: 2
            size: 1G
            fs-type: ext4
            uuid: 9b0c3a1e-0000-4000-8000-000000000002
        mounts:
          - {device: /dev/mapper/data, path: /srv, fs-type: ext4, options: [rw]}
    "#};

    #[test]
    fn test_luks_uuid_failure_is_strict_by_default() {
        let error = probe(BROKEN_LUKS, ProbeMode::Strict).unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::Probe(ProbeError::ProbeFailure {
                device: "/dev/mapper/data".into(),
                pass: "1e".into(),
                what: "luks uuid".into(),
            })
        );
        assert_eq!(
            error.kind().to_string(),
            "Failed to probe luks uuid for device '/dev/mapper/data' in pass 1e"
        );
    }

    #[test]
    fn test_best_effort_drops_failed_subtree() {
        let outcome = probe(BROKEN_LUKS, ProbeMode::BestEffort).unwrap();
        let graph = &outcome.graph;

        assert_eq!(outcome.report.issues.len(), 1);
        assert_eq!(outcome.report.issues[0].device, "/dev/mapper/data");
        assert_eq!(outcome.report.issues[0].pass, Pass::Identities);

        // The LUKS volume, its filesystem and mount point are gone.
        assert!(graph.find_by_name("/dev/mapper/data").is_err());
        assert!(!graph
            .devices()
            .any(|dev| dev.kind() == DeviceKind::MountPoint));

        // Siblings are untouched.
        let sibling = graph.find_by_name("/dev/vda2").unwrap().sid();
        assert!(graph.filesystem_on(sibling).is_some());
        assert!(graph.find_by_name("/dev/vda1").is_ok());
        assert_eq!(graph.check_all().0, vec![]);
    }

    const RAID: &str = indoc! {r#"
        block-devices:
          - {name: /dev/sdb, kind: disk, size: 4G}
          - {name: /dev/sdc, kind: disk, size: 4G}
          - name: /dev/md0
            kind: raid
            parents: [/dev/sdb, /dev/sdc]
            size: 4G
            fs-type: xfs
            uuid: 3e5f6a7b-1111-2222-3333-444455556666
        raid-arrays:
          /dev/md0: {level: raid1, uuid: "0a1b2c3d:4e5f6a7b:8c9d0e1f:2a3b4c5d"}
        fstab:
          - {device: /dev/md0, path: /data, fs-type: xfs}
          - {device: /dev/md0, path: none, fs-type: swap}
    "#};

    #[test]
    fn test_probe_raid() {
        let outcome = probe(RAID, ProbeMode::Strict).unwrap();
        let graph = &outcome.graph;

        let md = graph.find_by_name("/dev/md0").unwrap();
        let array = md.as_raid_array().unwrap();
        assert_eq!(array.level.to_string(), "raid1");
        let members = graph
            .parents(md.sid())
            .into_iter()
            .filter_map(|sid| graph.device(sid).ok()?.name())
            .collect::<BTreeSet<_>>();
        assert_eq!(
            members,
            btreeset! {"/dev/sdb".to_owned(), "/dev/sdc".to_owned()}
        );
        assert_eq!(graph.block_size(md.sid()).unwrap(), Some(4 << 30));

        let fs = graph.filesystem_on(md.sid()).unwrap();
        let data = mount_point(graph, "/data");
        assert_eq!(graph.parents(data.sid()), vec![fs]);
        assert_eq!(data.as_mount_point().unwrap().mount_by, MountBy::Device);

        // Entries without an absolute path are not mount points.
        assert_eq!(graph.children(fs), vec![data.sid()]);
    }

    #[test]
    fn test_missing_raid_details() {
        let inventory = StaticInventory {
            raid_arrays: Default::default(),
            ..StaticInventory::from_yaml(RAID).unwrap()
        };
        let mounts = MountRegistry::playback();
        let mut names = NameSequence::default();
        let outcome = Prober::new(&inventory, &mounts)
            .with_mode(ProbeMode::BestEffort)
            .probe(&mut names)
            .unwrap();

        assert_eq!(outcome.report.issues[0].device, "/dev/md0");
        assert!(outcome.graph.find_by_name("/dev/md0").is_err());
        assert!(!outcome
            .graph
            .devices()
            .any(|dev| dev.kind() == DeviceKind::Filesystem));
        assert_eq!(outcome.graph.len(), 2);
    }

    #[test]
    fn test_unknown_subvolume_parent() {
        let yaml = ENCRYPTED_ROOT.replace(
            "parent-id: 256, path: \"@/home\"",
            "parent-id: 999, path: \"@/home\"",
        );
        let error = probe(&yaml, ProbeMode::Strict).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Probe(ProbeError::ProbeFailure { pass, .. }) if pass == "2a"
        ));

        let outcome = probe(&yaml, ProbeMode::BestEffort).unwrap();
        assert_eq!(outcome.report.issues[0].pass, Pass::Subvolumes);
        assert!(!outcome
            .graph
            .devices()
            .any(|dev| dev.as_filesystem().is_some_and(|fs| fs.is_btrfs())));
        assert!(outcome.graph.find_by_name("/dev/mapper/cr_root").is_ok());
    }

    #[test]
    fn test_inconsistent_subvolume_listing() {
        let repeated_id = ENCRYPTED_ROOT.replace(
            "{id: 258, parent-id: 257,",
            "{id: 257, parent-id: 256,",
        );
        let parent_cycle = ENCRYPTED_ROOT.replace(
            "{id: 256, parent-id: 5,",
            "{id: 256, parent-id: 258,",
        );

        for yaml in [repeated_id, parent_cycle] {
            assert!(matches!(
                probe(&yaml, ProbeMode::Strict).unwrap_err().kind(),
                ErrorKind::Probe(ProbeError::ProbeFailure { .. })
            ));

            let outcome = probe(&yaml, ProbeMode::BestEffort).unwrap();
            assert_eq!(outcome.report.issues.len(), 1);
            assert_eq!(outcome.report.issues[0].pass, Pass::Subvolumes);
            assert!(!outcome
                .graph
                .devices()
                .any(|dev| dev.kind() == DeviceKind::Subvolume));
            assert_eq!(outcome.graph.check_all().0, vec![]);
        }
    }

    #[test]
    fn test_passes_are_ordered() {
        let passes = Pass::iter().map(|p| p.to_string()).collect::<Vec<_>>();
        assert_eq!(passes, vec!["1a", "1b", "1c", "1d", "1e", "2a", "2b"]);
    }
}
