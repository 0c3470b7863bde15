//! Turns the difference between a probed and a staged graph into an ordered
//! list of actions.
//!
//! Planning happens in two steps. The diff step walks created, removed and
//! modified devices (and holders whose target survives) and emits actions for
//! each. The ordering step sorts those actions topologically:
//!
//! - Every tear-down action runs before every build-up action.
//! - Tear-down actions run on descendants before ancestors (probed graph).
//! - Build-up actions run on ancestors before descendants (staged graph).
//! - Actions on the same device run in the order of their kind.
//! - Nested mount points are mounted outside-in and unmounted inside-out.
//!
//! A cycle among these constraints fails planning.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    path::Path,
};

use log::{debug, trace};
use petgraph::{algo::tarjan_scc, graph::DiGraph};
use serde::Serialize;
use strum_macros::IntoStaticStr;

use blockgraph_api::{
    error::{BlockgraphError, PlanningError},
    primitives::bytes::ByteCount,
    storage_graph::diff::GraphDiff,
    Device, DeviceGraph, DeviceKind, DeviceVariant, HolderKey, HolderKind, Sid,
};

use crate::capabilities;

/// What an action does to its device.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[serde(rename_all = "kebab-case", tag = "action")]
#[strum(serialize_all = "kebab-case")]
pub enum ActionKind {
    // Tear-down, looked up in the probed graph.
    Unmount,
    RemoveFromRegistry,
    Deactivate,
    DetachMember { member: Sid },
    Shrink { size: u64 },
    Delete,

    // Build-up, looked up in the staged graph.
    Create,
    AttachMember { member: Sid },
    Grow { size: u64 },
    Modify,
    Activate,
    Mount,
    AddToRegistry,
    RenameInRegistry,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Position among the actions on one device.
    fn rank(&self) -> u8 {
        match self {
            Self::Unmount => 0,
            Self::RemoveFromRegistry => 1,
            Self::Deactivate => 2,
            Self::DetachMember { .. } => 3,
            Self::Shrink { .. } => 4,
            Self::Delete => 5,
            Self::Create => 6,
            Self::AttachMember { .. } => 7,
            Self::Grow { .. } => 8,
            Self::Modify => 9,
            Self::Activate => 10,
            Self::Mount => 11,
            Self::AddToRegistry => 12,
            Self::RenameInRegistry => 13,
        }
    }

    /// Whether the action tears down state of the probed graph.
    pub fn is_down(&self) -> bool {
        self.rank() <= Self::Delete.rank()
    }
}

/// One step of a commit plan.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Action {
    pub sid: Sid,
    pub device_kind: DeviceKind,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Description of the device, from the graph the action looks it up in.
    pub device: String,
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.device)
    }
}

/// Ordered actions taking the system from a probed to a staged graph.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    actions: Vec<Action>,
}

impl CommitPlan {
    #[tracing::instrument(skip_all)]
    pub fn new(probed: &DeviceGraph, staged: &DeviceGraph) -> Result<Self, BlockgraphError> {
        let diff = probed.diff(staged);
        if diff.is_empty() {
            debug!("Staged graph matches the probed graph, nothing to commit");
            return Ok(Self::default());
        }
        trace!(
            "Graph diff: {} created, {} removed, {} modified",
            diff.created.len(),
            diff.removed.len(),
            diff.modified.len()
        );

        let mut planner = Planner {
            probed,
            staged,
            actions: Vec::new(),
        };
        planner.collect(&diff)?;
        let actions = planner.order()?;

        debug!("Planned {} actions", actions.len());
        for (index, action) in actions.iter().enumerate() {
            trace!("{:>3}: {action}", index + 1);
        }
        Ok(Self { actions })
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// One numbered line per action.
    pub fn describe(&self) -> String {
        self.actions
            .iter()
            .enumerate()
            .map(|(index, action)| format!("{:>3}. {action}\n", index + 1))
            .collect()
    }
}

struct Planner<'a> {
    probed: &'a DeviceGraph,
    staged: &'a DeviceGraph,
    actions: Vec<Action>,
}

impl<'a> Planner<'a> {
    fn push(&mut self, sid: Sid, kind: ActionKind) -> Result<(), BlockgraphError> {
        let graph = if kind.is_down() {
            self.probed
        } else {
            self.staged
        };
        let device = graph.device(sid)?;
        self.actions.push(Action {
            sid,
            device_kind: device.kind(),
            kind,
            device: device.describe(),
        });
        Ok(())
    }

    fn unsupported(device: &Device, reason: impl Into<String>) -> BlockgraphError {
        PlanningError::UnsupportedChange {
            device: device.describe(),
            reason: reason.into(),
        }
        .into()
    }

    fn collect(&mut self, diff: &GraphDiff) -> Result<(), BlockgraphError> {
        for sid in &diff.removed {
            self.plan_removed(*sid)?;
        }
        for sid in &diff.modified {
            self.plan_modified(*sid)?;
        }
        for sid in &diff.created {
            self.plan_created(*sid)?;
        }
        for key in &diff.removed_holders {
            self.plan_holder(key, false)?;
        }
        for key in &diff.created_holders {
            self.plan_holder(key, true)?;
        }
        self.plan_fstab_refresh()?;
        self.plan_filesystem_resizes()
    }

    /// Rewrites the fstab entries of mount points that stay registered but
    /// refer to a device that was relabeled or renamed.
    fn plan_fstab_refresh(&mut self) -> Result<(), BlockgraphError> {
        let (probed, staged) = (self.probed, self.staged);
        for device in staged.devices() {
            let sid = device.sid();
            let (Some(old), Some(new)) = (
                probed.find_device(sid).and_then(Device::as_mount_point),
                device.as_mount_point(),
            ) else {
                continue;
            };
            if !old.in_fstab || !new.in_fstab || self.has_registry_action(sid) {
                continue;
            }

            // Entries the probed graph cannot describe were not written from it.
            let Ok(old_entry) = capabilities::fstab_entry(probed, sid) else {
                continue;
            };
            if capabilities::fstab_entry(staged, sid).ok().as_ref() != Some(&old_entry) {
                trace!("Fstab entry of {} changes", device.describe());
                self.push(sid, ActionKind::RenameInRegistry)?;
            }
        }
        Ok(())
    }

    fn has_registry_action(&self, sid: Sid) -> bool {
        self.actions.iter().any(|action| {
            action.sid == sid
                && matches!(
                    action.kind,
                    ActionKind::AddToRegistry
                        | ActionKind::RemoveFromRegistry
                        | ActionKind::RenameInRegistry
                )
        })
    }

    fn plan_created(&mut self, sid: Sid) -> Result<(), BlockgraphError> {
        let staged = self.staged;
        let device = staged.device(sid)?;
        match &device.variant {
            DeviceVariant::Disk(_) => {
                return Err(Self::unsupported(device, "disks cannot be created"));
            }
            DeviceVariant::Subvolume(subvolume) if subvolume.is_top_level() => {}
            DeviceVariant::EncryptedVolume(luks) => {
                if luks.passphrase.is_none() {
                    return Err(Self::unsupported(
                        device,
                        "a passphrase is required to create it",
                    ));
                }
                self.push(sid, ActionKind::Create)?;
                if luks.in_crypttab {
                    self.push(sid, ActionKind::AddToRegistry)?;
                }
            }
            DeviceVariant::MountPoint(mp) => {
                if mp.active {
                    self.push(sid, ActionKind::Mount)?;
                }
                if mp.in_fstab {
                    self.push(sid, ActionKind::AddToRegistry)?;
                }
            }
            DeviceVariant::Partition(_)
            | DeviceVariant::RaidArray(_)
            | DeviceVariant::Filesystem(_)
            | DeviceVariant::Subvolume(_) => self.push(sid, ActionKind::Create)?,
        }
        Ok(())
    }

    fn plan_removed(&mut self, sid: Sid) -> Result<(), BlockgraphError> {
        let probed = self.probed;
        let device = probed.device(sid)?;
        match &device.variant {
            DeviceVariant::Disk(_) => {
                return Err(Self::unsupported(device, "disks cannot be removed"));
            }
            DeviceVariant::RaidArray(array) => {
                if array.active {
                    self.push(sid, ActionKind::Deactivate)?;
                }
                self.push(sid, ActionKind::Delete)?;
            }
            DeviceVariant::EncryptedVolume(luks) => {
                if luks.in_crypttab {
                    self.push(sid, ActionKind::RemoveFromRegistry)?;
                }
                if luks.active {
                    self.push(sid, ActionKind::Deactivate)?;
                }
                self.push(sid, ActionKind::Delete)?;
            }
            DeviceVariant::Subvolume(subvolume) => {
                // Gone with the filesystem.
                let fs_removed = self
                    .probed
                    .filesystem_of(sid)
                    .is_some_and(|fs| !self.staged.contains(fs));
                if fs_removed {
                    return Ok(());
                }
                if subvolume.is_top_level() {
                    return Err(Self::unsupported(
                        device,
                        "the top-level subvolume cannot be removed",
                    ));
                }
                self.push(sid, ActionKind::Delete)?;
            }
            DeviceVariant::MountPoint(mp) => {
                if mp.active {
                    self.push(sid, ActionKind::Unmount)?;
                }
                if mp.in_fstab {
                    self.push(sid, ActionKind::RemoveFromRegistry)?;
                }
            }
            DeviceVariant::Partition(_) | DeviceVariant::Filesystem(_) => {
                self.push(sid, ActionKind::Delete)?
            }
        }
        Ok(())
    }

    fn plan_modified(&mut self, sid: Sid) -> Result<(), BlockgraphError> {
        let (probed, staged) = (self.probed, self.staged);
        let old = probed.device(sid)?;
        let new = staged.device(sid)?;

        match (&old.variant, &new.variant) {
            (DeviceVariant::Disk(_), DeviceVariant::Disk(_)) => {
                return Err(Self::unsupported(old, "disks cannot be changed"));
            }
            (DeviceVariant::Partition(a), DeviceVariant::Partition(b)) => {
                if a.name != b.name || a.number != b.number || a.start != b.start {
                    return Err(Self::unsupported(
                        old,
                        "partitions cannot be moved or renumbered",
                    ));
                }
                if a.size != b.size {
                    self.resize_block(new, a.size, b.size)?;
                }
            }
            (DeviceVariant::RaidArray(a), DeviceVariant::RaidArray(b)) => {
                if a.name != b.name || a.level != b.level {
                    return Err(Self::unsupported(
                        old,
                        "the name and level of RAID arrays cannot be changed",
                    ));
                }
                self.toggle_active(new, a.active, b.active)?;
            }
            (DeviceVariant::EncryptedVolume(a), DeviceVariant::EncryptedVolume(b)) => {
                if a.size != b.size {
                    self.resize_block(new, a.size, b.size)?;
                }

                let renamed = a.dm_name != b.dm_name;
                if renamed && a.active && b.active {
                    if self.mounted_below(sid)? {
                        return Err(Self::unsupported(
                            old,
                            "volumes with mounted filesystems cannot be renamed",
                        ));
                    }
                    self.push(sid, ActionKind::Deactivate)?;
                    self.push(sid, ActionKind::Activate)?;
                } else {
                    self.toggle_active(new, a.active, b.active)?;
                }

                match (a.in_crypttab, b.in_crypttab) {
                    (true, true)
                        if renamed
                            || a.mount_by != b.mount_by
                            || a.crypt_options != b.crypt_options =>
                    {
                        self.push(sid, ActionKind::RenameInRegistry)?
                    }
                    (true, false) => self.push(sid, ActionKind::RemoveFromRegistry)?,
                    (false, true) => self.push(sid, ActionKind::AddToRegistry)?,
                    _ => {}
                }
            }
            (DeviceVariant::Filesystem(a), DeviceVariant::Filesystem(b)) => {
                if a.fs_type != b.fs_type {
                    return Err(Self::unsupported(
                        old,
                        format!("cannot convert {} to {}", a.fs_type, b.fs_type),
                    ));
                }
                if a.snapshots != b.snapshots {
                    return Err(Self::unsupported(
                        old,
                        "snapshots can only be set up when the filesystem is created",
                    ));
                }
                if a.label != b.label {
                    if !b.fs_type.supports_label() {
                        return Err(Self::unsupported(
                            old,
                            format!("{} filesystems have no label", b.fs_type),
                        ));
                    }
                    self.push(sid, ActionKind::Modify)?;
                }
            }
            (DeviceVariant::Subvolume(a), DeviceVariant::Subvolume(b)) => {
                if a.path != b.path {
                    return Err(Self::unsupported(old, "subvolumes cannot be moved"));
                }
                if a.read_only != b.read_only || a.default != b.default {
                    self.push(sid, ActionKind::Modify)?;
                }
            }
            (DeviceVariant::MountPoint(a), DeviceVariant::MountPoint(b)) => {
                let moved = a.path != b.path || a.options != b.options;
                match (a.active, b.active) {
                    (true, true) if moved => {
                        self.push(sid, ActionKind::Unmount)?;
                        self.push(sid, ActionKind::Mount)?;
                    }
                    (true, false) => self.push(sid, ActionKind::Unmount)?,
                    (false, true) => self.push(sid, ActionKind::Mount)?,
                    _ => {}
                }
                match (a.in_fstab, b.in_fstab) {
                    (true, true) if moved || a.mount_by != b.mount_by => {
                        self.push(sid, ActionKind::RenameInRegistry)?
                    }
                    (true, false) => self.push(sid, ActionKind::RemoveFromRegistry)?,
                    (false, true) => self.push(sid, ActionKind::AddToRegistry)?,
                    _ => {}
                }
            }
            _ => {
                return Err(Self::unsupported(
                    old,
                    format!("cannot turn a {} into a {}", old.kind(), new.kind()),
                ));
            }
        }
        Ok(())
    }

    fn toggle_active(
        &mut self,
        device: &Device,
        old: bool,
        new: bool,
    ) -> Result<(), BlockgraphError> {
        match (old, new) {
            (true, false) => {
                if self.mounted_below(device.sid())? {
                    return Err(Self::unsupported(
                        device,
                        "cannot deactivate it while filesystems on it stay mounted",
                    ));
                }
                self.push(device.sid(), ActionKind::Deactivate)
            }
            (false, true) => self.push(device.sid(), ActionKind::Activate),
            _ => Ok(()),
        }
    }

    /// Whether an active mount point of the staged graph sits on `sid`.
    fn mounted_below(&self, sid: Sid) -> Result<bool, BlockgraphError> {
        Ok(self
            .staged
            .descendants(sid, false)?
            .into_iter()
            .filter_map(|child| self.staged.find_device(child)?.as_mount_point())
            .any(|mp| mp.active))
    }

    fn resize_block(
        &mut self,
        device: &Device,
        old: u64,
        new: u64,
    ) -> Result<(), BlockgraphError> {
        let info = self.staged.resize_info(device.sid())?;
        if !info.allows(new) {
            let reason = info.reason.unwrap_or_else(|| {
                format!(
                    "{} is outside of {}..{}",
                    ByteCount(new),
                    ByteCount(info.min_size),
                    ByteCount(info.max_size)
                )
            });
            return Err(Self::unsupported(device, reason));
        }

        let kind = if new < old {
            ActionKind::Shrink { size: new }
        } else {
            ActionKind::Grow { size: new }
        };
        self.push(device.sid(), kind)
    }

    /// Filesystems have no size of their own. They follow their block device.
    fn plan_filesystem_resizes(&mut self) -> Result<(), BlockgraphError> {
        let (probed, staged) = (self.probed, self.staged);
        for device in staged.devices() {
            let Some(fs) = device.as_filesystem() else {
                continue;
            };
            let sid = device.sid();
            let Some(old_fs) = probed.find_device(sid).and_then(|d| d.as_filesystem()) else {
                continue;
            };
            if old_fs.fs_type != fs.fs_type {
                continue;
            }

            let (Some(old_blk), Some(new_blk)) = (
                probed.underlying_block_device(sid),
                staged.underlying_block_device(sid),
            ) else {
                continue;
            };
            let (Some(old), Some(new)) = (
                probed.block_size(old_blk)?,
                staged.block_size(new_blk)?,
            ) else {
                continue;
            };

            if new > old {
                if !fs.fs_type.can_grow() {
                    return Err(Self::unsupported(
                        device,
                        format!("{} filesystems cannot grow", fs.fs_type),
                    ));
                }
                self.push(sid, ActionKind::Grow { size: new })?;
            } else if new < old {
                if !fs.fs_type.can_shrink() {
                    return Err(Self::unsupported(
                        device,
                        format!("{} filesystems cannot shrink", fs.fs_type),
                    ));
                }
                if new < fs.fs_type.min_size() {
                    return Err(Self::unsupported(
                        device,
                        format!(
                            "{} is below the minimum of {}",
                            ByteCount(new),
                            ByteCount(fs.fs_type.min_size())
                        ),
                    ));
                }
                self.push(sid, ActionKind::Shrink { size: new })?;
            }
        }
        Ok(())
    }

    /// Holder changes between devices that exist on both sides.
    fn plan_holder(&mut self, key: &HolderKey, created: bool) -> Result<(), BlockgraphError> {
        if !self.probed.contains(key.target) || !self.staged.contains(key.target) {
            return Ok(());
        }

        match (key.kind, created) {
            (HolderKind::MemberOf, true) => self.push(
                key.target,
                ActionKind::AttachMember { member: key.source },
            ),
            (HolderKind::MemberOf, false) => self.push(
                key.target,
                ActionKind::DetachMember { member: key.source },
            ),
            _ => Err(Self::unsupported(
                self.staged.device(key.target)?,
                format!("its {} holder cannot be changed", key.kind),
            )),
        }
    }

    fn ancestors(
        graph: &DeviceGraph,
        sids: &BTreeSet<Sid>,
    ) -> Result<BTreeMap<Sid, BTreeSet<Sid>>, BlockgraphError> {
        let mut ancestors = BTreeMap::new();
        for sid in sids.iter().filter(|sid| graph.contains(**sid)) {
            ancestors.insert(*sid, graph.ancestors(*sid, false)?.into_iter().collect());
        }
        Ok(ancestors)
    }

    fn mount_path(&self, action: &Action) -> Option<&'a Path> {
        let graph = match action.kind {
            ActionKind::Mount => self.staged,
            ActionKind::Unmount => self.probed,
            _ => return None,
        };
        graph
            .find_device(action.sid)?
            .as_mount_point()
            .map(|mp| mp.path.as_path())
    }

    /// Whether action `a` must run before action `b`.
    fn precedes(
        &self,
        a: &Action,
        b: &Action,
        probed_ancestors: &BTreeMap<Sid, BTreeSet<Sid>>,
        staged_ancestors: &BTreeMap<Sid, BTreeSet<Sid>>,
    ) -> bool {
        match (a.kind.is_down(), b.kind.is_down()) {
            (true, false) => return true,
            (false, true) => return false,
            _ => {}
        }
        if a.sid == b.sid {
            return a.kind.rank() < b.kind.rank();
        }

        let nested = |inner: &Action, outer: &Action| match (
            self.mount_path(inner),
            self.mount_path(outer),
        ) {
            (Some(inner), Some(outer)) => inner != outer && inner.starts_with(outer),
            _ => false,
        };

        if a.kind.is_down() {
            probed_ancestors
                .get(&a.sid)
                .is_some_and(|ancestors| ancestors.contains(&b.sid))
                || nested(a, b)
        } else {
            staged_ancestors
                .get(&b.sid)
                .is_some_and(|ancestors| ancestors.contains(&a.sid))
                || nested(b, a)
        }
    }

    /// Sorts the actions topologically. Among actions that are ready, the one
    /// emitted first runs first.
    fn order(self) -> Result<Vec<Action>, BlockgraphError> {
        let sids = self.actions.iter().map(|action| action.sid).collect();
        let probed_ancestors = Self::ancestors(self.probed, &sids)?;
        let staged_ancestors = Self::ancestors(self.staged, &sids)?;

        let count = self.actions.len();
        let mut successors = vec![Vec::new(); count];
        let mut indegree = vec![0usize; count];
        for (i, a) in self.actions.iter().enumerate() {
            for (j, b) in self.actions.iter().enumerate() {
                if i != j && self.precedes(a, b, &probed_ancestors, &staged_ancestors) {
                    successors[i].push(j);
                    indegree[j] += 1;
                }
            }
        }

        let mut ready = (0..count)
            .filter(|index| indegree[*index] == 0)
            .collect::<BTreeSet<_>>();
        let mut sorted = Vec::with_capacity(count);
        while let Some(index) = ready.pop_first() {
            sorted.push(index);
            for next in &successors[index] {
                indegree[*next] -= 1;
                if indegree[*next] == 0 {
                    ready.insert(*next);
                }
            }
        }

        if sorted.len() < count {
            let cycle = self.find_cycle(&successors, &indegree);
            return Err(PlanningError::UnresolvableDependency { cycle }.into());
        }

        let mut actions = self.actions.into_iter().map(Some).collect::<Vec<_>>();
        Ok(sorted
            .into_iter()
            .filter_map(|index| actions[index].take())
            .collect())
    }

    /// Describes one cycle among the actions the sort could not place.
    fn find_cycle(&self, successors: &[Vec<usize>], indegree: &[usize]) -> String {
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes = (0..successors.len())
            .filter(|index| indegree[*index] > 0)
            .map(|index| (index, graph.add_node(index)))
            .collect::<BTreeMap<_, _>>();
        for (index, node) in &nodes {
            for next in &successors[*index] {
                if let Some(target) = nodes.get(next) {
                    graph.add_edge(*node, *target, ());
                }
            }
        }

        let Some(component) = tarjan_scc(&graph)
            .into_iter()
            .find(|component| component.len() > 1)
        else {
            return "unknown".into();
        };
        let members = component
            .iter()
            .map(|node| graph[*node])
            .collect::<BTreeSet<_>>();

        // Walk inside the component until a node repeats.
        let mut path = Vec::new();
        let mut current = members.first().copied();
        while let Some(index) = current {
            if let Some(start) = path.iter().position(|seen| *seen == index) {
                path.drain(..start);
                path.push(index);
                break;
            }
            path.push(index);
            current = successors[index]
                .iter()
                .copied()
                .find(|next| members.contains(next));
        }

        path.iter()
            .map(|index| self.actions[*index].to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
