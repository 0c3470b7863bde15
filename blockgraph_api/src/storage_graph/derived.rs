use std::collections::BTreeSet;

use serde::Serialize;

use crate::constants::{LUKS_METADATA_SIZE, PARTITION_MIN_SIZE};

use super::{
    device::{DeviceKind, DeviceVariant},
    error::GraphError,
    graph::DeviceGraph,
    holder::HolderKind,
    sid::Sid,
};

/// Whether a device can be resized, and within which bounds.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ResizeInfo {
    pub resize_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub min_size: u64,
    pub max_size: u64,
}

impl ResizeInfo {
    pub fn fixed(reason: impl Into<String>) -> Self {
        Self {
            resize_ok: false,
            reason: Some(reason.into()),
            min_size: 0,
            max_size: 0,
        }
    }

    pub fn range(min_size: u64, max_size: u64) -> Self {
        if min_size > max_size {
            return Self {
                reason: Some("no space left to resize".into()),
                ..Self::fixed_range(min_size, max_size)
            };
        }

        Self {
            resize_ok: true,
            reason: None,
            min_size,
            max_size,
        }
    }

    fn fixed_range(min_size: u64, max_size: u64) -> Self {
        Self {
            resize_ok: false,
            reason: None,
            min_size,
            max_size,
        }
    }

    /// Moves both bounds down by `overhead`, e.g. from a container to its
    /// payload.
    pub fn shrink_by(self, overhead: u64) -> Self {
        Self {
            min_size: self.min_size.saturating_sub(overhead),
            max_size: self.max_size.saturating_sub(overhead),
            ..self
        }
    }

    /// Combines two constraints on the same size.
    pub fn intersect(self, other: Self) -> Self {
        if !self.resize_ok {
            return self;
        }
        if !other.resize_ok {
            return other;
        }
        Self::range(
            self.min_size.max(other.min_size),
            self.max_size.min(other.max_size),
        )
    }

    pub fn allows(&self, size: u64) -> bool {
        self.resize_ok && self.min_size <= size && size <= self.max_size
    }
}

impl DeviceGraph {
    /// Returns the size of a block device. RAID array sizes are computed from
    /// their members. Returns `None` for devices that are not block devices or
    /// arrays without members.
    pub fn block_size(&self, sid: Sid) -> Result<Option<u64>, GraphError> {
        self.block_size_on_path(sid, &mut BTreeSet::new())
    }

    /// `path` holds the arrays currently being sized, to fail on member
    /// cycles instead of recursing forever.
    fn block_size_on_path(
        &self,
        sid: Sid,
        path: &mut BTreeSet<Sid>,
    ) -> Result<Option<u64>, GraphError> {
        let device = self.device(sid)?;
        let DeviceVariant::RaidArray(array) = &device.variant else {
            return Ok(device.stored_size());
        };
        if !path.insert(sid) {
            return Err(GraphError::Cycle { sid });
        }

        let members = self.parents(sid);
        let mut smallest = None::<u64>;
        for member in &members {
            if let Some(size) = self.block_size_on_path(*member, path)? {
                smallest = Some(smallest.map_or(size, |s| s.min(size)));
            }
        }
        path.remove(&sid);

        Ok(smallest.map(|size| array.level.array_size(size, members.len() as u64)))
    }

    /// Returns the block device a device sits on through a single holder of
    /// the given kind.
    pub fn parent_via(&self, sid: Sid, kind: HolderKind) -> Option<Sid> {
        self.in_holders(sid)
            .into_iter()
            .find(|key| key.kind == kind)
            .map(|key| key.source)
    }

    /// Returns the block device a filesystem or encrypted volume lives on.
    pub fn underlying_block_device(&self, sid: Sid) -> Option<Sid> {
        let kind = self.find_device(sid)?.kind();
        let holder = HolderKind::for_target(kind)?;
        if matches!(holder, HolderKind::FormattedAs | HolderKind::Encrypts) {
            self.parent_via(sid, holder)
        } else {
            None
        }
    }

    /// Returns the filesystem a subvolume or mount point belongs to, or the
    /// device itself if it is a filesystem.
    pub fn filesystem_of(&self, sid: Sid) -> Option<Sid> {
        self.ancestors(sid, true).ok()?.into_iter().find(|s| {
            self.find_device(*s)
                .is_some_and(|dev| dev.kind() == DeviceKind::Filesystem)
        })
    }

    /// Returns the filesystem on a block device, if any.
    pub fn filesystem_on(&self, sid: Sid) -> Option<Sid> {
        self.out_holders(sid)
            .into_iter()
            .find(|key| key.kind == HolderKind::FormattedAs)
            .map(|key| key.target)
    }

    /// Finds a subvolume of a btrfs filesystem by its path.
    pub fn find_subvolume_by_path(&self, filesystem: Sid, path: &str) -> Result<Sid, GraphError> {
        self.descendants(filesystem, false)?
            .into_iter()
            .find(|sid| {
                self.find_device(*sid)
                    .and_then(|dev| dev.as_subvolume())
                    .is_some_and(|subvol| subvol.path == path)
            })
            .ok_or_else(|| GraphError::SubvolumeNotFound {
                filesystem,
                path: path.into(),
            })
    }

    /// Returns the top-level subvolume of a btrfs filesystem.
    pub fn top_level_subvolume(&self, filesystem: Sid) -> Result<Sid, GraphError> {
        self.find_subvolume_by_path(filesystem, "")
    }

    /// Refreshes attributes derived from relationships. Currently this is the
    /// usable size of encrypted volumes.
    pub fn compute_derived(&mut self, sid: Sid) -> Result<(), GraphError> {
        if self.device(sid)?.kind() != DeviceKind::EncryptedVolume {
            return Ok(());
        }

        let Some(parent) = self.parent_via(sid, HolderKind::Encrypts) else {
            return Ok(());
        };
        let Some(parent_size) = self.block_size(parent)? else {
            return Ok(());
        };

        if let Some(luks) = self.device_mut(sid)?.as_encrypted_volume_mut() {
            luks.size = parent_size.saturating_sub(LUKS_METADATA_SIZE);
        }
        Ok(())
    }

    /// Sets the size of a disk, partition or encrypted volume and refreshes
    /// the size of every encrypted volume stacked on top of it.
    pub fn resize_block_device(&mut self, sid: Sid, size: u64) -> Result<(), GraphError> {
        match &mut self.device_mut(sid)?.variant {
            DeviceVariant::Disk(disk) => disk.size = size,
            DeviceVariant::Partition(part) => part.size = size,
            DeviceVariant::EncryptedVolume(luks) => luks.size = size,
            _ => return Ok(()),
        }

        for child in self.descendants(sid, false)? {
            self.compute_derived(child)?;
        }
        Ok(())
    }

    /// Returns whether and how far a device can be resized.
    pub fn resize_info(&self, sid: Sid) -> Result<ResizeInfo, GraphError> {
        self.resize_info_on_path(sid, &mut BTreeSet::new())
    }

    fn resize_info_on_path(
        &self,
        sid: Sid,
        path: &mut BTreeSet<Sid>,
    ) -> Result<ResizeInfo, GraphError> {
        let device = self.device(sid)?;
        if !path.insert(sid) {
            return Err(GraphError::Cycle { sid });
        }

        let info = match &device.variant {
            DeviceVariant::Partition(part) => {
                let Some(disk) = self.parent_via(sid, HolderKind::PartitionOf) else {
                    return Ok(ResizeInfo::fixed("partition is not on a disk"));
                };
                let disk_end = self.block_size(disk)?.unwrap_or_default();

                // Bounded by the disk end and the next partition's start.
                let limit = self
                    .children(disk)
                    .into_iter()
                    .filter_map(|s| self.find_device(s)?.as_partition().map(|p| p.start))
                    .filter(|start| *start > part.start)
                    .fold(disk_end, u64::min);

                ResizeInfo::range(PARTITION_MIN_SIZE, limit.saturating_sub(part.start))
            }
            DeviceVariant::EncryptedVolume(_) => match self.parent_via(sid, HolderKind::Encrypts) {
                Some(parent) => self
                    .resize_info_on_path(parent, path)?
                    .shrink_by(LUKS_METADATA_SIZE),
                None => ResizeInfo::fixed("encrypted volume has no underlying block device"),
            },
            DeviceVariant::Filesystem(fs) => {
                let fs_type = fs.fs_type;
                if !fs_type.can_grow() && !fs_type.can_shrink() {
                    return Ok(ResizeInfo::fixed(format!(
                        "resizing {fs_type} filesystems is not supported"
                    )));
                }

                let Some(blk) = self.underlying_block_device(sid) else {
                    return Ok(ResizeInfo::fixed("filesystem has no underlying block device"));
                };
                let current = self.block_size(blk)?.unwrap_or_default();
                let own = ResizeInfo::range(
                    if fs_type.can_shrink() {
                        fs_type.min_size()
                    } else {
                        current
                    },
                    if fs_type.can_grow() { u64::MAX } else { current },
                );

                own.intersect(self.resize_info_on_path(blk, path)?)
            }
            DeviceVariant::Disk(_) => ResizeInfo::fixed("disks cannot be resized"),
            DeviceVariant::RaidArray(_) => ResizeInfo::fixed("RAID arrays cannot be resized"),
            DeviceVariant::Subvolume(_) | DeviceVariant::MountPoint(_) => {
                ResizeInfo::fixed(format!("{} has no size", device.describe()))
            }
        };

        path.remove(&sid);
        Ok(info)
    }
}
