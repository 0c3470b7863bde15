use std::fmt::Display;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use super::{
    cardinality::ValidCardinality,
    device::{DeviceKind, DeviceKindFlag},
    sid::Sid,
};

/// Kind of structural relationship a holder represents. Holders always point
/// from the parent (the device being used) to the child (the user).
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum HolderKind {
    /// Disk -> partition.
    PartitionOf,
    /// Block device -> RAID array.
    MemberOf,
    /// Block device -> encrypted volume.
    Encrypts,
    /// Block device -> filesystem.
    FormattedAs,
    /// Btrfs filesystem or subvolume -> subvolume.
    SubvolumeOf,
    /// Filesystem or subvolume -> mount point.
    MountedAt,
}

impl HolderKind {
    /// Device kinds allowed at the source (parent) end.
    pub fn valid_sources(self) -> DeviceKindFlag {
        match self {
            Self::PartitionOf => DeviceKindFlag::Disk,
            Self::MemberOf => DeviceKindFlag::Disk | DeviceKindFlag::Partition,
            Self::Encrypts | Self::FormattedAs => DeviceKindFlag::BlockDevice,
            Self::SubvolumeOf | Self::MountedAt => DeviceKindFlag::Mountable,
        }
    }

    /// The only device kind allowed at the target (child) end.
    pub fn valid_target(self) -> DeviceKind {
        match self {
            Self::PartitionOf => DeviceKind::Partition,
            Self::MemberOf => DeviceKind::RaidArray,
            Self::Encrypts => DeviceKind::EncryptedVolume,
            Self::FormattedAs => DeviceKind::Filesystem,
            Self::SubvolumeOf => DeviceKind::Subvolume,
            Self::MountedAt => DeviceKind::MountPoint,
        }
    }

    /// Returns the holder kind a device of the given kind is attached to its
    /// parents with, if it can have parents at all.
    pub fn for_target(kind: DeviceKind) -> Option<Self> {
        match kind {
            DeviceKind::Disk => None,
            DeviceKind::Partition => Some(Self::PartitionOf),
            DeviceKind::RaidArray => Some(Self::MemberOf),
            DeviceKind::EncryptedVolume => Some(Self::Encrypts),
            DeviceKind::Filesystem => Some(Self::FormattedAs),
            DeviceKind::Subvolume => Some(Self::SubvolumeOf),
            DeviceKind::MountPoint => Some(Self::MountedAt),
        }
    }

    /// Number of holders of this kind a single target may have.
    ///
    /// RAID arrays have a level dependent minimum that is checked separately.
    pub fn parent_cardinality(self) -> ValidCardinality {
        match self {
            Self::MemberOf => ValidCardinality::new_at_least(1),
            _ => ValidCardinality::new_exact(1),
        }
    }

    /// Whether a parent used through this holder kind is used exclusively.
    ///
    /// A block device can be split into partitions, or used whole by exactly
    /// one user, never both.
    pub fn is_exclusive_use(self) -> bool {
        matches!(self, Self::MemberOf | Self::Encrypts | Self::FormattedAs)
    }
}

impl Display for HolderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// Identity of a holder: its endpoints and kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HolderKey {
    pub source: Sid,
    pub target: Sid,
    pub kind: HolderKind,
}

impl HolderKey {
    pub fn new(source: Sid, target: Sid, kind: HolderKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }
}

impl Display for HolderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source, self.kind, self.target)
    }
}
