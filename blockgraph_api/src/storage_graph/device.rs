use std::{cmp::Ordering, fmt::Display, path::PathBuf};

use serde::{Deserialize, Serialize};
use strum_macros::{EnumString, IntoStaticStr};

use crate::{
    constants::{
        BTRFS_MIN_SIZE, BTRFS_TOP_LEVEL_SUBVOLUME_ID, DEFAULT_SNAPPER_CONFIG_NAME,
        DEVICE_MAPPER_PREFIX, EXT_MIN_SIZE, MD_NAMED_PREFIX, MD_NUMBERED_PREFIX, XFS_MIN_SIZE,
    },
    primitives::secret::Secret,
};

use super::sid::Sid;

/// Enum for supported device kinds
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum DeviceKind {
    Disk,
    Partition,
    RaidArray,
    EncryptedVolume,
    Filesystem,
    Subvolume,
    MountPoint,
}

bitflags::bitflags! {
    /// Bitflags for device kinds
    ///
    /// MUST MATCH THE CONTENTS OF DeviceKind
    #[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DeviceKindFlag: u32 {
        const Disk = 1;
        const Partition = 1 << 1;
        const RaidArray = 1 << 2;
        const EncryptedVolume = 1 << 3;
        const Filesystem = 1 << 4;
        const Subvolume = 1 << 5;
        const MountPoint = 1 << 6;

        const BlockDevice = Self::Disk.bits()
            | Self::Partition.bits()
            | Self::RaidArray.bits()
            | Self::EncryptedVolume.bits();
        const Mountable = Self::Filesystem.bits() | Self::Subvolume.bits();
    }
}

impl DeviceKind {
    pub fn as_flag(self) -> DeviceKindFlag {
        match self {
            Self::Disk => DeviceKindFlag::Disk,
            Self::Partition => DeviceKindFlag::Partition,
            Self::RaidArray => DeviceKindFlag::RaidArray,
            Self::EncryptedVolume => DeviceKindFlag::EncryptedVolume,
            Self::Filesystem => DeviceKindFlag::Filesystem,
            Self::Subvolume => DeviceKindFlag::Subvolume,
            Self::MountPoint => DeviceKindFlag::MountPoint,
        }
    }

    pub fn is_block_device(self) -> bool {
        DeviceKindFlag::BlockDevice.contains(self.as_flag())
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disk => "disk",
            Self::Partition => "partition",
            Self::RaidArray => "raid-array",
            Self::EncryptedVolume => "encrypted-volume",
            Self::Filesystem => "filesystem",
            Self::Subvolume => "subvolume",
            Self::MountPoint => "mount-point",
        })
    }
}

impl Display for DeviceKindFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            DeviceKind::Disk,
            DeviceKind::Partition,
            DeviceKind::RaidArray,
            DeviceKind::EncryptedVolume,
            DeviceKind::Filesystem,
            DeviceKind::Subvolume,
            DeviceKind::MountPoint,
        ]
        .into_iter()
        .filter(|kind| self.contains(kind.as_flag()))
        .map(|kind| kind.to_string())
        .collect::<Vec<_>>();

        write!(f, "{}", names.join(", "))
    }
}

/// RAID levels supported for software RAID arrays.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    /// Minimum number of members an array of this level can be built from.
    pub fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 2,
            Self::Raid5 => 3,
            Self::Raid6 | Self::Raid10 => 4,
        }
    }

    /// Usable size of an array of `count` members of `member_size` bytes each.
    pub fn array_size(self, member_size: u64, count: u64) -> u64 {
        match self {
            // Striping, every member contributes.
            Self::Raid0 => member_size.saturating_mul(count),
            // Full mirror, one member worth of data.
            Self::Raid1 => member_size,
            // One member worth of parity.
            Self::Raid5 => member_size.saturating_mul(count.saturating_sub(1)),
            // Two members worth of parity.
            Self::Raid6 => member_size.saturating_mul(count.saturating_sub(2)),
            // Striped mirrors.
            Self::Raid10 => member_size.saturating_mul(count) / 2,
        }
    }
}

impl Display for RaidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// Filesystem types the agent can probe and create.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilesystemType {
    Btrfs,
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Vfat,
    Swap,
}

impl FilesystemType {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn can_grow(self) -> bool {
        matches!(
            self,
            Self::Btrfs | Self::Ext2 | Self::Ext3 | Self::Ext4 | Self::Xfs
        )
    }

    pub fn can_shrink(self) -> bool {
        matches!(self, Self::Btrfs | Self::Ext2 | Self::Ext3 | Self::Ext4)
    }

    /// Smallest block device the filesystem can live on.
    pub fn min_size(self) -> u64 {
        match self {
            Self::Btrfs => BTRFS_MIN_SIZE,
            Self::Ext2 | Self::Ext3 | Self::Ext4 => EXT_MIN_SIZE,
            Self::Xfs => XFS_MIN_SIZE,
            Self::Vfat | Self::Swap => 0,
        }
    }

    pub fn supports_label(self) -> bool {
        !matches!(self, Self::Swap)
    }

    pub fn is_mountable(self) -> bool {
        !matches!(self, Self::Swap)
    }
}

impl Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a device is referred to in a persistent table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MountBy {
    #[default]
    Device,
    Uuid,
    Label,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Disk {
    pub name: String,
    pub size: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Partition {
    pub name: String,
    pub number: u32,
    /// Offset from the start of the disk, in bytes.
    pub start: u64,
    pub size: u64,
}

impl Partition {
    pub fn new(name: impl Into<String>, number: u32, start: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            number,
            start,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RaidArray {
    pub name: String,
    pub level: RaidLevel,
    pub uuid: Option<String>,
    pub active: bool,
}

impl RaidArray {
    pub fn new(name: impl Into<String>, level: RaidLevel) -> Self {
        Self {
            name: name.into(),
            level,
            uuid: None,
            active: true,
        }
    }

    /// Orders arrays by name: named arrays (`/dev/md/<name>`) first, sorted
    /// lexicographically, then numbered arrays (`/dev/md<N>`) sorted by number.
    pub fn compare_by_name(lhs: &RaidArray, rhs: &RaidArray) -> Ordering {
        compare_md_names(&lhs.name, &rhs.name)
    }
}

enum MdName<'a> {
    Named(&'a str),
    Numbered(u64),
    Other(&'a str),
}

impl<'a> MdName<'a> {
    fn parse(name: &'a str) -> Self {
        if let Some(named) = name.strip_prefix(MD_NAMED_PREFIX) {
            return Self::Named(named);
        }

        match name
            .strip_prefix(MD_NUMBERED_PREFIX)
            .and_then(|n| n.parse().ok())
        {
            Some(number) => Self::Numbered(number),
            None => Self::Other(name),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Named(_) => 0,
            Self::Numbered(_) => 1,
            Self::Other(_) => 2,
        }
    }
}

pub fn compare_md_names(lhs: &str, rhs: &str) -> Ordering {
    match (MdName::parse(lhs), MdName::parse(rhs)) {
        (MdName::Named(a), MdName::Named(b)) => a.cmp(b),
        (MdName::Numbered(a), MdName::Numbered(b)) => a.cmp(&b),
        (MdName::Other(a), MdName::Other(b)) => a.cmp(b),
        (a, b) => a.rank().cmp(&b.rank()),
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptedVolume {
    /// Name of the device-mapper target, without the `/dev/mapper/` prefix.
    pub dm_name: String,
    /// Usable size of the opened volume.
    pub size: u64,
    pub uuid: Option<String>,
    pub active: bool,
    pub in_crypttab: bool,
    pub crypt_options: Vec<String>,
    pub mount_by: MountBy,
    #[serde(skip)]
    pub passphrase: Option<Secret>,
}

impl EncryptedVolume {
    pub fn new(dm_name: impl Into<String>, size: u64) -> Self {
        Self {
            dm_name: dm_name.into(),
            size,
            uuid: None,
            active: true,
            in_crypttab: false,
            crypt_options: Vec::new(),
            mount_by: MountBy::Device,
            passphrase: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{DEVICE_MAPPER_PREFIX}{}", self.dm_name)
    }
}

/// Snapshot configuration attached to a btrfs filesystem on request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotConfig {
    pub config_name: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            config_name: DEFAULT_SNAPPER_CONFIG_NAME.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    pub fs_type: FilesystemType,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub snapshots: Option<SnapshotConfig>,
}

impl Filesystem {
    pub fn new(fs_type: FilesystemType) -> Self {
        Self {
            fs_type,
            uuid: None,
            label: None,
            snapshots: None,
        }
    }

    pub fn is_btrfs(&self) -> bool {
        self.fs_type == FilesystemType::Btrfs
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Subvolume {
    /// Btrfs subvolume id, unknown until the subvolume exists.
    pub id: Option<u64>,
    /// Path relative to the top-level subvolume. Empty for the top-level.
    pub path: String,
    pub default: bool,
    pub read_only: bool,
}

impl Subvolume {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: None,
            path: path.into(),
            default: false,
            read_only: false,
        }
    }

    pub fn top_level() -> Self {
        Self {
            id: Some(BTRFS_TOP_LEVEL_SUBVOLUME_ID),
            path: String::new(),
            default: false,
            read_only: false,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.id == Some(BTRFS_TOP_LEVEL_SUBVOLUME_ID)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MountPoint {
    pub path: PathBuf,
    pub options: Vec<String>,
    pub mount_by: MountBy,
    pub in_fstab: bool,
    pub active: bool,
}

impl MountPoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: Vec::new(),
            mount_by: MountBy::Uuid,
            in_fstab: true,
            active: true,
        }
    }
}

/// Variant-specific attributes of a device.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum DeviceVariant {
    Disk(Disk),
    Partition(Partition),
    RaidArray(RaidArray),
    EncryptedVolume(EncryptedVolume),
    Filesystem(Filesystem),
    Subvolume(Subvolume),
    MountPoint(MountPoint),
}

macro_rules! variant_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for DeviceVariant {
                fn from(value: $variant) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

variant_from!(
    Disk,
    Partition,
    RaidArray,
    EncryptedVolume,
    Filesystem,
    Subvolume,
    MountPoint
);

impl DeviceVariant {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Disk(_) => DeviceKind::Disk,
            Self::Partition(_) => DeviceKind::Partition,
            Self::RaidArray(_) => DeviceKind::RaidArray,
            Self::EncryptedVolume(_) => DeviceKind::EncryptedVolume,
            Self::Filesystem(_) => DeviceKind::Filesystem,
            Self::Subvolume(_) => DeviceKind::Subvolume,
            Self::MountPoint(_) => DeviceKind::MountPoint,
        }
    }
}

/// A node of the device graph.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    sid: Sid,
    #[serde(flatten)]
    pub variant: DeviceVariant,
}

impl Device {
    pub(crate) fn new(sid: Sid, variant: DeviceVariant) -> Self {
        Self { sid, variant }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn kind(&self) -> DeviceKind {
        self.variant.kind()
    }

    pub fn is_block_device(&self) -> bool {
        self.kind().is_block_device()
    }

    /// Returns the kernel name of block devices, e.g. `/dev/sda1`.
    pub fn name(&self) -> Option<String> {
        match &self.variant {
            DeviceVariant::Disk(disk) => Some(disk.name.clone()),
            DeviceVariant::Partition(part) => Some(part.name.clone()),
            DeviceVariant::RaidArray(array) => Some(array.name.clone()),
            DeviceVariant::EncryptedVolume(luks) => Some(luks.name()),
            DeviceVariant::Filesystem(_)
            | DeviceVariant::Subvolume(_)
            | DeviceVariant::MountPoint(_) => None,
        }
    }

    /// Returns the stored size of block devices that carry one.
    ///
    /// RAID array sizes depend on their members and are computed by the graph.
    pub fn stored_size(&self) -> Option<u64> {
        match &self.variant {
            DeviceVariant::Disk(disk) => Some(disk.size),
            DeviceVariant::Partition(part) => Some(part.size),
            DeviceVariant::EncryptedVolume(luks) => Some(luks.size),
            _ => None,
        }
    }

    /// Returns a user friendly description of the device suitable for logging.
    ///
    /// Output examples:
    ///
    /// - `disk '/dev/sda'`
    /// - `filesystem [type:btrfs label:root]`
    /// - `mount point '/home'`
    pub fn describe(&self) -> String {
        match &self.variant {
            DeviceVariant::Disk(disk) => format!("disk '{}'", disk.name),
            DeviceVariant::Partition(part) => format!("partition '{}'", part.name),
            DeviceVariant::RaidArray(array) => format!("RAID array '{}'", array.name),
            DeviceVariant::EncryptedVolume(luks) => {
                format!("encrypted volume '{}'", luks.name())
            }
            DeviceVariant::Filesystem(fs) => {
                let mut desc = format!("type:{}", fs.fs_type);
                if let Some(label) = &fs.label {
                    desc += &format!(" label:{label}");
                } else if let Some(uuid) = &fs.uuid {
                    desc += &format!(" uuid:{uuid}");
                } else {
                    desc += &format!(" sid:{}", self.sid.value());
                }
                format!("filesystem [{desc}]")
            }
            DeviceVariant::Subvolume(subvol) if subvol.is_top_level() => {
                format!("top-level subvolume {}", self.sid)
            }
            DeviceVariant::Subvolume(subvol) => format!("subvolume '{}'", subvol.path),
            DeviceVariant::MountPoint(mp) => format!("mount point '{}'", mp.path.display()),
        }
    }

    pub fn as_disk(&self) -> Option<&Disk> {
        match &self.variant {
            DeviceVariant::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_partition(&self) -> Option<&Partition> {
        match &self.variant {
            DeviceVariant::Partition(part) => Some(part),
            _ => None,
        }
    }

    pub fn as_raid_array(&self) -> Option<&RaidArray> {
        match &self.variant {
            DeviceVariant::RaidArray(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_encrypted_volume(&self) -> Option<&EncryptedVolume> {
        match &self.variant {
            DeviceVariant::EncryptedVolume(luks) => Some(luks),
            _ => None,
        }
    }

    pub fn as_encrypted_volume_mut(&mut self) -> Option<&mut EncryptedVolume> {
        match &mut self.variant {
            DeviceVariant::EncryptedVolume(luks) => Some(luks),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&Filesystem> {
        match &self.variant {
            DeviceVariant::Filesystem(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn as_filesystem_mut(&mut self) -> Option<&mut Filesystem> {
        match &mut self.variant {
            DeviceVariant::Filesystem(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn as_subvolume(&self) -> Option<&Subvolume> {
        match &self.variant {
            DeviceVariant::Subvolume(subvol) => Some(subvol),
            _ => None,
        }
    }

    pub fn as_subvolume_mut(&mut self) -> Option<&mut Subvolume> {
        match &mut self.variant {
            DeviceVariant::Subvolume(subvol) => Some(subvol),
            _ => None,
        }
    }

    pub fn as_mount_point(&self) -> Option<&MountPoint> {
        match &self.variant {
            DeviceVariant::MountPoint(mp) => Some(mp),
            _ => None,
        }
    }

    pub fn as_mount_point_mut(&mut self) -> Option<&mut MountPoint> {
        match &mut self.variant {
            DeviceVariant::MountPoint(mp) => Some(mp),
            _ => None,
        }
    }
}
