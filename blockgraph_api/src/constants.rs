use const_format::formatcp;

// Size constants

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Size of a disk sector as understood by the kernel and cryptsetup.
pub const SECTOR_SIZE: u64 = 512;

/// Space taken by the LUKS2 header at the start of the underlying device.
pub const LUKS_METADATA_SIZE_IN_MIB: u64 = 16;

/// Space taken by the LUKS2 header, in bytes.
pub const LUKS_METADATA_SIZE: u64 = LUKS_METADATA_SIZE_IN_MIB * MIB;

/// Smallest partition the planner will size or resize to.
pub const PARTITION_MIN_SIZE: u64 = MIB;

/// Smallest size mkfs.btrfs accepts for a single-device filesystem.
pub const BTRFS_MIN_SIZE: u64 = 256 * MIB;

/// Smallest size an ext2/3/4 filesystem can be shrunk to.
pub const EXT_MIN_SIZE: u64 = 32 * MIB;

/// Smallest size an XFS filesystem can be created with.
pub const XFS_MIN_SIZE: u64 = 300 * MIB;

// Btrfs constants

/// Id of the btrfs top-level subvolume (FS_TREE).
pub const BTRFS_TOP_LEVEL_SUBVOLUME_ID: u64 = 5;

/// Mount option selecting a btrfs subvolume by path.
pub const BTRFS_SUBVOL_OPTION: &str = "subvol";

// Device naming constants

/// Directory holding device-mapper nodes.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

/// Prefix of all device-mapper device names.
pub const DEVICE_MAPPER_PREFIX: &str = formatcp!("{DEVICE_MAPPER_DIR}/");

/// Prefix of numbered MD RAID arrays (e.g. /dev/md0).
pub const MD_NUMBERED_PREFIX: &str = "/dev/md";

/// Prefix of named MD RAID arrays (e.g. /dev/md/home).
pub const MD_NAMED_PREFIX: &str = formatcp!("{MD_NUMBERED_PREFIX}/");

/// Prefix for generated names of activated encrypted volumes.
pub const AUTO_CRYPT_NAME_PREFIX: &str = "cr-auto-";

// Paths

/// Root mount point path.
pub const ROOT_MOUNT_POINT_PATH: &str = "/";

/// Default location of the agent configuration.
pub const AGENT_CONFIG_PATH: &str = "/etc/blockgraph/config.yaml";

/// Default location of the persistent mount table.
pub const ETC_FSTAB_PATH: &str = "/etc/fstab";

/// Default location of the persistent encrypted volume table.
pub const ETC_CRYPTTAB_PATH: &str = "/etc/crypttab";

/// Default directory under which temporary mount points are created.
pub const DEFAULT_MOUNT_DIR: &str = "/run/blockgraph/mnt";

/// Mount point reported while playing back a recorded inventory.
pub const PLAYBACK_MOUNT_POINT: &str = "/tmp/does-not-matter";

/// Default number of passphrase attempts per encrypted volume.
pub const DEFAULT_MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

/// Snapper configuration name used for the root filesystem.
pub const DEFAULT_SNAPPER_CONFIG_NAME: &str = "root";
