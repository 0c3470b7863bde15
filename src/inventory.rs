//! Read-only snapshots of the facts the prober needs about the live system.
//!
//! Two sources exist: `LiveInventory` queries the system tools through a
//! `CommandRunner` and caches every answer, and `StaticInventory` plays back a
//! YAML snapshot. Both are queried repeatedly during one probe and must keep
//! returning the same answers.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context, Error};
use log::{debug, trace};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use blockgraph_api::{
    error::{BlockgraphError, InvalidInputError, ReportError},
    primitives::bytes::ByteCount,
    storage_graph::device::{MountBy, RaidLevel},
};
use osutils::{
    btrfs, cryptsetup,
    dependencies::CommandRunner,
    lsblk, mdadm,
    tabfile::{CryptTab, TabDevice, TabFile},
};

/// Filesystem type lsblk and blkid report for LUKS containers.
pub const LUKS_FS_TYPE: &str = "crypto_LUKS";

/// Mount table of the running kernel.
const PROC_MOUNTS_PATH: &str = "/proc/self/mounts";

const BY_UUID_DIR: &str = "/dev/disk/by-uuid/";
const BY_LABEL_DIR: &str = "/dev/disk/by-label/";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    Disk,
    Partition,
    Raid,
    Crypt,
}

/// Coarse facts about one block device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BlockDeviceFacts {
    pub name: String,
    pub kind: BlockKind,
    pub size: ByteCount,
    /// Offset of a partition from the start of its disk.
    #[serde(default)]
    pub start: Option<ByteCount>,
    #[serde(default)]
    pub number: Option<u32>,
    /// Kernel names of the devices this one is built on.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl BlockDeviceFacts {
    pub fn is_luks(&self) -> bool {
        self.fs_type.as_deref() == Some(LUKS_FS_TYPE)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RaidFacts {
    pub level: RaidLevel,
    #[serde(default)]
    pub uuid: Option<String>,
}

/// One line of the mount table or of the persistent mount registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MountFacts {
    /// Device specification as written in the table: a path, `UUID=` or
    /// `LABEL=`.
    pub device: String,
    pub path: PathBuf,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountFacts {
    pub fn mount_by(&self) -> MountBy {
        mount_by_of(&TabDevice::parse(&self.device))
    }

    /// Returns the value of a `key=value` option.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|option| option.strip_prefix(key)?.strip_prefix('='))
    }
}

/// One line of the persistent encryption registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CryptFacts {
    /// Device-mapper name the volume is opened as.
    pub name: String,
    pub device: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl CryptFacts {
    pub fn mount_by(&self) -> MountBy {
        mount_by_of(&TabDevice::parse(&self.device))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SubvolumeFacts {
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BtrfsFacts {
    #[serde(default = "top_level_id")]
    pub default_subvolume: u64,
    /// Subvolumes in the order the tool reported them. Children may appear
    /// before their parents.
    #[serde(default)]
    pub subvolumes: Vec<SubvolumeFacts>,
}

fn top_level_id() -> u64 {
    blockgraph_api::constants::BTRFS_TOP_LEVEL_SUBVOLUME_ID
}

fn mount_by_of(device: &TabDevice) -> MountBy {
    match device {
        TabDevice::Path(_) => MountBy::Device,
        TabDevice::Uuid(_) => MountBy::Uuid,
        TabDevice::Label(_) => MountBy::Label,
    }
}

/// Snapshot query interface consumed by the prober.
pub trait SystemInventory {
    /// All block devices, parents before children.
    fn block_devices(&self) -> Result<&[BlockDeviceFacts], Error>;

    fn raid_array(&self, name: &str) -> Result<RaidFacts, Error>;

    /// LUKS UUID read from the header on `underlying`.
    fn luks_uuid(&self, underlying: &str) -> Result<String, Error>;

    /// Currently active mounts.
    fn mounts(&self) -> Result<&[MountFacts], Error>;

    /// Entries of the persistent mount registry.
    fn fstab(&self) -> Result<&[MountFacts], Error>;

    /// Entries of the persistent encryption registry.
    fn crypttab(&self) -> Result<&[CryptFacts], Error>;

    /// Subvolumes of the btrfs filesystem on `device`, which is mounted with
    /// its top-level subvolume at `mount_path`.
    fn btrfs(&self, device: &str, mount_path: &Path) -> Result<BtrfsFacts, Error>;

    fn block_device(&self, name: &str) -> Result<Option<&BlockDeviceFacts>, Error> {
        Ok(self.block_devices()?.iter().find(|dev| dev.name == name))
    }

    /// Resolves a table device specification to a block device name.
    fn resolve(&self, spec: &str) -> Result<Option<String>, Error> {
        let device = match spec {
            s if s.starts_with(BY_UUID_DIR) => TabDevice::Uuid(s[BY_UUID_DIR.len()..].into()),
            s if s.starts_with(BY_LABEL_DIR) => {
                TabDevice::Label(s[BY_LABEL_DIR.len()..].into())
            }
            s => TabDevice::parse(s),
        };

        let devices = self.block_devices()?;
        Ok(match device {
            TabDevice::Path(path) => Some(path.to_string_lossy().into_owned()),
            TabDevice::Uuid(uuid) => devices
                .iter()
                .find(|dev| dev.uuid.as_deref() == Some(uuid.as_str()))
                .map(|dev| dev.name.clone()),
            TabDevice::Label(label) => devices
                .iter()
                .find(|dev| dev.label.as_deref() == Some(label.as_str()))
                .map(|dev| dev.name.clone()),
        })
    }

    /// Active mounts of the block device `name`.
    fn mounts_for(&self, name: &str) -> Result<Vec<MountFacts>, Error> {
        let mut result = Vec::new();
        for mount in self.mounts()? {
            if self.resolve(&mount.device)?.as_deref() == Some(name) {
                result.push(mount.clone());
            }
        }
        Ok(result)
    }

    /// Persistent mount registry entries of the block device `name`.
    fn fstab_for(&self, name: &str) -> Result<Vec<MountFacts>, Error> {
        let mut result = Vec::new();
        for entry in self.fstab()? {
            if self.resolve(&entry.device)?.as_deref() == Some(name) {
                result.push(entry.clone());
            }
        }
        Ok(result)
    }

    /// Encryption registry entry for the volume opened as `dm_name`.
    fn crypttab_by_name(&self, dm_name: &str) -> Result<Option<CryptFacts>, Error> {
        Ok(self
            .crypttab()?
            .iter()
            .find(|entry| entry.name == dm_name)
            .cloned())
    }

    /// Encryption registry entry for the LUKS container on `underlying`.
    fn crypttab_for_device(&self, underlying: &str) -> Result<Option<CryptFacts>, Error> {
        for entry in self.crypttab()? {
            if self.resolve(&entry.device)?.as_deref() == Some(underlying) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }
}

/// A snapshot of system facts loaded from YAML. Used to play back a probe
/// without touching the system.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StaticInventory {
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceFacts>,
    #[serde(default)]
    pub raid_arrays: BTreeMap<String, RaidFacts>,
    #[serde(default)]
    pub mounts: Vec<MountFacts>,
    #[serde(default)]
    pub fstab: Vec<MountFacts>,
    #[serde(default)]
    pub crypttab: Vec<CryptFacts>,
    #[serde(default)]
    pub btrfs: BTreeMap<String, BtrfsFacts>,
}

impl StaticInventory {
    pub fn from_yaml(contents: &str) -> Result<Self, BlockgraphError> {
        serde_yaml::from_str(contents).structured(InvalidInputError::ParseInventory)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlockgraphError> {
        let contents = std::fs::read_to_string(path.as_ref()).structured(
            InvalidInputError::LoadInventory {
                path: path.as_ref().display().to_string(),
            },
        )?;
        Self::from_yaml(&contents)
    }
}

impl SystemInventory for StaticInventory {
    fn block_devices(&self) -> Result<&[BlockDeviceFacts], Error> {
        Ok(&self.block_devices)
    }

    fn raid_array(&self, name: &str) -> Result<RaidFacts, Error> {
        self.raid_arrays
            .get(name)
            .cloned()
            .with_context(|| format!("No RAID details recorded for '{name}'"))
    }

    fn luks_uuid(&self, underlying: &str) -> Result<String, Error> {
        let Some(device) = self.block_device(underlying)? else {
            bail!("Unknown block device '{underlying}'");
        };
        if !device.is_luks() {
            bail!("Block device '{underlying}' is not a LUKS container");
        }
        device
            .uuid
            .clone()
            .with_context(|| format!("LUKS container on '{underlying}' has no UUID"))
    }

    fn mounts(&self) -> Result<&[MountFacts], Error> {
        Ok(&self.mounts)
    }

    fn fstab(&self) -> Result<&[MountFacts], Error> {
        Ok(&self.fstab)
    }

    fn crypttab(&self) -> Result<&[CryptFacts], Error> {
        Ok(&self.crypttab)
    }

    fn btrfs(&self, device: &str, _mount_path: &Path) -> Result<BtrfsFacts, Error> {
        self.btrfs
            .get(device)
            .cloned()
            .with_context(|| format!("No btrfs details recorded for '{device}'"))
    }
}

/// Queries the live system. Every answer is cached on first use so that all
/// passes of one probe see the same state.
pub struct LiveInventory {
    runner: Arc<dyn CommandRunner>,
    fstab_path: PathBuf,
    crypttab_path: PathBuf,
    block_devices: OnceCell<Vec<BlockDeviceFacts>>,
    mounts: OnceCell<Vec<MountFacts>>,
    fstab: OnceCell<Vec<MountFacts>>,
    crypttab: OnceCell<Vec<CryptFacts>>,
    raid: Mutex<BTreeMap<String, RaidFacts>>,
    luks: Mutex<BTreeMap<String, String>>,
    btrfs: Mutex<BTreeMap<String, BtrfsFacts>>,
}

impl LiveInventory {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fstab_path: impl Into<PathBuf>,
        crypttab_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            fstab_path: fstab_path.into(),
            crypttab_path: crypttab_path.into(),
            block_devices: OnceCell::new(),
            mounts: OnceCell::new(),
            fstab: OnceCell::new(),
            crypttab: OnceCell::new(),
            raid: Mutex::new(BTreeMap::new()),
            luks: Mutex::new(BTreeMap::new()),
            btrfs: Mutex::new(BTreeMap::new()),
        }
    }

    fn query_block_devices(&self) -> Result<Vec<BlockDeviceFacts>, Error> {
        let mut facts = Vec::new();
        for device in lsblk::list(self.runner.as_ref())? {
            let kind = match device.device_type.as_str() {
                "disk" => BlockKind::Disk,
                "part" => BlockKind::Partition,
                "crypt" => BlockKind::Crypt,
                t if t.starts_with("raid") => BlockKind::Raid,
                other => {
                    trace!("Ignoring block device '{}' of type '{other}'", device.name);
                    continue;
                }
            };

            let parents = match kind {
                BlockKind::Disk => Vec::new(),
                // lsblk reports one parent per line, mdadm knows all of them.
                BlockKind::Raid => mdadm::detail(self.runner.as_ref(), &device.name)?.members,
                BlockKind::Partition | BlockKind::Crypt => {
                    device.parent_kernel_name.iter().cloned().collect()
                }
            };

            facts.push(BlockDeviceFacts {
                start: device.start_bytes().map(ByteCount),
                number: device.partition_number,
                size: ByteCount(device.size),
                kind,
                parents,
                name: device.name,
                fs_type: device.fs_type,
                uuid: device.uuid,
                label: device.label,
            });
        }
        Ok(facts)
    }

    fn read_tab(path: &Path) -> Result<Vec<MountFacts>, Error> {
        if !path.exists() {
            debug!("'{}' does not exist, assuming no entries", path.display());
            return Ok(Vec::new());
        }

        Ok(TabFile::read(path)?
            .entries
            .into_iter()
            .map(|entry| MountFacts {
                device: entry.device.render(),
                path: entry.mount_point,
                fs_type: Some(entry.fs_type),
                options: entry.options,
            })
            .collect())
    }
}

impl SystemInventory for LiveInventory {
    fn block_devices(&self) -> Result<&[BlockDeviceFacts], Error> {
        self.block_devices
            .get_or_try_init(|| self.query_block_devices())
            .map(Vec::as_slice)
    }

    fn raid_array(&self, name: &str) -> Result<RaidFacts, Error> {
        let mut cache = self
            .raid
            .lock()
            .map_err(|_| anyhow::anyhow!("RAID cache lock poisoned"))?;
        if let Some(facts) = cache.get(name) {
            return Ok(facts.clone());
        }

        let detail = mdadm::detail(self.runner.as_ref(), name)?;
        let facts = RaidFacts {
            level: detail
                .level
                .with_context(|| format!("RAID array '{name}' has no supported level"))?,
            uuid: detail.uuid,
        };
        cache.insert(name.into(), facts.clone());
        Ok(facts)
    }

    fn luks_uuid(&self, underlying: &str) -> Result<String, Error> {
        let mut cache = self
            .luks
            .lock()
            .map_err(|_| anyhow::anyhow!("LUKS cache lock poisoned"))?;
        if let Some(uuid) = cache.get(underlying) {
            return Ok(uuid.clone());
        }

        let uuid = cryptsetup::luks_uuid(self.runner.as_ref(), underlying)?;
        cache.insert(underlying.into(), uuid.clone());
        Ok(uuid)
    }

    fn mounts(&self) -> Result<&[MountFacts], Error> {
        self.mounts
            .get_or_try_init(|| Self::read_tab(Path::new(PROC_MOUNTS_PATH)))
            .map(Vec::as_slice)
    }

    fn fstab(&self) -> Result<&[MountFacts], Error> {
        self.fstab
            .get_or_try_init(|| Self::read_tab(&self.fstab_path))
            .map(Vec::as_slice)
    }

    fn crypttab(&self) -> Result<&[CryptFacts], Error> {
        self.crypttab
            .get_or_try_init(|| {
                if !self.crypttab_path.exists() {
                    return Ok(Vec::new());
                }
                Ok::<_, Error>(
                    CryptTab::read(&self.crypttab_path)?
                        .entries
                        .into_iter()
                        .map(|entry| CryptFacts {
                            name: entry.name,
                            device: entry.device.render(),
                            options: entry.options,
                        })
                        .collect(),
                )
            })
            .map(Vec::as_slice)
    }

    fn btrfs(&self, device: &str, mount_path: &Path) -> Result<BtrfsFacts, Error> {
        let mut cache = self
            .btrfs
            .lock()
            .map_err(|_| anyhow::anyhow!("btrfs cache lock poisoned"))?;
        if let Some(facts) = cache.get(device) {
            return Ok(facts.clone());
        }

        let runner = self.runner.as_ref();
        let mut subvolumes = Vec::new();
        for entry in btrfs::list_subvolumes(runner, mount_path)? {
            subvolumes.push(SubvolumeFacts {
                read_only: btrfs::is_read_only(runner, mount_path.join(&entry.path))?,
                id: entry.id,
                parent_id: entry.parent_id,
                path: entry.path,
            });
        }
        let facts = BtrfsFacts {
            default_subvolume: btrfs::get_default(runner, mount_path)?,
            subvolumes,
        };

        cache.insert(device.into(), facts.clone());
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;
    use osutils::testutils::MockRunner;

    const SNAPSHOT: &str = indoc! {r#"
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
            options: [rw, subvol=/@]
        fstab:
          - device: UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4
            path: /
            fs-type: btrfs
            options: [subvol=@]
          - device: LABEL=EFI
            path: /boot/efi
            fs-type: vfat
            options: [umask=0077]
        crypttab:
          - name: cr_root
            device: UUID=c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e
            options: [luks]
        btrfs:
          /dev/mapper/cr_root:
            default-subvolume: 256
            subvolumes:
              - {id: 256, parent-id: 5, path: "@"}
    "#};

    #[test]
    fn test_static_inventory() {
        let inventory = StaticInventory::from_yaml(SNAPSHOT).unwrap();
        assert_eq!(inventory.block_devices().unwrap().len(), 4);

        let part = inventory.block_device("/dev/sda2").unwrap().unwrap();
        assert_eq!(part.start, Some(ByteCount(513 << 20)));
        assert!(part.is_luks());

        assert_eq!(
            inventory.luks_uuid("/dev/sda2").unwrap(),
            "c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e"
        );
        assert!(inventory.luks_uuid("/dev/sda1").is_err());
        assert!(inventory.raid_array("/dev/md0").is_err());

        let btrfs = inventory
            .btrfs("/dev/mapper/cr_root", Path::new("/mnt"))
            .unwrap();
        assert_eq!(btrfs.default_subvolume, 256);
        assert!(!btrfs.subvolumes[0].read_only);
    }

    #[test]
    fn test_keyed_lookups() {
        let inventory = StaticInventory::from_yaml(SNAPSHOT).unwrap();

        assert_eq!(
            inventory
                .resolve("UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4")
                .unwrap()
                .as_deref(),
            Some("/dev/mapper/cr_root")
        );
        assert_eq!(
            inventory
                .resolve("/dev/disk/by-label/EFI")
                .unwrap()
                .as_deref(),
            Some("/dev/sda1")
        );
        assert_eq!(inventory.resolve("LABEL=missing").unwrap(), None);

        let mounts = inventory.mounts_for("/dev/mapper/cr_root").unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].option_value("subvol"), Some("/@"));

        let fstab = inventory.fstab_for("/dev/sda1").unwrap();
        assert_eq!(fstab[0].mount_by(), MountBy::Label);

        let crypt = inventory.crypttab_for_device("/dev/sda2").unwrap().unwrap();
        assert_eq!(crypt.name, "cr_root");
        assert_eq!(crypt.mount_by(), MountBy::Uuid);
        assert_eq!(
            inventory.crypttab_by_name("cr_root").unwrap(),
            Some(crypt)
        );
        assert_eq!(inventory.crypttab_by_name("cr_home").unwrap(), None);
    }

    #[test]
    fn test_invalid_snapshot() {
        let error = StaticInventory::from_yaml("block-devices: [{name: /dev/sda}]").unwrap_err();
        assert_eq!(<&str>::from(error.kind()), "invalid-input");

        let error = StaticInventory::from_yaml("unknown-key: 1").unwrap_err();
        assert_eq!(error.kind().to_string(), "Failed to parse inventory snapshot");

        assert!(StaticInventory::load("/non-existent-snapshot.yaml").is_err());
    }

    #[test]
    fn test_live_inventory_is_cached() {
        let runner = Arc::new(MockRunner::new());
        runner
            .on(
                "lsblk",
                0,
                r#"{"blockdevices": [
                    {"name":"/dev/sda", "type":"disk", "size":1073741824, "start":null, "partn":null, "fstype":null, "uuid":null, "label":null, "pkname":null},
                    {"name":"/dev/sr0", "type":"rom", "size":1024, "start":null, "partn":null, "fstype":null, "uuid":null, "label":null, "pkname":null},
                    {"name":"/dev/sda1", "type":"part", "size":536870912, "start":2048, "partn":1, "fstype":"crypto_LUKS", "uuid":"1234", "label":null, "pkname":"/dev/sda"}
                ]}"#,
            )
            .on("cryptsetup luksUUID", 0, "1234\n");

        let dir = tempfile::tempdir().unwrap();
        let inventory = LiveInventory::new(
            runner.clone(),
            dir.path().join("fstab"),
            dir.path().join("crypttab"),
        );

        let devices = inventory.block_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].kind, BlockKind::Partition);
        assert_eq!(devices[1].start, Some(ByteCount(1 << 20)));
        assert_eq!(devices[1].parents, vec!["/dev/sda"]);

        assert_eq!(inventory.luks_uuid("/dev/sda1").unwrap(), "1234");
        assert_eq!(inventory.luks_uuid("/dev/sda1").unwrap(), "1234");
        inventory.block_devices().unwrap();
        assert!(inventory.fstab().unwrap().is_empty());
        assert!(inventory.crypttab().unwrap().is_empty());

        assert_eq!(
            runner.commands(),
            vec![
                "lsblk --json --bytes --paths --list --output \
                 NAME,TYPE,SIZE,START,PARTN,FSTYPE,UUID,LABEL,PKNAME",
                "cryptsetup luksUUID /dev/sda1",
            ]
        );
    }

    #[test]
    fn test_live_btrfs() {
        let runner = Arc::new(MockRunner::new());
        runner
            .on(
                "btrfs subvolume list",
                0,
                "ID 257 gen 9 parent 256 top level 256 path <FS_TREE>/@/home\n\
                 ID 256 gen 9 parent 5 top level 5 path <FS_TREE>/@\n",
            )
            .on("btrfs subvolume get-default", 0, "ID 256 gen 9 top level 5 path @\n")
            .on("btrfs property get -ts /mnt/@/home", 0, "ro=true\n")
            .on("btrfs property get", 0, "ro=false\n");

        let inventory = LiveInventory::new(runner.clone(), "/missing/fstab", "/missing/crypttab");
        let facts = inventory.btrfs("/dev/sda2", Path::new("/mnt")).unwrap();
        assert_eq!(facts.default_subvolume, 256);
        assert_eq!(
            facts.subvolumes,
            vec![
                SubvolumeFacts {
                    id: 257,
                    parent_id: 256,
                    path: "@/home".into(),
                    read_only: true,
                },
                SubvolumeFacts {
                    id: 256,
                    parent_id: 5,
                    path: "@".into(),
                    read_only: false,
                },
            ]
        );

        inventory.btrfs("/dev/sda2", Path::new("/mnt")).unwrap();
        assert_eq!(runner.commands_matching("btrfs subvolume list").len(), 1);
    }
}
