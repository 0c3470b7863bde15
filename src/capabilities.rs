//! Per-kind operations the commit executor invokes on devices.
//!
//! Every device kind has one `DeviceOps` implementation. Operations a kind
//! does not need are left as the default no-op. Attributes only known once a
//! device exists (UUIDs, subvolume ids) are written back to the staged graph.

use std::path::Path;

use anyhow::{bail, ensure, Context, Error};
use log::{debug, info, warn};

use blockgraph_api::{
    constants::{
        BTRFS_SUBVOL_OPTION, BTRFS_TOP_LEVEL_SUBVOLUME_ID, ROOT_MOUNT_POINT_PATH, SECTOR_SIZE,
    },
    primitives::secret::Secret,
    storage_graph::device::{Filesystem, FilesystemType, MountBy},
    Device, DeviceGraph, DeviceKind, DeviceVariant, HolderKind, Sid,
};
use osutils::{
    blkid, btrfs, cryptsetup,
    dependencies::CommandRunner,
    filesystems, mdadm, mkfs, mount, sfdisk,
    snapper::{self, InstallationHelperArgs},
    tabfile::{CryptTabEntry, TabDevice, TabFileEntry},
    udevadm, wipefs,
};

use crate::{
    activation::PassphraseCache,
    config::join_relative,
    executor::CommitCallbacks,
    mounts::{MountLease, MountRegistry},
    registry::{CrypttabRegistry, FstabRegistry},
};

/// The caller declined to provide a passphrase.
#[derive(Debug, thiserror::Error)]
#[error("Passphrase prompt was cancelled")]
pub struct Cancelled;

/// Everything an operation may touch while a plan is executed.
pub struct CommitContext<'a> {
    /// The graph the plan was computed from. Removed devices are looked up
    /// here.
    pub probed: &'a DeviceGraph,
    /// The target graph. Created devices are looked up here and receive
    /// their runtime attributes.
    pub staged: &'a mut DeviceGraph,
    pub runner: &'a dyn CommandRunner,
    pub mounts: &'a MountRegistry,
    pub fstab: &'a mut FstabRegistry,
    pub crypttab: &'a mut CrypttabRegistry,
    pub root_prefix: &'a Path,
    pub max_attempts: u32,
    /// Passphrases remembered by the session, tried before asking.
    pub passphrases: &'a mut PassphraseCache,
    pub callbacks: &'a mut dyn CommitCallbacks,
}

/// Operations on one device kind.
pub trait DeviceOps: Sync {
    fn name(&self) -> &'static str;

    /// Create the device described by the staged graph.
    fn create(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    /// Destroy the device described by the probed graph.
    fn delete(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    /// Resize the device to `size` bytes.
    fn resize(
        &self,
        _ctx: &mut CommitContext,
        _sid: Sid,
        _size: u64,
        _grow: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Apply attribute changes that need neither recreation nor a resize.
    fn modify(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    fn activate(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    fn deactivate(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    fn mount(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    fn unmount(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    /// Add `member` to the running array `sid`.
    fn attach_member(
        &self,
        _ctx: &mut CommitContext,
        _sid: Sid,
        _member: Sid,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Remove `member` from the running array `sid`.
    fn detach_member(
        &self,
        _ctx: &mut CommitContext,
        _sid: Sid,
        _member: Sid,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn add_to_registry(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    fn remove_from_registry(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }

    /// Replace the registry entry of the probed device with the staged one.
    fn rename_in_registry(&self, _ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        Ok(())
    }
}

/// Returns the operations for a device kind.
pub fn ops_for(kind: DeviceKind) -> &'static dyn DeviceOps {
    match kind {
        DeviceKind::Disk => &DiskOps,
        DeviceKind::Partition => &PartitionOps,
        DeviceKind::RaidArray => &RaidOps,
        DeviceKind::EncryptedVolume => &LuksOps,
        DeviceKind::Filesystem => &FilesystemOps,
        DeviceKind::Subvolume => &SubvolumeOps,
        DeviceKind::MountPoint => &MountPointOps,
    }
}

fn variant<T: Clone>(
    graph: &DeviceGraph,
    sid: Sid,
    get: fn(&Device) -> Option<&T>,
    what: &str,
) -> Result<T, Error> {
    let device = graph.device(sid)?;
    get(device)
        .cloned()
        .with_context(|| format!("Expected {what}, found {}", device.describe()))
}

fn block_name(graph: &DeviceGraph, sid: Sid) -> Result<String, Error> {
    let device = graph.device(sid)?;
    device
        .name()
        .with_context(|| format!("{} has no device name", device.describe()))
}

/// Name of the block device a filesystem or encrypted volume sits on.
fn underlying_name(graph: &DeviceGraph, sid: Sid) -> Result<String, Error> {
    let device = graph.device(sid)?;
    let block = graph
        .underlying_block_device(sid)
        .with_context(|| format!("{} has no underlying block device", device.describe()))?;
    block_name(graph, block)
}

fn tab_device(
    mount_by: MountBy,
    device: &str,
    uuid: Option<&str>,
    label: Option<&str>,
) -> Result<TabDevice, Error> {
    Ok(match mount_by {
        MountBy::Device => TabDevice::Path(device.into()),
        MountBy::Uuid => TabDevice::Uuid(
            uuid.with_context(|| format!("'{device}' has no UUID to refer to it by"))?
                .into(),
        ),
        MountBy::Label => TabDevice::Label(
            label
                .with_context(|| format!("'{device}' has no label to refer to it by"))?
                .into(),
        ),
    })
}

/// Mounts the top level of a filesystem somewhere temporary.
fn mount_top_level(
    mounts: &MountRegistry,
    graph: &DeviceGraph,
    fs: Sid,
) -> Result<MountLease, Error> {
    let filesystem = variant(graph, fs, Device::as_filesystem, "a filesystem")?;
    let device = underlying_name(graph, fs)?;
    let options = if filesystem.is_btrfs() {
        vec![format!("{BTRFS_SUBVOL_OPTION}=/")]
    } else {
        Vec::new()
    };
    mounts.ensure_mounted(&device, Some(filesystem.fs_type.name()), &options, None)
}

/// Runs a snapper installation helper step for a filesystem created by this
/// commit with snapshots enabled. Does nothing otherwise.
fn snapper_step(ctx: &CommitContext, fs: Sid, step: u8) -> Result<(), Error> {
    if ctx.probed.contains(fs) {
        return Ok(());
    }
    let filesystem = variant(ctx.staged, fs, Device::as_filesystem, "a filesystem")?;
    let Some(snapshots) = &filesystem.snapshots else {
        return Ok(());
    };

    let device = underlying_name(ctx.staged, fs)?;
    let default_subvolume = ctx
        .staged
        .descendants(fs, false)?
        .into_iter()
        .filter_map(|sid| ctx.staged.find_device(sid)?.as_subvolume())
        .find(|subvolume| subvolume.default)
        .map(|subvolume| subvolume.path.clone())
        .unwrap_or_default();

    snapper::installation_helper_step(
        ctx.runner,
        step,
        &InstallationHelperArgs {
            device: &device,
            root_prefix: ctx.root_prefix,
            config_name: &snapshots.config_name,
            default_subvolume: &default_subvolume,
        },
    )
}

struct DiskOps;

impl DeviceOps for DiskOps {
    fn name(&self) -> &'static str {
        "disk"
    }
}

struct PartitionOps;

impl PartitionOps {
    fn disk(graph: &DeviceGraph, sid: Sid) -> Result<String, Error> {
        let disk = graph
            .parent_via(sid, HolderKind::PartitionOf)
            .with_context(|| format!("Partition {sid} is not on a disk"))?;
        block_name(graph, disk)
    }
}

impl DeviceOps for PartitionOps {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn create(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let partition = variant(ctx.staged, sid, Device::as_partition, "a partition")?;
        let disk = Self::disk(ctx.staged, sid)?;
        sfdisk::create(ctx.runner, &disk, partition.start, partition.size)?;
        udevadm::settle(ctx.runner)
    }

    fn delete(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let partition = variant(ctx.probed, sid, Device::as_partition, "a partition")?;
        let disk = Self::disk(ctx.probed, sid)?;
        sfdisk::delete(ctx.runner, &disk, partition.number)
    }

    fn resize(
        &self,
        ctx: &mut CommitContext,
        sid: Sid,
        size: u64,
        _grow: bool,
    ) -> Result<(), Error> {
        let partition = variant(ctx.staged, sid, Device::as_partition, "a partition")?;
        let disk = Self::disk(ctx.staged, sid)?;
        sfdisk::resize(ctx.runner, &disk, partition.number, size)?;
        udevadm::settle(ctx.runner)
    }
}

struct RaidOps;

impl RaidOps {
    fn members(graph: &DeviceGraph, sid: Sid) -> Result<Vec<String>, Error> {
        graph
            .in_holders(sid)
            .into_iter()
            .filter(|key| key.kind == HolderKind::MemberOf)
            .map(|key| block_name(graph, key.source))
            .collect()
    }
}

impl DeviceOps for RaidOps {
    fn name(&self) -> &'static str {
        "RAID array"
    }

    fn create(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let array = variant(ctx.staged, sid, Device::as_raid_array, "a RAID array")?;
        let members = Self::members(ctx.staged, sid)?;
        mdadm::create(ctx.runner, &array.name, array.level, &members)?;

        let detail = mdadm::detail(ctx.runner, &array.name)?;
        if let DeviceVariant::RaidArray(array) = &mut ctx.staged.device_mut(sid)?.variant {
            array.uuid = detail.uuid;
        }
        Ok(())
    }

    fn delete(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        for member in Self::members(ctx.probed, sid)? {
            mdadm::zero_superblock(ctx.runner, &member)?;
        }
        Ok(())
    }

    fn activate(&self, ctx: &mut CommitContext, _sid: Sid) -> Result<(), Error> {
        mdadm::assemble_scan(ctx.runner)
    }

    fn deactivate(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        mdadm::stop(ctx.runner, block_name(ctx.probed, sid)?)
    }

    fn attach_member(&self, ctx: &mut CommitContext, sid: Sid, member: Sid) -> Result<(), Error> {
        mdadm::add(
            ctx.runner,
            block_name(ctx.staged, sid)?,
            block_name(ctx.staged, member)?,
        )
    }

    fn detach_member(&self, ctx: &mut CommitContext, sid: Sid, member: Sid) -> Result<(), Error> {
        mdadm::remove(
            ctx.runner,
            block_name(ctx.probed, sid)?,
            block_name(ctx.probed, member)?,
        )
    }
}

struct LuksOps;

impl LuksOps {
    /// Opens a container, with the given passphrase, with the one the
    /// session remembers, or by asking the caller.
    fn open(
        ctx: &mut CommitContext,
        device: &str,
        dm_name: &str,
        uuid: &str,
        passphrase: Option<Secret>,
    ) -> Result<(), Error> {
        if let Some(passphrase) = passphrase {
            ensure!(
                cryptsetup::open(ctx.runner, device, dm_name, &passphrase)?,
                "Passphrase for '{device}' was rejected"
            );
            return udevadm::settle(ctx.runner);
        }

        if let Some(passphrase) = ctx.passphrases.get(uuid) {
            if cryptsetup::open(ctx.runner, device, dm_name, passphrase)? {
                return udevadm::settle(ctx.runner);
            }
            debug!("Remembered passphrase for '{device}' was rejected");
            ctx.passphrases.forget(uuid);
        }

        let attempts = ctx.max_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(passphrase) = ctx.callbacks.passphrase(uuid, attempt) else {
                return Err(Cancelled.into());
            };
            if cryptsetup::open(ctx.runner, device, dm_name, &passphrase)? {
                ctx.passphrases.accepted(uuid, passphrase);
                return udevadm::settle(ctx.runner);
            }
            warn!("Wrong passphrase for '{device}' (attempt {attempt} of {attempts})");
        }
        bail!("No valid passphrase for '{device}' after {attempts} attempts")
    }

    fn crypttab_entry(graph: &DeviceGraph, sid: Sid) -> Result<CryptTabEntry, Error> {
        let luks = variant(graph, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        let device = underlying_name(graph, sid)?;
        Ok(CryptTabEntry {
            options: luks.crypt_options.clone(),
            ..CryptTabEntry::new(
                &luks.dm_name,
                tab_device(luks.mount_by, &device, luks.uuid.as_deref(), None)?,
            )
        })
    }
}

impl DeviceOps for LuksOps {
    fn name(&self) -> &'static str {
        "encrypted volume"
    }

    fn create(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let luks = variant(ctx.staged, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        let device = underlying_name(ctx.staged, sid)?;
        let passphrase = luks
            .passphrase
            .clone()
            .with_context(|| format!("No passphrase given for '{}'", luks.name()))?;

        cryptsetup::luks_format(ctx.runner, &device, &passphrase)?;
        let uuid = cryptsetup::luks_uuid(ctx.runner, &device)?;
        if let Some(luks) = ctx.staged.device_mut(sid)?.as_encrypted_volume_mut() {
            luks.uuid = Some(uuid.clone());
        }

        if luks.active {
            Self::open(ctx, &device, &luks.dm_name, &uuid, Some(passphrase))?;
        }
        Ok(())
    }

    fn delete(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        wipefs::all(ctx.runner, underlying_name(ctx.probed, sid)?)
    }

    fn resize(
        &self,
        ctx: &mut CommitContext,
        sid: Sid,
        size: u64,
        grow: bool,
    ) -> Result<(), Error> {
        let luks = variant(ctx.staged, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        // Growing fills the underlying device.
        let sectors = (!grow).then_some(size / SECTOR_SIZE);
        cryptsetup::resize(ctx.runner, &luks.dm_name, sectors)
    }

    fn activate(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let luks = variant(ctx.staged, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        let device = underlying_name(ctx.staged, sid)?;
        let uuid = match &luks.uuid {
            Some(uuid) => uuid.clone(),
            None => cryptsetup::luks_uuid(ctx.runner, &device)?,
        };
        info!("Activating '{device}' as '{}'", luks.dm_name);
        Self::open(ctx, &device, &luks.dm_name, &uuid, luks.passphrase.clone())
    }

    fn deactivate(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let luks = variant(ctx.probed, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        cryptsetup::close(ctx.runner, &luks.dm_name)
    }

    fn add_to_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let entry = Self::crypttab_entry(ctx.staged, sid)?;
        ctx.crypttab.add(entry)
    }

    fn remove_from_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let luks = variant(ctx.probed, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        ctx.crypttab.remove(&luks.dm_name).map(|_| ())
    }

    fn rename_in_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let old = variant(ctx.probed, sid, Device::as_encrypted_volume, "an encrypted volume")?;
        let entry = Self::crypttab_entry(ctx.staged, sid)?;
        ctx.crypttab.rename(&old.dm_name, entry)
    }
}

struct FilesystemOps;

impl DeviceOps for FilesystemOps {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn create(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let filesystem = variant(ctx.staged, sid, Device::as_filesystem, "a filesystem")?;
        let device = underlying_name(ctx.staged, sid)?;
        mkfs::run(ctx.runner, &device, filesystem.fs_type, filesystem.label.as_deref())?;

        let uuid = blkid::get_uuid(ctx.runner, &device)?;
        if let Some(filesystem) = ctx.staged.device_mut(sid)?.as_filesystem_mut() {
            filesystem.uuid = Some(uuid);
        }

        snapper_step(ctx, sid, 1)
    }

    fn delete(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        wipefs::all(ctx.runner, underlying_name(ctx.probed, sid)?)
    }

    fn resize(
        &self,
        ctx: &mut CommitContext,
        sid: Sid,
        size: u64,
        grow: bool,
    ) -> Result<(), Error> {
        let filesystem = variant(ctx.staged, sid, Device::as_filesystem, "a filesystem")?;
        let device = underlying_name(ctx.staged, sid)?;
        let target = (!grow).then_some(size);

        match filesystem.fs_type {
            FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4 => {
                filesystems::resize2fs(ctx.runner, &device, target)
            }
            FilesystemType::Btrfs => {
                let lease = mount_top_level(ctx.mounts, ctx.staged, sid)?;
                btrfs::resize(ctx.runner, lease.path(), target)
            }
            FilesystemType::Xfs if grow => {
                let lease = mount_top_level(ctx.mounts, ctx.staged, sid)?;
                filesystems::xfs_growfs(ctx.runner, lease.path())
            }
            fs_type => bail!("Resizing {fs_type} filesystems is not supported"),
        }
    }

    fn modify(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let old = variant(ctx.probed, sid, Device::as_filesystem, "a filesystem")?;
        let new = variant(ctx.staged, sid, Device::as_filesystem, "a filesystem")?;
        if old.label == new.label {
            return Ok(());
        }

        let device = underlying_name(ctx.staged, sid)?;
        debug!("Relabeling '{device}' to {:?}", new.label);
        filesystems::set_label(
            ctx.runner,
            &device,
            new.fs_type,
            new.label.as_deref().unwrap_or_default(),
        )
    }
}

struct SubvolumeOps;

impl SubvolumeOps {
    fn filesystem(graph: &DeviceGraph, sid: Sid) -> Result<Sid, Error> {
        graph
            .filesystem_of(sid)
            .with_context(|| format!("Subvolume {sid} is not part of a filesystem"))
    }
}

impl DeviceOps for SubvolumeOps {
    fn name(&self) -> &'static str {
        "subvolume"
    }

    fn create(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let subvolume = variant(ctx.staged, sid, Device::as_subvolume, "a subvolume")?;
        if subvolume.is_top_level() {
            // Created along with the filesystem.
            return Ok(());
        }

        let fs = Self::filesystem(ctx.staged, sid)?;
        let lease = mount_top_level(ctx.mounts, ctx.staged, fs)?;
        let path = lease.path().join(&subvolume.path);
        btrfs::create_subvolume(ctx.runner, &path)?;

        let id = btrfs::list_subvolumes(ctx.runner, lease.path())?
            .into_iter()
            .find(|entry| entry.path == subvolume.path)
            .map(|entry| entry.id)
            .with_context(|| format!("Created subvolume '{}' is not listed", subvolume.path))?;
        if let Some(subvolume) = ctx.staged.device_mut(sid)?.as_subvolume_mut() {
            subvolume.id = Some(id);
        }

        if subvolume.read_only {
            btrfs::set_read_only(ctx.runner, &path, true)?;
        }
        if subvolume.default {
            btrfs::set_default(ctx.runner, id, lease.path())?;
        }
        Ok(())
    }

    fn delete(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let subvolume = variant(ctx.probed, sid, Device::as_subvolume, "a subvolume")?;
        if subvolume.is_top_level() {
            return Ok(());
        }

        let fs = Self::filesystem(ctx.probed, sid)?;
        let lease = mount_top_level(ctx.mounts, ctx.probed, fs)?;
        btrfs::delete_subvolume(ctx.runner, lease.path().join(&subvolume.path))
    }

    fn modify(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let old = variant(ctx.probed, sid, Device::as_subvolume, "a subvolume")?;
        let new = variant(ctx.staged, sid, Device::as_subvolume, "a subvolume")?;
        let fs = Self::filesystem(ctx.staged, sid)?;
        let lease = mount_top_level(ctx.mounts, ctx.staged, fs)?;

        if old.read_only != new.read_only {
            btrfs::set_read_only(ctx.runner, lease.path().join(&new.path), new.read_only)?;
        }

        if new.default && !old.default {
            let id = if new.is_top_level() {
                BTRFS_TOP_LEVEL_SUBVOLUME_ID
            } else {
                new.id
                    .or(old.id)
                    .with_context(|| format!("Subvolume '{}' has no id", new.path))?
            };
            btrfs::set_default(ctx.runner, id, lease.path())?;
        } else if old.default && !new.default {
            let other_default = ctx
                .staged
                .descendants(fs, false)?
                .into_iter()
                .filter(|other| *other != sid)
                .filter_map(|other| ctx.staged.find_device(other)?.as_subvolume())
                .any(|subvolume| subvolume.default);
            // Whichever subvolume becomes the default sets it itself.
            if !other_default {
                btrfs::reset_default(ctx.runner, lease.path())?;
            }
        }
        Ok(())
    }
}

/// What is needed to mount a filesystem or one of its subvolumes.
struct MountSource {
    filesystem: Sid,
    fs: Filesystem,
    device: String,
    options: Vec<String>,
}

impl MountSource {
    fn of(graph: &DeviceGraph, mount_point: Sid) -> Result<Self, Error> {
        let parent = graph
            .parent_via(mount_point, HolderKind::MountedAt)
            .with_context(|| format!("Mount point {mount_point} is not attached to anything"))?;

        let (filesystem, options) = match &graph.device(parent)?.variant {
            DeviceVariant::Filesystem(_) => (parent, Vec::new()),
            DeviceVariant::Subvolume(subvolume) => (
                SubvolumeOps::filesystem(graph, parent)?,
                vec![format!("{BTRFS_SUBVOL_OPTION}=/{}", subvolume.path)],
            ),
            _ => bail!("{} cannot be mounted", graph.device(parent)?.describe()),
        };

        Ok(Self {
            filesystem,
            fs: variant(graph, filesystem, Device::as_filesystem, "a filesystem")?,
            device: underlying_name(graph, filesystem)?,
            options,
        })
    }

    fn fstab_entry(self, graph: &DeviceGraph, mount_point: Sid) -> Result<TabFileEntry, Error> {
        let mp = variant(graph, mount_point, Device::as_mount_point, "a mount point")?;
        let device = tab_device(
            mp.mount_by,
            &self.device,
            self.fs.uuid.as_deref(),
            self.fs.label.as_deref(),
        )?;
        let mut options = self.options;
        options.extend(mp.options.iter().cloned());
        Ok(TabFileEntry::new(device, &mp.path, self.fs.fs_type.name()).with_options(options))
    }
}

/// The fstab entry a mount point of `graph` is registered with.
pub(crate) fn fstab_entry(graph: &DeviceGraph, mount_point: Sid) -> Result<TabFileEntry, Error> {
    MountSource::of(graph, mount_point)?.fstab_entry(graph, mount_point)
}

struct MountPointOps;

fn is_root(path: &Path) -> bool {
    path == Path::new(ROOT_MOUNT_POINT_PATH)
}

impl DeviceOps for MountPointOps {
    fn name(&self) -> &'static str {
        "mount point"
    }

    fn mount(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let mp = variant(ctx.staged, sid, Device::as_mount_point, "a mount point")?;
        let source = MountSource::of(ctx.staged, sid)?;
        ensure!(
            source.fs.fs_type.is_mountable(),
            "{} filesystems cannot be mounted",
            source.fs.fs_type
        );

        let target = join_relative(ctx.root_prefix, &mp.path);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create mount point '{}'", target.display()))?;

        if is_root(&mp.path) {
            snapper_step(ctx, source.filesystem, 2)?;
        }
        let mut options = source.options;
        options.extend(mp.options.iter().cloned());
        mount::mount(
            ctx.runner,
            &source.device,
            &target,
            Some(source.fs.fs_type.name()),
            &options,
        )?;
        if is_root(&mp.path) {
            snapper_step(ctx, source.filesystem, 3)?;
        }
        Ok(())
    }

    fn unmount(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let mp = variant(ctx.probed, sid, Device::as_mount_point, "a mount point")?;
        mount::umount(ctx.runner, join_relative(ctx.root_prefix, &mp.path))
    }

    fn add_to_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let source = MountSource::of(ctx.staged, sid)?;
        let filesystem = source.filesystem;
        let entry = source.fstab_entry(ctx.staged, sid)?;
        let root = is_root(&entry.mount_point);
        ctx.fstab.add(entry)?;

        if root {
            snapper_step(ctx, filesystem, 4)?;
        }
        Ok(())
    }

    fn remove_from_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let mp = variant(ctx.probed, sid, Device::as_mount_point, "a mount point")?;
        ctx.fstab
            .remove(&mp.path.to_string_lossy())
            .map(|_| ())
    }

    fn rename_in_registry(&self, ctx: &mut CommitContext, sid: Sid) -> Result<(), Error> {
        let old = variant(ctx.probed, sid, Device::as_mount_point, "a mount point")?;
        let entry = fstab_entry(ctx.staged, sid)?;
        ctx.fstab.rename(&old.path.to_string_lossy(), entry)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::path::PathBuf;

    use blockgraph_api::{
        constants::{MIB, PLAYBACK_MOUNT_POINT},
        storage_graph::device::{
            Disk, EncryptedVolume, MountPoint, Partition, SnapshotConfig, Subvolume,
        },
    };
    use osutils::testutils::MockRunner;

    use crate::activation::PassphrasePolicy;

    /// Answers passphrase prompts from a list; an exhausted list cancels.
    #[derive(Default)]
    pub(crate) struct ScriptedCallbacks {
        pub passphrases: Vec<&'static str>,
        pub asked: Vec<(String, u32)>,
    }

    impl CommitCallbacks for ScriptedCallbacks {
        fn passphrase(&mut self, uuid: &str, attempt: u32) -> Option<Secret> {
            self.asked.push((uuid.into(), attempt));
            if self.passphrases.is_empty() {
                None
            } else {
                Some(self.passphrases.remove(0).into())
            }
        }
    }

    /// State shared by the operations under test.
    struct Harness {
        runner: MockRunner,
        mounts: MountRegistry,
        fstab: FstabRegistry,
        crypttab: CrypttabRegistry,
        callbacks: ScriptedCallbacks,
        max_attempts: u32,
        passphrases: PassphraseCache,
        root: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            Self {
                runner: MockRunner::new(),
                mounts: MountRegistry::playback(),
                fstab: FstabRegistry::load(root.path().join("etc/fstab")).unwrap(),
                crypttab: CrypttabRegistry::load(root.path().join("etc/crypttab")).unwrap(),
                callbacks: ScriptedCallbacks::default(),
                max_attempts: 2,
                passphrases: PassphraseCache::default(),
                root,
            }
        }

        fn run(
            &mut self,
            probed: &DeviceGraph,
            staged: &mut DeviceGraph,
            op: impl FnOnce(&mut CommitContext) -> Result<(), Error>,
        ) -> Result<(), Error> {
            let root = self.root.path().to_owned();
            let mut ctx = CommitContext {
                probed,
                staged,
                runner: &self.runner,
                mounts: &self.mounts,
                fstab: &mut self.fstab,
                crypttab: &mut self.crypttab,
                root_prefix: &root,
                max_attempts: self.max_attempts,
                passphrases: &mut self.passphrases,
                callbacks: &mut self.callbacks,
            };
            op(&mut ctx)
        }
    }

    fn disk_with_partition(graph: &mut DeviceGraph) -> (Sid, Sid) {
        let disk = graph.add_device(Disk {
            name: "/dev/sda".into(),
            size: 1024 * MIB,
        });
        let part = graph.add_device(Partition::new("/dev/sda2", 2, MIB, 512 * MIB));
        graph.add_holder(disk, part, HolderKind::PartitionOf).unwrap();
        (disk, part)
    }

    #[test]
    fn test_partition_create_and_resize() {
        let mut h = Harness::new();
        let probed = DeviceGraph::new();
        let mut staged = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut staged);

        h.run(&probed, &mut staged, |ctx| ops_for(DeviceKind::Partition).create(ctx, part))
            .unwrap();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::Partition).resize(ctx, part, 256 * MIB, false)
        })
        .unwrap();

        let calls = h.runner.calls();
        assert_eq!(
            h.runner.commands(),
            vec![
                "sfdisk --append /dev/sda",
                "udevadm settle",
                "sfdisk -N 2 /dev/sda",
                "udevadm settle"
            ]
        );
        assert_eq!(calls[0].stdin.as_deref(), Some("start=2048, size=1048576\n"));
        assert_eq!(calls[2].stdin.as_deref(), Some(", 524288\n"));
    }

    #[test]
    fn test_luks_create_writes_back_uuid() {
        let mut h = Harness::new();
        h.runner.on("cryptsetup luksUUID", 0, "7f3a-01\n");
        let probed = DeviceGraph::new();
        let mut staged = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut staged);
        let luks = staged.add_device(EncryptedVolume {
            passphrase: Some("hunter2".into()),
            in_crypttab: true,
            mount_by: MountBy::Uuid,
            ..EncryptedVolume::new("cr_data", 496 * MIB)
        });
        staged.add_holder(part, luks, HolderKind::Encrypts).unwrap();

        h.run(&probed, &mut staged, |ctx| ops_for(DeviceKind::EncryptedVolume).create(ctx, luks))
            .unwrap();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).add_to_registry(ctx, luks)
        })
        .unwrap();

        assert_eq!(
            staged
                .device(luks)
                .unwrap()
                .as_encrypted_volume()
                .unwrap()
                .uuid
                .as_deref(),
            Some("7f3a-01")
        );
        let commands = h.runner.commands();
        assert_eq!(commands[1], "cryptsetup luksUUID /dev/sda2");
        assert_eq!(
            commands[2],
            "cryptsetup luksOpen --key-file - /dev/sda2 cr_data"
        );
        assert!(h.callbacks.asked.is_empty());
        assert_eq!(
            h.crypttab.find("cr_data").unwrap().device,
            TabDevice::Uuid("7f3a-01".into())
        );
    }

    #[test]
    fn test_luks_activate_asks_until_cancelled() {
        let mut h = Harness::new();
        h.runner.once("cryptsetup luksOpen", 2, "");
        let mut staged = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut staged);
        let luks = staged.add_device(EncryptedVolume {
            uuid: Some("7f3a-01".into()),
            ..EncryptedVolume::new("cr_data", 496 * MIB)
        });
        staged.add_holder(part, luks, HolderKind::Encrypts).unwrap();
        let probed = staged.clone();

        h.callbacks.passphrases = vec!["wrong"];
        let error = h
            .run(&probed, &mut staged, |ctx| {
                ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
            })
            .unwrap_err();
        assert!(error.downcast_ref::<Cancelled>().is_some());
        assert_eq!(
            h.callbacks.asked,
            vec![("7f3a-01".to_owned(), 1), ("7f3a-01".to_owned(), 2)]
        );

        h.callbacks.passphrases = vec!["right"];
        h.runner.clear();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        assert_eq!(
            h.runner.commands(),
            vec![
                "cryptsetup luksOpen --key-file - /dev/sda2 cr_data",
                "udevadm settle"
            ]
        );
    }

    fn inactive_luks(staged: &mut DeviceGraph) -> Sid {
        let (_, part) = disk_with_partition(staged);
        let luks = staged.add_device(EncryptedVolume {
            uuid: Some("7f3a-01".into()),
            ..EncryptedVolume::new("cr_data", 496 * MIB)
        });
        staged.add_holder(part, luks, HolderKind::Encrypts).unwrap();
        luks
    }

    #[test]
    fn test_luks_activate_with_zero_attempts_asks_once() {
        let mut h = Harness::new();
        h.max_attempts = 0;
        h.runner.on("cryptsetup luksOpen", 2, "");
        let mut staged = DeviceGraph::new();
        let luks = inactive_luks(&mut staged);
        let probed = staged.clone();

        h.callbacks.passphrases = vec!["wrong", "unused"];
        let error = h
            .run(&probed, &mut staged, |ctx| {
                ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
            })
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "No valid passphrase for '/dev/sda2' after 1 attempts"
        );
        assert_eq!(h.callbacks.asked, vec![("7f3a-01".to_owned(), 1)]);
    }

    #[test]
    fn test_luks_activate_follows_passphrase_policy() {
        let mut h = Harness::new();
        h.passphrases = PassphraseCache::new(PassphrasePolicy::RememberForSession);
        let mut staged = DeviceGraph::new();
        let luks = inactive_luks(&mut staged);
        let probed = staged.clone();

        h.callbacks.passphrases = vec!["right"];
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        assert_eq!(h.callbacks.asked.len(), 1);
        let opens = h.runner.calls();
        let opens = opens
            .iter()
            .filter(|call| call.command.starts_with("cryptsetup luksOpen"))
            .collect::<Vec<_>>();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].stdin.as_deref(), Some("right"));

        // A rejected remembered passphrase is dropped and the caller asked.
        h.runner.once("cryptsetup luksOpen", 2, "");
        h.callbacks.passphrases = vec!["rotated"];
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        assert_eq!(h.callbacks.asked.len(), 2);
        assert_eq!(h.passphrases.get("7f3a-01").map(Secret::expose), Some("rotated"));

        let mut h = Harness::new();
        h.callbacks.passphrases = vec!["right", "right"];
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::EncryptedVolume).activate(ctx, luks)
        })
        .unwrap();
        assert_eq!(h.callbacks.asked.len(), 2);
        assert!(h.passphrases.get("7f3a-01").is_none());
    }

    /// A new btrfs root filesystem with snapshots and an `@` subvolume
    /// mounted at `/`.
    fn btrfs_root(graph: &mut DeviceGraph) -> (Sid, Sid, Sid) {
        let (_, part) = disk_with_partition(graph);
        let fs = graph.add_device(Filesystem {
            label: Some("root".into()),
            snapshots: Some(SnapshotConfig::default()),
            ..Filesystem::new(FilesystemType::Btrfs)
        });
        graph.add_holder(part, fs, HolderKind::FormattedAs).unwrap();
        let top_level = graph.add_device(Subvolume::top_level());
        graph.add_holder(fs, top_level, HolderKind::SubvolumeOf).unwrap();
        let subvolume = graph.add_device(Subvolume {
            default: true,
            ..Subvolume::new("@")
        });
        graph
            .add_holder(top_level, subvolume, HolderKind::SubvolumeOf)
            .unwrap();
        let mp = graph.add_device(MountPoint::new("/"));
        graph.add_holder(subvolume, mp, HolderKind::MountedAt).unwrap();
        (fs, subvolume, mp)
    }

    #[test]
    fn test_btrfs_root_with_snapshots() {
        let mut h = Harness::new();
        h.runner
            .on("blkid", 0, "0a1b-2c3d\n")
            .on(
                "btrfs subvolume list",
                0,
                "ID 256 gen 7 parent 5 top level 5 path <FS_TREE>/@\n",
            );
        let probed = DeviceGraph::new();
        let mut staged = DeviceGraph::new();
        let (fs, subvolume, mp) = btrfs_root(&mut staged);

        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::Filesystem).create(ctx, fs)?;
            ops_for(DeviceKind::Subvolume).create(ctx, subvolume)?;
            ops_for(DeviceKind::MountPoint).mount(ctx, mp)?;
            ops_for(DeviceKind::MountPoint).add_to_registry(ctx, mp)
        })
        .unwrap();

        assert_eq!(
            staged.device(subvolume).unwrap().as_subvolume().unwrap().id,
            Some(256)
        );
        let root = h.root.path().display().to_string();
        let helper = |step: &str| {
            format!(
                "installation-helper --step {step} --root-prefix {root} --config-name root \
                 --default-subvolume-name @"
            )
        };
        assert_eq!(
            h.runner.commands(),
            vec![
                "mkfs.btrfs --force --label root /dev/sda2".to_owned(),
                "blkid -o value -s UUID /dev/sda2".into(),
                "installation-helper --step 1 --device /dev/sda2 --root-prefix ".to_owned()
                    + &root
                    + " --config-name root --default-subvolume-name @",
                format!("btrfs subvolume create {PLAYBACK_MOUNT_POINT}/@"),
                format!("btrfs subvolume list -a -p {PLAYBACK_MOUNT_POINT}"),
                format!("btrfs subvolume set-default 256 {PLAYBACK_MOUNT_POINT}"),
                "installation-helper --step 2 --device /dev/sda2 --root-prefix ".to_owned()
                    + &root
                    + " --config-name root --default-subvolume-name @",
                format!("mount -o subvol=/@ -t btrfs /dev/sda2 {root}/"),
                helper("3"),
                helper("4"),
            ]
        );

        let entry = h.fstab.find("/").unwrap();
        assert_eq!(entry.device, TabDevice::Uuid("0a1b-2c3d".into()));
        assert_eq!(entry.options, vec!["subvol=/@"]);
    }

    #[test]
    fn test_existing_filesystem_skips_snapper() {
        let mut h = Harness::new();
        let mut staged = DeviceGraph::new();
        let (_, _, mp) = btrfs_root(&mut staged);
        let probed = staged.clone();

        h.run(&probed, &mut staged, |ctx| ops_for(DeviceKind::MountPoint).mount(ctx, mp))
            .unwrap();
        assert_eq!(
            h.runner.commands(),
            vec![format!(
                "mount -o subvol=/@ -t btrfs /dev/sda2 {}/",
                h.root.path().display()
            )]
        );
    }

    #[test]
    fn test_filesystem_resize() {
        let mut h = Harness::new();
        let mut staged = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut staged);
        let ext4 = staged.add_device(Filesystem::new(FilesystemType::Ext4));
        staged.add_holder(part, ext4, HolderKind::FormattedAs).unwrap();
        let probed = staged.clone();

        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::Filesystem).resize(ctx, ext4, 256 * MIB, false)
        })
        .unwrap();
        assert_eq!(h.runner.commands(), vec!["resize2fs /dev/sda2 262144K"]);

        let mut staged = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut staged);
        let vfat = staged.add_device(Filesystem::new(FilesystemType::Vfat));
        staged.add_holder(part, vfat, HolderKind::FormattedAs).unwrap();
        let probed = staged.clone();
        assert!(h
            .run(&probed, &mut staged, |ctx| {
                ops_for(DeviceKind::Filesystem).resize(ctx, vfat, 256 * MIB, true)
            })
            .is_err());
    }

    #[test]
    fn test_mount_point_rename_in_registry() {
        let mut h = Harness::new();
        let mut probed = DeviceGraph::new();
        let (_, part) = disk_with_partition(&mut probed);
        let fs = probed.add_device(Filesystem {
            label: Some("data".into()),
            ..Filesystem::new(FilesystemType::Ext4)
        });
        probed.add_holder(part, fs, HolderKind::FormattedAs).unwrap();
        let mp = probed.add_device(MountPoint {
            mount_by: MountBy::Label,
            ..MountPoint::new("/data")
        });
        probed.add_holder(fs, mp, HolderKind::MountedAt).unwrap();

        let mut staged = probed.clone();
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::MountPoint).add_to_registry(ctx, mp)
        })
        .unwrap();

        if let Some(mp) = staged.device_mut(mp).unwrap().as_mount_point_mut() {
            mp.path = PathBuf::from("/srv");
            mp.mount_by = MountBy::Device;
        }
        h.run(&probed, &mut staged, |ctx| {
            ops_for(DeviceKind::MountPoint).rename_in_registry(ctx, mp)
        })
        .unwrap();

        assert!(h.fstab.find("/data").is_none());
        assert_eq!(
            h.fstab.find("/srv").unwrap().device,
            TabDevice::Path("/dev/sda2".into())
        );
        assert!(h.runner.commands().is_empty());
    }
}
