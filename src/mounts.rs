//! Shared, reference-counted temporary mounts.
//!
//! Some facts (subvolume lists) and some operations (btrfs resize, subvolume
//! creation) need a filesystem to be mounted somewhere. `MountRegistry` hands
//! out `MountLease`s: the first lease for a device mounts it, later leases
//! reuse the same mount, and the mount is released when the last lease is
//! dropped, whichever way the holder exits.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Error};
use log::{debug, trace, warn};
use tempfile::TempDir;

use blockgraph_api::constants::PLAYBACK_MOUNT_POINT;
use osutils::{dependencies::CommandRunner, mount};

/// Where a device got mounted. A temporary directory is removed once the
/// target is dropped.
#[derive(Debug)]
pub struct MountTarget {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl MountTarget {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaves the directory in place. Required while something is still
    /// mounted on it.
    fn keep_dir(self) -> PathBuf {
        match self.dir {
            Some(dir) => dir.keep(),
            None => self.path,
        }
    }
}

/// Performs the actual mount and unmount operations.
pub trait Mounter: Send {
    fn mount(
        &self,
        device: &str,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<MountTarget, Error>;

    fn unmount(&self, target: &MountTarget) -> Result<(), Error>;
}

/// Mounts devices on fresh directories below `mount_dir`.
pub struct SystemMounter {
    runner: Arc<dyn CommandRunner>,
    mount_dir: PathBuf,
}

impl SystemMounter {
    pub fn new(runner: Arc<dyn CommandRunner>, mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_dir: mount_dir.into(),
        }
    }
}

impl Mounter for SystemMounter {
    fn mount(
        &self,
        device: &str,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<MountTarget, Error> {
        std::fs::create_dir_all(&self.mount_dir).with_context(|| {
            format!(
                "Failed to create mount directory '{}'",
                self.mount_dir.display()
            )
        })?;
        let dir = tempfile::tempdir_in(&self.mount_dir)
            .context("Failed to create temporary mount point")?;

        mount::mount(self.runner.as_ref(), device, dir.path(), fs_type, options)?;
        Ok(MountTarget {
            path: dir.path().to_owned(),
            dir: Some(dir),
        })
    }

    fn unmount(&self, target: &MountTarget) -> Result<(), Error> {
        mount::umount(self.runner.as_ref(), target.path())
    }
}

/// Pretends to mount everything at a fixed path. Used when playing back a
/// snapshot, where nothing may touch the system.
#[derive(Debug, Default)]
pub struct PlaybackMounter;

impl Mounter for PlaybackMounter {
    fn mount(&self, device: &str, _: Option<&str>, _: &[String]) -> Result<MountTarget, Error> {
        trace!("Playback mount of '{device}'");
        Ok(MountTarget {
            path: PathBuf::from(PLAYBACK_MOUNT_POINT),
            dir: None,
        })
    }

    fn unmount(&self, _: &MountTarget) -> Result<(), Error> {
        Ok(())
    }
}

struct Entry {
    target: MountTarget,
    refs: usize,
    /// Mounted by someone else. Never unmounted here.
    external: bool,
}

struct Inner {
    mounter: Box<dyn Mounter>,
    entries: BTreeMap<String, Entry>,
}

/// Registry of temporary mounts, keyed by device name. Clones share state.
#[derive(Clone)]
pub struct MountRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MountRegistry {
    pub fn new(mounter: impl Mounter + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                mounter: Box::new(mounter),
                entries: BTreeMap::new(),
            })),
        }
    }

    pub fn playback() -> Self {
        Self::new(PlaybackMounter)
    }

    /// Makes sure `device` is mounted and returns a lease on the mount.
    ///
    /// When `existing` names a place the device is already mounted at, it is
    /// used as is. Blocks until the mount succeeded or failed.
    pub fn ensure_mounted(
        &self,
        device: &str,
        fs_type: Option<&str>,
        options: &[String],
        existing: Option<&Path>,
    ) -> Result<MountLease, Error> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("Mount registry lock poisoned"))?;

        if let Some(entry) = inner.entries.get_mut(device) {
            entry.refs += 1;
            trace!("Reusing mount of '{device}' ({} leases)", entry.refs);
            return Ok(MountLease {
                registry: self.clone(),
                device: device.into(),
                path: entry.target.path().to_owned(),
            });
        }

        let (target, external) = match existing {
            Some(path) => (
                MountTarget {
                    path: path.to_owned(),
                    dir: None,
                },
                true,
            ),
            None => (inner.mounter.mount(device, fs_type, options)?, false),
        };
        debug!("Mounted '{device}' at '{}'", target.path().display());

        let path = target.path().to_owned();
        inner.entries.insert(
            device.into(),
            Entry {
                target,
                refs: 1,
                external,
            },
        );

        Ok(MountLease {
            registry: self.clone(),
            device: device.into(),
            path,
        })
    }

    /// Number of devices currently held mounted.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.len())
            .unwrap_or_default()
    }

    fn release(&self, device: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("Mount registry lock poisoned, leaving '{device}' mounted");
            return;
        };

        let Some(entry) = inner.entries.get_mut(device) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }

        if let Some(entry) = inner.entries.remove(device) {
            if !entry.external {
                if let Err(e) = inner.mounter.unmount(&entry.target) {
                    let path = entry.target.keep_dir();
                    warn!(
                        "Failed to release mount of '{device}', leaving it at '{}': {e:?}",
                        path.display()
                    );
                }
            }
        }
    }
}

/// Keeps a device mounted while alive.
pub struct MountLease {
    registry: MountRegistry,
    device: String,
    path: PathBuf,
}

impl MountLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        self.registry.release(&self.device);
    }
}
