//! Persistent registries the commit keeps in sync with the device graph:
//! the mount table (`/etc/fstab`) and the encryption table (`/etc/crypttab`).
//!
//! Changes are kept in memory until `flush()` writes the file back.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

use anyhow::{bail, Error};
use log::{debug, trace};

use blockgraph_api::error::{BlockgraphError, InvalidInputError, ReportError};
use osutils::tabfile::{CryptTab, CryptTabEntry, TabDevice, TabFile, TabFileEntry};

/// A line-oriented table file whose entries are identified by a key.
pub trait RegistryFile: Default + Debug {
    type Entry: Clone + Debug;

    fn read(path: &Path) -> Result<Self, Error>;

    fn write(&self, path: &Path) -> Result<(), Error>;

    fn entries(&self) -> &[Self::Entry];

    fn entries_mut(&mut self) -> &mut Vec<Self::Entry>;

    /// Unique key of an entry.
    fn key(entry: &Self::Entry) -> String;

    fn device(entry: &Self::Entry) -> &TabDevice;
}

impl RegistryFile for TabFile {
    type Entry = TabFileEntry;

    fn read(path: &Path) -> Result<Self, Error> {
        TabFile::read(path)
    }

    fn write(&self, path: &Path) -> Result<(), Error> {
        TabFile::write(self, path)
    }

    fn entries(&self) -> &[Self::Entry] {
        &self.entries
    }

    fn entries_mut(&mut self) -> &mut Vec<Self::Entry> {
        &mut self.entries
    }

    fn key(entry: &Self::Entry) -> String {
        entry.mount_point.to_string_lossy().into_owned()
    }

    fn device(entry: &Self::Entry) -> &TabDevice {
        &entry.device
    }
}

impl RegistryFile for CryptTab {
    type Entry = CryptTabEntry;

    fn read(path: &Path) -> Result<Self, Error> {
        CryptTab::read(path)
    }

    fn write(&self, path: &Path) -> Result<(), Error> {
        CryptTab::write(self, path)
    }

    fn entries(&self) -> &[Self::Entry] {
        &self.entries
    }

    fn entries_mut(&mut self) -> &mut Vec<Self::Entry> {
        &mut self.entries
    }

    fn key(entry: &Self::Entry) -> String {
        entry.name.clone()
    }

    fn device(entry: &Self::Entry) -> &TabDevice {
        &entry.device
    }
}

/// In-memory copy of a registry file with write-through on `flush()`.
#[derive(Debug)]
pub struct Registry<F: RegistryFile> {
    path: PathBuf,
    file: F,
    dirty: bool,
}

/// Mount table, keyed by mount point path.
pub type FstabRegistry = Registry<TabFile>;

/// Encryption table, keyed by device-mapper name.
pub type CrypttabRegistry = Registry<CryptTab>;

impl<F: RegistryFile> Registry<F> {
    /// Reads the registry at `path`. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BlockgraphError> {
        let path = path.into();
        let file = if path.exists() {
            F::read(&path).structured(InvalidInputError::ReadRegistry {
                path: path.display().to_string(),
            })?
        } else {
            debug!("Registry '{}' does not exist yet", path.display());
            F::default()
        };

        Ok(Self {
            path,
            file,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[F::Entry] {
        self.file.entries()
    }

    pub fn find(&self, key: &str) -> Option<&F::Entry> {
        self.entries().iter().find(|entry| F::key(entry) == key)
    }

    pub fn find_by_device(&self, device: &TabDevice) -> Option<&F::Entry> {
        self.entries().iter().find(|entry| F::device(entry) == device)
    }

    pub fn add(&mut self, entry: F::Entry) -> Result<(), Error> {
        let key = F::key(&entry);
        if self.find(&key).is_some() {
            bail!("'{}' already has an entry for '{key}'", self.path.display());
        }

        trace!("Adding '{key}' to '{}'", self.path.display());
        self.file.entries_mut().push(entry);
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<F::Entry, Error> {
        let Some(index) = self.position(key) else {
            bail!("'{}' has no entry for '{key}'", self.path.display());
        };

        trace!("Removing '{key}' from '{}'", self.path.display());
        self.dirty = true;
        Ok(self.file.entries_mut().remove(index))
    }

    /// Replaces the entry `old_key` in place. The new entry may use another
    /// key, as long as no other entry has it.
    pub fn rename(&mut self, old_key: &str, entry: F::Entry) -> Result<(), Error> {
        let new_key = F::key(&entry);
        let Some(index) = self.position(old_key) else {
            bail!("'{}' has no entry for '{old_key}'", self.path.display());
        };
        if new_key != old_key && self.find(&new_key).is_some() {
            bail!("'{}' already has an entry for '{new_key}'", self.path.display());
        }

        trace!(
            "Renaming '{old_key}' to '{new_key}' in '{}'",
            self.path.display()
        );
        self.file.entries_mut()[index] = entry;
        self.dirty = true;
        Ok(())
    }

    /// Writes the registry back if it changed since it was loaded.
    pub fn flush(&mut self) -> Result<(), BlockgraphError> {
        if !self.dirty {
            return Ok(());
        }

        debug!("Writing '{}'", self.path.display());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).structured(InvalidInputError::WriteRegistry {
                path: self.path.display().to_string(),
            })?;
        }
        self.file
            .write(&self.path)
            .structured(InvalidInputError::WriteRegistry {
                path: self.path.display().to_string(),
            })?;
        self.dirty = false;
        Ok(())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries().iter().position(|entry| F::key(entry) == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use blockgraph_api::error::ErrorKind;

    #[test]
    fn test_fstab_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/fstab");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            indoc! {"
                # static file system information
                UUID=0a1b /     btrfs subvol=@       0 0
                /dev/sda1 /boot vfat  umask=0077     0 2
            "},
        )
        .unwrap();

        let mut fstab = FstabRegistry::load(&path).unwrap();
        assert_eq!(fstab.entries().len(), 2);
        assert_eq!(
            fstab
                .find_by_device(&TabDevice::Uuid("0a1b".into()))
                .map(|entry| entry.mount_point.clone()),
            Some(PathBuf::from("/"))
        );

        fstab
            .add(TabFileEntry::new(TabDevice::Label("data".into()), "/data", "ext4"))
            .unwrap();
        assert!(fstab
            .add(TabFileEntry::new(TabDevice::Label("x".into()), "/data", "ext4"))
            .is_err());

        let boot = fstab.find("/boot").unwrap().clone();
        fstab
            .rename(
                "/boot",
                TabFileEntry {
                    mount_point: "/boot/efi".into(),
                    ..boot
                },
            )
            .unwrap();
        assert!(fstab.find("/boot").is_none());
        assert!(fstab.rename("/boot/efi", fstab.find("/").unwrap().clone()).is_err());

        fstab.remove("/").unwrap();
        assert!(fstab.remove("/").is_err());

        fstab.flush().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            indoc! {"
                /dev/sda1 /boot/efi vfat umask=0077 0 2
                LABEL=data /data ext4 defaults 0 0
            "}
        );
    }

    #[test]
    fn test_crypttab_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/crypttab");

        let mut crypttab = CrypttabRegistry::load(&path).unwrap();
        assert!(crypttab.entries().is_empty());

        // Nothing changed, nothing written.
        crypttab.flush().unwrap();
        assert!(!path.exists());

        crypttab
            .add(CryptTabEntry::new("cr_home", TabDevice::Uuid("5f2c".into())))
            .unwrap();
        let entry = CryptTabEntry::new("cr-home", TabDevice::Uuid("5f2c".into()));
        crypttab.rename("cr_home", entry).unwrap();
        crypttab.flush().unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "cr-home UUID=5f2c none\n"
        );
        let reloaded = CrypttabRegistry::load(&path).unwrap();
        assert!(reloaded.find("cr-home").is_some());
    }

    #[test]
    fn test_unreadable_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, "/dev/sda1\n").unwrap();

        let error = FstabRegistry::load(&path).unwrap_err();
        assert_eq!(
            error.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::ReadRegistry {
                path: path.display().to_string()
            })
        );
    }
}
