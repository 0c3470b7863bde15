pub mod blkid;
pub mod btrfs;
pub mod cryptsetup;
pub mod dependencies;
pub mod dmsetup;
pub mod filesystems;
pub mod lsblk;
pub mod mdadm;
pub mod mkfs;
pub mod mount;
pub mod sfdisk;
pub mod snapper;
pub mod tabfile;
pub mod udevadm;
pub mod wipefs;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
