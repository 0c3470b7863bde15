use std::collections::BTreeSet;

use serde::Serialize;

use super::{graph::DeviceGraph, holder::HolderKey, sid::Sid};

/// Device and holder level differences between two graphs, matched purely by
/// `Sid` and by holder key.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GraphDiff {
    /// Devices only present in the right-hand graph.
    pub created: Vec<Sid>,
    /// Devices only present in the left-hand graph.
    pub removed: Vec<Sid>,
    /// Devices present in both graphs with differing attributes.
    pub modified: Vec<Sid>,
    /// Holders only present in the right-hand graph.
    pub created_holders: Vec<HolderKey>,
    /// Holders only present in the left-hand graph.
    pub removed_holders: Vec<HolderKey>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.created_holders.is_empty()
            && self.removed_holders.is_empty()
    }

    /// Returns the diff in the opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            created: self.removed.clone(),
            removed: self.created.clone(),
            modified: self.modified.clone(),
            created_holders: self.removed_holders.clone(),
            removed_holders: self.created_holders.clone(),
        }
    }
}

impl DeviceGraph {
    /// Compares this graph (`lhs`, usually probed) against `rhs` (usually
    /// staged).
    pub fn diff(&self, rhs: &DeviceGraph) -> GraphDiff {
        let lhs_sids = self.sids().into_iter().collect::<BTreeSet<_>>();
        let rhs_sids = rhs.sids().into_iter().collect::<BTreeSet<_>>();

        let modified = lhs_sids
            .intersection(&rhs_sids)
            .copied()
            .filter(|sid| self.find_device(*sid) != rhs.find_device(*sid))
            .collect();

        let lhs_holders = self.holders().into_iter().collect::<BTreeSet<_>>();
        let rhs_holders = rhs.holders().into_iter().collect::<BTreeSet<_>>();

        GraphDiff {
            created: rhs_sids.difference(&lhs_sids).copied().collect(),
            removed: lhs_sids.difference(&rhs_sids).copied().collect(),
            modified,
            created_holders: rhs_holders.difference(&lhs_holders).copied().collect(),
            removed_holders: lhs_holders.difference(&rhs_holders).copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage_graph::{
        device::{Disk, Filesystem, FilesystemType, Partition},
        holder::HolderKind,
    };

    #[test]
    fn test_diff_against_self_is_empty() {
        let mut graph = DeviceGraph::new();
        let disk = graph.add_device(Disk {
            name: "/dev/sda".into(),
            size: 1 << 30,
        });
        let part = graph.add_device(Partition::new("/dev/sda1", 1, 1 << 20, 1 << 29));
        graph.add_holder(disk, part, HolderKind::PartitionOf).unwrap();

        assert!(graph.diff(&graph).is_empty());
        assert!(graph.diff(&graph.clone()).is_empty());
    }

    #[test]
    fn test_diff_is_symmetric() {
        let mut probed = DeviceGraph::new();
        let disk = probed.add_device(Disk {
            name: "/dev/sda".into(),
            size: 1 << 30,
        });
        let part = probed.add_device(Partition::new("/dev/sda1", 1, 1 << 20, 1 << 29));
        let fs = probed.add_device(Filesystem::new(FilesystemType::Ext4));
        probed.add_holder(disk, part, HolderKind::PartitionOf).unwrap();
        probed.add_holder(part, fs, HolderKind::FormattedAs).unwrap();

        let mut staged = probed.clone();
        staged.remove_device(fs).unwrap();
        staged.resize_block_device(part, 1 << 28).unwrap();
        let new_part = staged.add_device(Partition::new("/dev/sda2", 2, 1 << 29, 1 << 20));
        staged
            .add_holder(disk, new_part, HolderKind::PartitionOf)
            .unwrap();

        let diff = probed.diff(&staged);
        assert_eq!(
            diff,
            GraphDiff {
                created: vec![new_part],
                removed: vec![fs],
                modified: vec![part],
                created_holders: vec![HolderKey::new(disk, new_part, HolderKind::PartitionOf)],
                removed_holders: vec![HolderKey::new(part, fs, HolderKind::FormattedAs)],
            }
        );
        assert_eq!(staged.diff(&probed), diff.inverse());
    }
}
