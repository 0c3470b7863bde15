use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::trace;
use petgraph::{
    stable_graph::{DefaultIx, NodeIndex as PetgraphNodeIndex, StableGraph},
    visit::{EdgeRef, IntoEdgeReferences},
    Directed, Direction,
};
use serde::Serialize;

use super::{
    device::{Device, DeviceVariant},
    error::GraphError,
    holder::{HolderKey, HolderKind},
    sid::Sid,
};

/// The type of the node index used in the DeviceGraph.
pub(crate) type NodeIndex = PetgraphNodeIndex<DefaultIx>;

/// The type of the graph used to store devices and their holders.
pub(crate) type DevicePetgraph = StableGraph<Device, HolderKind, Directed, DefaultIx>;

/// Arena of devices addressed by `Sid`, connected by typed holders.
///
/// Cloning produces a fully independent copy with the same `Sid`s.
#[derive(Debug, Clone, Default)]
pub struct DeviceGraph {
    inner: DevicePetgraph,
    index: BTreeMap<Sid, NodeIndex>,
}

impl DeviceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new device and returns its freshly assigned identity.
    pub fn add_device(&mut self, variant: impl Into<DeviceVariant>) -> Sid {
        let sid = Sid::allocate();
        let idx = self.inner.add_node(Device::new(sid, variant.into()));
        self.index.insert(sid, idx);
        trace!("Added {} as {sid}", self.inner[idx].describe());
        sid
    }

    /// Connects two devices of this graph.
    pub fn add_holder(
        &mut self,
        source: Sid,
        target: Sid,
        kind: HolderKind,
    ) -> Result<(), GraphError> {
        let dangling = |missing| GraphError::DanglingEndpoint {
            source_sid: source,
            target_sid: target,
            kind,
            missing,
        };
        let source_idx = *self.index.get(&source).ok_or_else(|| dangling(source))?;
        let target_idx = *self.index.get(&target).ok_or_else(|| dangling(target))?;

        let key = HolderKey::new(source, target, kind);
        if self.has_holder(&key) {
            return Err(GraphError::DuplicateHolder(key));
        }

        self.inner.add_edge(source_idx, target_idx, kind);
        Ok(())
    }

    /// Removes a single holder, leaving both endpoints in place.
    pub fn remove_holder(&mut self, key: &HolderKey) -> Result<(), GraphError> {
        let edge = self
            .edge_of(key)
            .ok_or(GraphError::HolderNotFound(*key))?;
        self.inner.remove_edge(edge);
        Ok(())
    }

    /// Removes a device together with every holder touching it.
    pub fn remove_device(&mut self, sid: Sid) -> Result<Device, GraphError> {
        let idx = self.index.remove(&sid).ok_or(GraphError::NotFound { sid })?;
        self.inner
            .remove_node(idx)
            .ok_or(GraphError::NotFound { sid })
    }

    pub fn contains(&self, sid: Sid) -> bool {
        self.index.contains_key(&sid)
    }

    pub fn find_device(&self, sid: Sid) -> Option<&Device> {
        self.index.get(&sid).map(|idx| &self.inner[*idx])
    }

    /// Like `find_device()`, but absence is an error.
    pub fn device(&self, sid: Sid) -> Result<&Device, GraphError> {
        self.find_device(sid).ok_or(GraphError::NotFound { sid })
    }

    pub fn device_mut(&mut self, sid: Sid) -> Result<&mut Device, GraphError> {
        let idx = *self.index.get(&sid).ok_or(GraphError::NotFound { sid })?;
        Ok(&mut self.inner[idx])
    }

    /// Finds a block device by its kernel name, e.g. `/dev/sda1`.
    pub fn find_by_name(&self, name: &str) -> Result<&Device, GraphError> {
        self.devices()
            .find(|dev| dev.name().as_deref() == Some(name))
            .ok_or_else(|| GraphError::NameNotFound { name: name.into() })
    }

    /// Iterates over all devices in `Sid` order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.index.values().map(|idx| &self.inner[*idx])
    }

    pub fn sids(&self) -> Vec<Sid> {
        self.index.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns all holders, sorted.
    pub fn holders(&self) -> Vec<HolderKey> {
        let mut holders = self
            .inner
            .edge_references()
            .map(|edge| self.key_of(edge.source(), edge.target(), *edge.weight()))
            .collect::<Vec<_>>();
        holders.sort();
        holders
    }

    pub fn has_holder(&self, key: &HolderKey) -> bool {
        self.edge_of(key).is_some()
    }

    /// Holders whose target is the given device, sorted.
    pub fn in_holders(&self, sid: Sid) -> Vec<HolderKey> {
        self.holders_directed(sid, Direction::Incoming)
    }

    /// Holders whose source is the given device, sorted.
    pub fn out_holders(&self, sid: Sid) -> Vec<HolderKey> {
        self.holders_directed(sid, Direction::Outgoing)
    }

    /// Direct parents, in `Sid` order.
    pub fn parents(&self, sid: Sid) -> Vec<Sid> {
        self.index
            .get(&sid)
            .map(|idx| self.neighbors_sorted(*idx, Direction::Incoming))
            .unwrap_or_default()
    }

    /// Direct children, in `Sid` order.
    pub fn children(&self, sid: Sid) -> Vec<Sid> {
        self.index
            .get(&sid)
            .map(|idx| self.neighbors_sorted(*idx, Direction::Outgoing))
            .unwrap_or_default()
    }

    /// Devices without parents.
    pub fn roots(&self) -> Vec<Sid> {
        self.index
            .iter()
            .filter(|(_, idx)| {
                self.inner
                    .neighbors_directed(**idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(sid, _)| *sid)
            .collect()
    }

    /// Breadth-first walk over children. Siblings are visited in `Sid`
    /// (insertion) order.
    pub fn descendants(&self, sid: Sid, include_self: bool) -> Result<Vec<Sid>, GraphError> {
        self.walk(sid, include_self, Direction::Outgoing)
    }

    /// Breadth-first walk over parents. Siblings are visited in `Sid`
    /// (insertion) order.
    pub fn ancestors(&self, sid: Sid, include_self: bool) -> Result<Vec<Sid>, GraphError> {
        self.walk(sid, include_self, Direction::Incoming)
    }

    /// Returns a multi-line description of the graph suitable for logging.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for dev in self.devices() {
            out += &format!("{} {}\n", dev.sid(), dev.describe());
            for key in self.out_holders(dev.sid()) {
                let target = self
                    .find_device(key.target)
                    .map(|d| d.describe())
                    .unwrap_or_default();
                out += &format!("    -[{}]-> {} {target}\n", key.kind, key.target);
            }
        }
        out
    }

    /// Returns a serializable snapshot of the graph for reporting.
    pub fn summary(&self) -> GraphSummary<'_> {
        GraphSummary {
            devices: self.devices().collect(),
            holders: self.holders(),
        }
    }

    /// Returns every set of devices that are their own ancestors, each sorted
    /// by `Sid`. A device holding itself is a cycle of one.
    pub fn cycles(&self) -> Vec<Vec<Sid>> {
        let mut cycles = petgraph::algo::tarjan_scc(&self.inner)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .iter()
                        .any(|idx| self.inner.contains_edge(*idx, *idx))
            })
            .map(|component| {
                let mut sids = component
                    .into_iter()
                    .map(|idx| self.inner[idx].sid())
                    .collect::<Vec<_>>();
                sids.sort();
                sids
            })
            .collect::<Vec<_>>();
        cycles.sort();
        cycles
    }

    fn walk(&self, sid: Sid, include_self: bool, dir: Direction) -> Result<Vec<Sid>, GraphError> {
        let start = *self.index.get(&sid).ok_or(GraphError::NotFound { sid })?;

        let mut visited = BTreeSet::from([sid]);
        let mut queue = VecDeque::from([start]);
        let mut out = if include_self { vec![sid] } else { vec![] };

        while let Some(idx) = queue.pop_front() {
            for next in self.neighbors_sorted(idx, dir) {
                if visited.insert(next) {
                    out.push(next);
                    queue.push_back(self.index[&next]);
                }
            }
        }

        Ok(out)
    }

    fn neighbors_sorted(&self, idx: NodeIndex, dir: Direction) -> Vec<Sid> {
        let mut sids = self
            .inner
            .neighbors_directed(idx, dir)
            .map(|n| self.inner[n].sid())
            .collect::<Vec<_>>();
        sids.sort();
        sids.dedup();
        sids
    }

    fn holders_directed(&self, sid: Sid, dir: Direction) -> Vec<HolderKey> {
        let Some(idx) = self.index.get(&sid) else {
            return vec![];
        };

        let mut holders = self
            .inner
            .edges_directed(*idx, dir)
            .map(|edge| self.key_of(edge.source(), edge.target(), *edge.weight()))
            .collect::<Vec<_>>();
        holders.sort();
        holders
    }

    fn key_of(&self, source: NodeIndex, target: NodeIndex, kind: HolderKind) -> HolderKey {
        HolderKey::new(self.inner[source].sid(), self.inner[target].sid(), kind)
    }

    fn edge_of(&self, key: &HolderKey) -> Option<petgraph::stable_graph::EdgeIndex<DefaultIx>> {
        let source_idx = self.index.get(&key.source)?;
        let target_idx = self.index.get(&key.target)?;
        self.inner
            .edges_directed(*source_idx, Direction::Outgoing)
            .find(|edge| edge.target() == *target_idx && *edge.weight() == key.kind)
            .map(|edge| edge.id())
    }
}

#[derive(Serialize, Debug)]
pub struct GraphSummary<'a> {
    pub devices: Vec<&'a Device>,
    pub holders: Vec<HolderKey>,
}
