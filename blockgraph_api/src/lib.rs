pub mod constants;
pub mod error;
pub mod primitives;
pub mod storage_graph;

pub use storage_graph::{
    device::{Device, DeviceKind, DeviceVariant},
    graph::DeviceGraph,
    holder::{HolderKey, HolderKind},
    sid::Sid,
};
