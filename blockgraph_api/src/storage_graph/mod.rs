//! # Device Graph
//!
//! The purpose of this module is to model the storage topology of a machine
//! as a graph of devices (disks, partitions, RAID arrays, encrypted volumes,
//! filesystems, subvolumes and mount points) connected by typed holders.
//!
//! In broad terms, this module is used as follows:
//!
//! 1. Create a `DeviceGraph`, either empty or by probing the live system.
//! 2. Add devices with `add_device()`, which hands out a stable `Sid`, and
//!    connect them with `add_holder()`.
//! 3. Clone the graph to get an independent staging copy that keeps the same
//!    `Sid`s, then edit the copy.
//! 4. Call `check()` to collect every structural rule violation.
//! 5. Call `diff()` to get the device and holder level differences between
//!    two graphs.
//!
//! Insertion-time invariants (no dangling endpoints, no duplicate holders) are
//! enforced by the graph itself. Everything else is a rule in the `rules`
//! module and is only evaluated by `check()`.
//!
//! ## Layout
//!
//! ```text
//! blockgraph_api/src/storage_graph
//! ├── cardinality.rs -------> # Helper checking cardinality rules.
//! ├── derived.rs -----------> # Derived sizes and resize information.
//! ├── device.rs ------------> # Device & device variants.
//! ├── diff.rs --------------> # Symmetric difference between two graphs.
//! ├── error.rs -------------> # Error & violation types.
//! ├── graph.rs -------------> # DeviceGraph.
//! ├── holder.rs ------------> # Holder kinds and keys.
//! ├── mod.rs ---------------> # This file.
//! ├── rules ----------------> # Rules for validating the graph.
//! │   └── mod.rs
//! ├── sid.rs ---------------> # Stable device identity.
//! └── validation_tests.rs --> # Validation tests.
//! ```

pub mod cardinality;
pub mod derived;
pub mod device;
pub mod diff;
pub mod error;
pub mod graph;
pub mod holder;
pub mod rules;
pub mod sid;
