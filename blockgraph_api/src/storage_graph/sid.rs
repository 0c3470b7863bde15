use std::{
    fmt::Display,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Next identity to hand out. Shared by every graph in the process.
static NEXT_SID: AtomicU64 = AtomicU64::new(1);

/// Stable structural identity of a device.
///
/// A `Sid` is assigned when a device is added to a graph, is never reused
/// within the process, and is preserved when a graph is cloned. It is the only
/// correspondence between a probed and a staged graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(u64);

impl Sid {
    pub(crate) fn allocate() -> Self {
        Sid(NEXT_SID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u64) -> Self {
        Sid(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
