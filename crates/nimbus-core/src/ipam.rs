//! Instance IP allocation.
//!
//! The control plane hands every new instance an address at creation
//! time and treats it as an opaque string afterwards. `IpAllocator` is
//! the seam a real IPAM service plugs into; the default hands out
//! sequential unique-local IPv6 addresses.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates an address for a new instance in the given region.
pub trait IpAllocator: Send + Sync {
    fn allocate(&self, region_code: &str) -> String;
}

/// Sequential `fd00::/8` allocator. Addresses are unique per process
/// lifetime; collisions across restarts are acceptable because node
/// agents key instances by ID, not address.
pub struct UlaAllocator {
    counter: AtomicU64,
}

impl UlaAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }
}

impl Default for UlaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IpAllocator for UlaAllocator {
    fn allocate(&self, _region_code: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("fd00::{:x}:{:x}", n >> 16, n & 0xffff)
    }
}
