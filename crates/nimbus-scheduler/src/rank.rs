//! Node ranking within one region.
//!
//! Policy: greatest free headroom first — free vCPU, then free
//! memory; ties broken by lowest instance count, then lexicographic
//! hostname so placement is fully deterministic.

use serde::{Deserialize, Serialize};

/// Free capacity snapshot of one `ready` worker node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub hostname: String,
    pub free_vcpu: u32,
    pub free_memory_mib: u64,
    /// Instances currently placed on this node.
    pub instance_count: u32,
}

impl NodeSnapshot {
    /// Whether this node can hold one more instance of the given envelope.
    pub fn fits(&self, req: &ResourceRequest) -> bool {
        self.free_vcpu >= req.vcpu && self.free_memory_mib >= req.memory_mib
    }

    /// Account for one instance placed on this node.
    pub fn commit(&mut self, req: &ResourceRequest) {
        self.free_vcpu = self.free_vcpu.saturating_sub(req.vcpu);
        self.free_memory_mib = self.free_memory_mib.saturating_sub(req.memory_mib);
        self.instance_count += 1;
    }
}

/// Resource envelope requested per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    pub vcpu: u32,
    pub memory_mib: u64,
}

/// Sort nodes best-first according to the placement policy.
pub fn rank_nodes(nodes: &mut [NodeSnapshot]) {
    nodes.sort_by(|a, b| {
        b.free_vcpu
            .cmp(&a.free_vcpu)
            .then(b.free_memory_mib.cmp(&a.free_memory_mib))
            .then(a.instance_count.cmp(&b.instance_count))
            .then(a.hostname.cmp(&b.hostname))
    });
}
