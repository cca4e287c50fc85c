//! Per-region placement planning and region floor arithmetic.

use tracing::warn;

use crate::rank::{rank_nodes, NodeSnapshot, ResourceRequest};

/// One placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub region_id: String,
    pub node_id: String,
}

/// Result of planning one region: the placements that fit, and how
/// many desired instances found no node. The caller decides whether a
/// shortfall is a partial or a full failure.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub region_id: String,
    pub placements: Vec<Placement>,
    pub shortfall: u32,
}

impl RegionPlan {
    /// Every desired instance found a node.
    pub fn is_complete(&self) -> bool {
        self.shortfall == 0
    }
}

/// The per-region floor: `⌈min_instances / regions⌉`.
pub fn region_floor(min_instances: u32, regions: usize) -> u32 {
    if regions == 0 {
        return 0;
    }
    min_instances.div_ceil(regions as u32)
}

/// The per-region target the workflow materializes: the floor, but at
/// least one instance per region.
pub fn region_target(min_instances: u32, regions: usize) -> u32 {
    region_floor(min_instances, regions).max(1)
}

/// Place `count` instances in one region.
///
/// Re-ranks after every placement so the simulation accounts for
/// resources already committed within this plan; a region with one big
/// node and one small node fills both rather than overcommitting the
/// big one.
pub fn plan_region(
    region_id: &str,
    count: u32,
    nodes: &[NodeSnapshot],
    req: &ResourceRequest,
) -> RegionPlan {
    let mut pool: Vec<NodeSnapshot> = nodes.to_vec();
    let mut placements = Vec::new();

    for _ in 0..count {
        rank_nodes(&mut pool);
        match pool.iter_mut().find(|n| n.fits(req)) {
            Some(node) => {
                placements.push(Placement {
                    region_id: region_id.to_string(),
                    node_id: node.node_id.clone(),
                });
                node.commit(req);
            }
            None => break,
        }
    }

    let shortfall = count - placements.len() as u32;
    if shortfall > 0 {
        warn!(
            region = region_id,
            requested = count,
            placed = placements.len(),
            "insufficient capacity in region"
        );
    }

    RegionPlan {
        region_id: region_id.to_string(),
        placements,
        shortfall,
    }
}
