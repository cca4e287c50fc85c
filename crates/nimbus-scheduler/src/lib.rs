//! nimbus-scheduler — placement decisions for the control plane.
//!
//! A pure function of current state: callers snapshot the `ready`
//! worker nodes per region, and the scheduler returns ordered
//! `(region, node)` placements. It performs no I/O and holds no state,
//! which is what lets the workflow and scaling engines share it and
//! the tests drive it exhaustively.

pub mod plan;
pub mod rank;

pub use plan::{plan_region, region_floor, region_target, Placement, RegionPlan};
pub use rank::{rank_nodes, NodeSnapshot, ResourceRequest};
