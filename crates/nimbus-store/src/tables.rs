//! redb table definitions for the Nimbus store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). The association table's composite key is
//! `{deployment_id}:{instance_id}` to allow prefix scans per
//! deployment.

use redb::TableDefinition;

/// Regions keyed by `{region_id}`.
pub const REGIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("regions");

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Images keyed by `{image_id}`.
pub const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Deployment↔instance association keyed by `{deployment_id}:{instance_id}`.
pub const DEPLOYMENT_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_instances");

/// Routing cache keyed by `{domain}`.
pub const ROUTING_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("routing_cache");
