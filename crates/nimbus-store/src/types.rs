//! Domain types for the Nimbus store.
//!
//! These are the persisted entities of the control plane: regions,
//! nodes, images, deployments, instances, the deployment↔instance
//! association, and the routing cache. All cross-entity links are IDs
//! resolved through the store; values are serialized to JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a region.
pub type RegionId = String;

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for an image.
pub type ImageId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Project identifier (owned by the outer platform; opaque here).
pub type ProjectId = String;

// ── Region ────────────────────────────────────────────────────────

/// A geographic region instances are scheduled into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    /// Unique region code, e.g. `eu-central-1`.
    pub code: String,
    pub country: String,
}

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Booting,
    Ready,
    Draining,
    Down,
    Terminated,
    Error,
    Unknown,
}

/// What a node is for: running the control plane or running guest VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Operator,
    Worker,
}

/// Hardware resources a node offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResources {
    pub vcpu: u32,
    pub memory_mib: u64,
    pub disk_gb: u64,
    pub kind: NodeKind,
}

/// A machine in a region. Only `ready` worker nodes receive instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub region_id: RegionId,
    /// Unique across the fleet.
    pub hostname: String,
    pub ip_address: String,
    pub state: NodeState,
    pub resources: NodeResources,
    /// Unix timestamp (seconds) of the last state change or heartbeat.
    pub updated_at: u64,
}

// ── Image ─────────────────────────────────────────────────────────

/// Build status of a container image. Only `ready` images are schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

/// Source repository an image is built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRepository {
    pub url: String,
    /// Branch, tag, or commit reference.
    pub reference: String,
}

/// A container image produced by the builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub status: ImageStatus,
    pub repository: ImageRepository,
    /// Size in bytes, set on build success.
    pub image_size: Option<u64>,
    /// Content hash, set on build success.
    pub image_hash: Option<String>,
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    Inactive,
    Failed,
}

impl DeploymentStatus {
    /// Whether `self → to` is a legal transition.
    ///
    /// `pending → deploying → active → inactive`, with `failed`
    /// reachable from everything but `inactive`.
    pub fn can_transition(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, to),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Deploying, Active)
                | (Deploying, Failed)
                | (Active, Inactive)
                | (Active, Failed)
        )
    }
}

/// Declared intent to run an image for a project at a minimum replica
/// count. At most one deployment per project is `active` at any instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub image_id: ImageId,
    pub status: DeploymentStatus,
    pub min_instances: u32,
    /// Customer-visible hostname traffic for this deployment arrives on.
    pub deployment_url: String,
    /// Unix timestamp; non-null iff `status = active`.
    pub activated_at: Option<u64>,
    /// Human-readable cause, retained when `status = failed`.
    pub failure_reason: Option<String>,
    pub created_at: u64,
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a guest VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Failed,
}

impl InstanceState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Failed)
    }

    /// Whether `self → to` is a legal transition.
    ///
    /// The nominal chain is `pending → creating → starting → running
    /// → stopping → stopped`; every non-terminal state may move to
    /// `terminating` or `failed`, and `terminating → terminated`
    /// completes teardown.
    pub fn can_transition(self, to: InstanceState) -> bool {
        use InstanceState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            // Anything live can be torn down or written off.
            (_, Terminating) | (_, Failed) => true,
            (Pending, Creating) => true,
            (Creating, Starting) | (Creating, Running) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // A stopped instance can be brought back up.
            (Stopped, Starting) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

/// Resource envelope requested for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceResources {
    pub vcpu: u32,
    pub memory_mib: u64,
}

/// One guest VM realizing one replica of a deployment on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub region_id: RegionId,
    pub node_id: NodeId,
    pub image_id: ImageId,
    pub state: InstanceState,
    pub resources: InstanceResources,
    pub default_port: u16,
    pub ip_address: String,
    pub environment_variables: HashMap<String, String>,
    pub created_at: u64,
    /// Unix timestamp of the last state change.
    pub updated_at: u64,
}

/// Parameters for creating an instance. The store assigns the ID and
/// timestamps and writes the deployment association in the same
/// transaction.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub deployment_id: DeploymentId,
    pub region_id: RegionId,
    pub node_id: NodeId,
    pub image_id: ImageId,
    pub resources: InstanceResources,
    pub default_port: u16,
    pub ip_address: String,
    pub environment_variables: HashMap<String, String>,
}

// ── Routing cache ─────────────────────────────────────────────────

/// The projection edge proxies read: one row per customer domain,
/// overwritten atomically on rollover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingCacheEntry {
    pub domain: String,
    pub deployment_id: DeploymentId,
    /// Backend instance IPs.
    pub instances: Vec<String>,
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_instance_states() {
        assert!(InstanceState::Terminated.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(!InstanceState::Terminating.is_terminal());
    }

    #[test]
    fn nominal_instance_chain() {
        use InstanceState::*;
        assert!(Pending.can_transition(Creating));
        assert!(Creating.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));
        assert!(Stopped.can_transition(Starting));
        assert!(Terminating.can_transition(Terminated));
    }

    #[test]
    fn no_transitions_out_of_terminal() {
        use InstanceState::*;
        for to in [Pending, Creating, Running, Terminating, Failed] {
            assert!(!Terminated.can_transition(to));
            assert!(!Failed.can_transition(to));
        }
    }

    #[test]
    fn any_live_state_can_fail_or_terminate() {
        use InstanceState::*;
        for from in [Pending, Creating, Starting, Running, Stopping, Stopped, Terminating] {
            assert!(from.can_transition(Failed));
        }
        assert!(Running.can_transition(Terminating));
        assert!(Creating.can_transition(Terminating));
    }

    #[test]
    fn no_backwards_instance_transitions() {
        use InstanceState::*;
        assert!(!Running.can_transition(Creating));
        assert!(!Stopped.can_transition(Running));
        assert!(!Terminating.can_transition(Running));
    }

    #[test]
    fn deployment_status_machine() {
        use DeploymentStatus::*;
        assert!(Pending.can_transition(Deploying));
        assert!(Deploying.can_transition(Active));
        assert!(Active.can_transition(Inactive));
        assert!(Pending.can_transition(Failed));
        assert!(Deploying.can_transition(Failed));
        assert!(Active.can_transition(Failed));

        assert!(!Pending.can_transition(Active));
        assert!(!Inactive.can_transition(Active));
        assert!(!Failed.can_transition(Deploying));
        assert!(!Active.can_transition(Deploying));
    }
}
