//! nimbus-nodeclient — HTTP/JSON client to worker node agents.
//!
//! Every worker node runs an agent on port 8081 that boots and stops
//! guest VMs and reports their health. This crate is the only outbound
//! path to those agents: start/stop are idempotent on the instance ID,
//! every call carries a hard deadline, and there are no client-side
//! retries — the reconciliation loops own retry semantics.
//!
//! The [`NodeAgentApi`] trait is the seam the engines are generic
//! over, so the test suite can script agent behavior without a
//! network.

pub mod client;
pub mod error;
pub mod types;

pub use client::HttpNodeClient;
pub use error::{NodeClientError, NodeClientResult};
pub use types::{InstanceHealthReport, StartInstanceRequest, StartOutcome};

use std::future::Future;

/// Operations the control plane invokes on a node agent.
///
/// Implementations must be cheap to clone; the engines hold one copy
/// per spawned task.
pub trait NodeAgentApi: Clone + Send + Sync + 'static {
    /// Create-or-match an instance on the node. Idempotent on
    /// `instance_id`: an existing instance with matching parameters is
    /// a success, one with different parameters is a conflict.
    fn start_instance(
        &self,
        node_ip: &str,
        req: &StartInstanceRequest,
    ) -> impl Future<Output = NodeClientResult<StartOutcome>> + Send;

    /// Stop an instance, granting it `grace_period_sec` to exit.
    /// Idempotent: succeeds whether or not the agent had to act.
    fn stop_instance(
        &self,
        node_ip: &str,
        instance_id: &str,
        grace_period_sec: u64,
    ) -> impl Future<Output = NodeClientResult<()>> + Send;

    /// Live health and utilization of one instance.
    fn instance_health(
        &self,
        node_ip: &str,
        instance_id: &str,
    ) -> impl Future<Output = NodeClientResult<InstanceHealthReport>> + Send;

    /// Agent liveness probe.
    fn node_health(&self, node_ip: &str) -> impl Future<Output = NodeClientResult<()>> + Send;
}
