//! Scripted node agent for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use nimbus_nodeclient::{
    InstanceHealthReport, NodeAgentApi, NodeClientError, NodeClientResult, StartInstanceRequest,
    StartOutcome,
};

/// Mock agent: records calls, serves scripted CPU and health values.
#[derive(Clone, Default)]
pub struct MockAgent {
    /// Instance IDs whose start was acknowledged.
    pub started: Arc<Mutex<Vec<String>>>,
    /// Instance IDs whose stop was acknowledged.
    pub stopped: Arc<Mutex<Vec<String>>>,
    /// Instance IDs probed for health.
    pub probed: Arc<Mutex<Vec<String>>>,
    /// Scripted CPU per instance (default 0.5).
    cpu: Arc<Mutex<HashMap<String, f64>>>,
    /// Instances reporting `healthy: false`.
    unhealthy: Arc<Mutex<HashSet<String>>>,
    /// Instances whose health probe errors out.
    unreachable: Arc<Mutex<HashSet<String>>>,
    /// Instances whose stop call errors out.
    stop_fails: Arc<Mutex<HashSet<String>>>,
}

impl MockAgent {
    pub fn set_cpu(&self, instance_id: &str, cpu: f64) {
        self.cpu.lock().unwrap().insert(instance_id.to_string(), cpu);
    }

    pub fn mark_unhealthy(&self, instance_id: &str) {
        self.unhealthy.lock().unwrap().insert(instance_id.to_string());
    }

    pub fn mark_healthy(&self, instance_id: &str) {
        self.unhealthy.lock().unwrap().remove(instance_id);
        self.unreachable.lock().unwrap().remove(instance_id);
    }

    pub fn make_unreachable(&self, instance_id: &str) {
        self.unreachable.lock().unwrap().insert(instance_id.to_string());
    }

    pub fn fail_stop(&self, instance_id: &str) {
        self.stop_fails.lock().unwrap().insert(instance_id.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probed.lock().unwrap().len()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl NodeAgentApi for MockAgent {
    fn start_instance(
        &self,
        _node_ip: &str,
        req: &StartInstanceRequest,
    ) -> impl Future<Output = NodeClientResult<StartOutcome>> + Send {
        let this = self.clone();
        let instance_id = req.instance_id.clone();
        async move {
            this.started.lock().unwrap().push(instance_id);
            Ok(StartOutcome::Created)
        }
    }

    fn stop_instance(
        &self,
        _node_ip: &str,
        instance_id: &str,
        _grace_period_sec: u64,
    ) -> impl Future<Output = NodeClientResult<()>> + Send {
        let this = self.clone();
        let instance_id = instance_id.to_string();
        async move {
            if this.stop_fails.lock().unwrap().contains(&instance_id) {
                return Err(NodeClientError::Timeout(std::time::Duration::from_secs(10)));
            }
            this.stopped.lock().unwrap().push(instance_id);
            Ok(())
        }
    }

    fn instance_health(
        &self,
        _node_ip: &str,
        instance_id: &str,
    ) -> impl Future<Output = NodeClientResult<InstanceHealthReport>> + Send {
        let this = self.clone();
        let instance_id = instance_id.to_string();
        async move {
            this.probed.lock().unwrap().push(instance_id.clone());
            if this.unreachable.lock().unwrap().contains(&instance_id) {
                return Err(NodeClientError::Unreachable {
                    addr: "10.0.0.1:8081".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(InstanceHealthReport {
                healthy: !this.unhealthy.lock().unwrap().contains(&instance_id),
                cpu_pct: this
                    .cpu
                    .lock()
                    .unwrap()
                    .get(&instance_id)
                    .copied()
                    .unwrap_or(0.5),
                mem_pct: 0.4,
                last_seen: epoch_secs(),
            })
        }
    }

    fn node_health(&self, _node_ip: &str) -> impl Future<Output = NodeClientResult<()>> + Send {
        async move { Ok(()) }
    }
}
