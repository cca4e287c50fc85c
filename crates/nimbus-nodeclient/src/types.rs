//! Wire types for the node agent API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/instances`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartInstanceRequest {
    pub instance_id: String,
    pub image_id: String,
    pub resources: RequestedResources,
    pub default_port: u16,
    pub env: HashMap<String, String>,
}

/// Resource envelope requested from the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestedResources {
    pub vcpu: u32,
    /// Memory in MiB.
    pub memory: u64,
}

/// How the agent resolved an idempotent start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// 201 — the agent created the instance.
    Created,
    /// 200 — the instance already existed with matching parameters.
    AlreadyRunning,
}

/// Body of `DELETE /api/v1/instances/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopInstanceRequest {
    pub grace_period_sec: u64,
}

/// Response of `GET /api/v1/instances/{id}/health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceHealthReport {
    pub healthy: bool,
    /// CPU utilization, 0.0–1.0.
    pub cpu_pct: f64,
    /// Memory utilization, 0.0–1.0.
    pub mem_pct: f64,
    /// Unix timestamp the agent last observed the guest.
    pub last_seen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_wire_shape() {
        let req = StartInstanceRequest {
            instance_id: "i-000001".to_string(),
            image_id: "img-000001".to_string(),
            resources: RequestedResources {
                vcpu: 2,
                memory: 2048,
            },
            default_port: 8080,
            env: HashMap::from([("RUST_LOG".to_string(), "info".to_string())]),
        };

        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(json["instance_id"], "i-000001");
        assert_eq!(json["resources"]["vcpu"], 2);
        assert_eq!(json["resources"]["memory"], 2048);
        assert_eq!(json["default_port"], 8080);
        assert_eq!(json["env"]["RUST_LOG"], "info");
    }

    #[test]
    fn health_report_parses() {
        let report: InstanceHealthReport = serde_json::from_str(
            r#"{"healthy": true, "cpu_pct": 0.42, "mem_pct": 0.2, "last_seen": 1700000000}"#,
        )
        .unwrap();
        assert!(report.healthy);
        assert!((report.cpu_pct - 0.42).abs() < f64::EPSILON);
    }
}
