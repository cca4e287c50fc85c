//! nimbus.toml configuration parser.
//!
//! Every tunable of the control plane lives here. A missing file
//! yields the defaults; a malformed file or an unparseable duration
//! is fatal and the daemon refuses to start.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading or validating the operator config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

/// Top-level operator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OperatorConfig {
    pub deployment: DeploymentConfig,
    pub scaling: ScalingConfig,
    pub node_client: NodeClientConfig,
    pub api: ApiConfig,
}

/// Workflow-engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Ordered region codes the workflow fans out to.
    pub regions: Vec<String>,
    /// Wait before terminating a superseded revision's instances.
    pub rollover_grace: String,
    /// Per-instance grace between `terminating` and `terminated`.
    pub terminate_grace: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            regions: vec![
                "eu-central-1".to_string(),
                "us-east-1".to_string(),
                "ap-southeast-1".to_string(),
            ],
            rollover_grace: "5m".to_string(),
            terminate_grace: "30s".to_string(),
        }
    }
}

/// Scaling & health engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub reconcile_period: String,
    pub health_period: String,
    /// Minimum interval between two CPU-triggered scale events.
    pub cooldown: String,
    pub scale_up_cpu: f64,
    pub scale_down_cpu: f64,
    pub default_min_instances: u32,
    /// `max_instances = max_multiplier * min_instances`; 0 = unbounded.
    pub max_multiplier: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            reconcile_period: "30s".to_string(),
            health_period: "10s".to_string(),
            cooldown: "5m".to_string(),
            scale_up_cpu: 0.80,
            scale_down_cpu: 0.30,
            default_min_instances: 3,
            max_multiplier: 3,
        }
    }
}

/// Node-agent client tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeClientConfig {
    /// Deadline per outbound node-agent call.
    pub timeout: String,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            timeout: "10s".to_string(),
        }
    }
}

/// API server tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub data_dir: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: "/var/lib/nimbus".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: OperatorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every duration string parses and thresholds are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("deployment.rollover_grace", &self.deployment.rollover_grace),
            ("deployment.terminate_grace", &self.deployment.terminate_grace),
            ("scaling.reconcile_period", &self.scaling.reconcile_period),
            ("scaling.health_period", &self.scaling.health_period),
            ("scaling.cooldown", &self.scaling.cooldown),
            ("node_client.timeout", &self.node_client.timeout),
        ] {
            if parse_duration(value).is_none() {
                return Err(ConfigError::Invalid {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.deployment.regions.is_empty() {
            return Err(ConfigError::Invalid {
                field: "deployment.regions",
                value: "[]".to_string(),
            });
        }
        if self.scaling.scale_down_cpu >= self.scaling.scale_up_cpu {
            return Err(ConfigError::Invalid {
                field: "scaling.scale_down_cpu",
                value: self.scaling.scale_down_cpu.to_string(),
            });
        }
        Ok(())
    }

    pub fn rollover_grace(&self) -> Duration {
        parse_duration(&self.deployment.rollover_grace).unwrap_or(Duration::from_secs(300))
    }

    pub fn terminate_grace(&self) -> Duration {
        parse_duration(&self.deployment.terminate_grace).unwrap_or(Duration::from_secs(30))
    }

    pub fn reconcile_period(&self) -> Duration {
        parse_duration(&self.scaling.reconcile_period).unwrap_or(Duration::from_secs(30))
    }

    pub fn health_period(&self) -> Duration {
        parse_duration(&self.scaling.health_period).unwrap_or(Duration::from_secs(10))
    }

    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.scaling.cooldown).unwrap_or(Duration::from_secs(300))
    }

    pub fn node_client_timeout(&self) -> Duration {
        parse_duration(&self.node_client.timeout).unwrap_or(Duration::from_secs(10))
    }
}
