//! The health loop.
//!
//! A `running` instance whose `updated_at` has not advanced within the
//! stale window becomes a health-check candidate. Candidates are
//! probed through their node agent; two consecutive bad probes write
//! the instance off as `failed`, and the reconcile loop provisions a
//! replacement on its next tick. Instances stuck in `terminating`
//! beyond the stale window — a node agent that keeps failing its stop
//! call — are escalated to `failed` the same way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use nimbus_nodeclient::NodeAgentApi;
use nimbus_routing::Projector;
use nimbus_store::{DeploymentStatus, Instance, InstanceState, Store};

use crate::error::ScalingResult;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Health loop tunables.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// How long `updated_at` may sit still before an instance becomes
    /// a probe candidate (and a stuck `terminating` instance is
    /// escalated).
    pub stale_after: Duration,
    /// Consecutive bad probes before an instance is written off.
    pub fail_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            fail_threshold: 2,
        }
    }
}

/// Probes stale instances and fails the ones that stay bad.
pub struct HealthEngine<A: NodeAgentApi> {
    store: Store,
    agent: A,
    config: Arc<HealthCheckConfig>,
    projector: Projector,
    /// Consecutive bad probes per instance. Advisory; cleared on
    /// restart, which just means an unhealthy instance earns its
    /// strikes again.
    strikes: Arc<Mutex<HashMap<String, u32>>>,
}

impl<A: NodeAgentApi> Clone for HealthEngine<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            agent: self.agent.clone(),
            config: self.config.clone(),
            projector: self.projector.clone(),
            strikes: self.strikes.clone(),
        }
    }
}

impl<A: NodeAgentApi> HealthEngine<A> {
    pub fn new(store: Store, agent: A, config: HealthCheckConfig) -> Self {
        Self {
            projector: Projector::new(store.clone()),
            store,
            agent,
            config: Arc::new(config),
            strikes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the health loop until shutdown.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "health loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "health tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health loop shutting down");
                    break;
                }
            }
        }
    }

    /// One pass: probe stale running instances, escalate stuck
    /// teardowns.
    pub async fn tick(&self) -> ScalingResult<()> {
        let now = epoch_secs();
        let stale = self.config.stale_after.as_secs();

        for instance in self.store.instances_by_state(InstanceState::Running)? {
            if now.saturating_sub(instance.updated_at) < stale {
                continue;
            }
            self.probe(&instance).await?;
        }

        for instance in self.store.instances_by_state(InstanceState::Terminating)? {
            if now.saturating_sub(instance.updated_at) < stale {
                continue;
            }
            warn!(
                instance = %instance.id,
                "stuck in terminating past the stale window; writing off"
            );
            self.fail_instance(&instance)?;
        }
        Ok(())
    }

    async fn probe(&self, instance: &Instance) -> ScalingResult<()> {
        let healthy = match self.store.get_node(&instance.node_id) {
            Ok(node) => match self
                .agent
                .instance_health(&node.ip_address, &instance.id)
                .await
            {
                Ok(report) => report.healthy,
                Err(e) => {
                    debug!(instance = %instance.id, error = %e, "health probe failed");
                    false
                }
            },
            // No node, no instance.
            Err(_) => false,
        };

        if healthy {
            self.strikes.lock().unwrap().remove(&instance.id);
            return Ok(());
        }

        let strikes = {
            let mut strikes = self.strikes.lock().unwrap();
            let entry = strikes.entry(instance.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if strikes >= self.config.fail_threshold {
            warn!(
                instance = %instance.id,
                strikes,
                "instance unreachable; writing off"
            );
            self.fail_instance(instance)?;
        }
        Ok(())
    }

    /// Mark an instance `failed` and drop it from its domain's
    /// routing row.
    fn fail_instance(&self, instance: &Instance) -> ScalingResult<()> {
        let deployment_id = self.store.deployment_for_instance(&instance.id)?;
        match self
            .store
            .instance_set_state(&instance.id, InstanceState::Failed)
        {
            Ok(_) => {}
            // Already terminal; nothing to do.
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.strikes.lock().unwrap().remove(&instance.id);

        if let Some(deployment_id) = deployment_id {
            let deployment = self.store.get_deployment(&deployment_id)?;
            if deployment.status == DeploymentStatus::Active {
                self.projector.refresh(&deployment)?;
            }
        }
        Ok(())
    }
}
