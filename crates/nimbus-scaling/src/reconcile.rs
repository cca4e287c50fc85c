//! The reconciliation loop.
//!
//! Every tick, each `active` deployment is pushed back toward its
//! declared shape, in a fixed order: per-region floor, global
//! minimum, global maximum, then CPU-driven scaling. Floor and
//! minimum enforcement count instances that are up or on their way up
//! (`pending`/`creating`/`starting`/`running`) so the loop stays
//! idempotent — a replacement created last tick is not created again
//! while its agent boots it. Only load-based actions observe the
//! cooldown; a missing instance is replaced immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use nimbus_core::ipam::IpAllocator;
use nimbus_nodeclient::types::RequestedResources;
use nimbus_nodeclient::{NodeAgentApi, StartInstanceRequest};
use nimbus_routing::Projector;
use nimbus_scheduler::{plan_region, region_floor, NodeSnapshot, ResourceRequest};
use nimbus_store::{
    Deployment, DeploymentStatus, Instance, InstanceResources, InstanceState, NewInstance, Region,
    Store, StoreError,
};

use crate::error::ScalingResult;

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reconciliation tunables.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Region codes every deployment is spread across.
    pub regions: Vec<String>,
    /// Minimum interval between two CPU-triggered scale events per
    /// deployment.
    pub cooldown: Duration,
    pub scale_up_cpu: f64,
    pub scale_down_cpu: f64,
    /// `max = max_multiplier × min_instances`; 0 means unbounded.
    pub max_multiplier: u32,
    /// Age at which a `terminating` instance is finalized.
    pub terminate_grace: Duration,
    /// Grace handed to node agents when stopping an instance.
    pub stop_grace: Duration,
    pub instance_resources: InstanceResources,
    pub default_port: u16,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            regions: vec![
                "eu-central-1".to_string(),
                "us-east-1".to_string(),
                "ap-southeast-1".to_string(),
            ],
            cooldown: Duration::from_secs(300),
            scale_up_cpu: 0.80,
            scale_down_cpu: 0.30,
            max_multiplier: 3,
            terminate_grace: Duration::from_secs(30),
            stop_grace: Duration::from_secs(30),
            instance_resources: InstanceResources {
                vcpu: 1,
                memory_mib: 1024,
            },
            default_port: 8080,
        }
    }
}

/// Keeps `active` deployments converged against their scaling policy.
pub struct ReconcileEngine<A: NodeAgentApi> {
    store: Store,
    agent: A,
    allocator: Arc<dyn IpAllocator>,
    config: Arc<ReconcileConfig>,
    projector: Projector,
    /// Unix timestamp of the last CPU-triggered scale event per
    /// deployment. Advisory; empty after a restart, which simply ends
    /// any cooldown early.
    last_scale: Arc<Mutex<HashMap<String, u64>>>,
}

impl<A: NodeAgentApi> Clone for ReconcileEngine<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            agent: self.agent.clone(),
            allocator: self.allocator.clone(),
            config: self.config.clone(),
            projector: self.projector.clone(),
            last_scale: self.last_scale.clone(),
        }
    }
}

impl<A: NodeAgentApi> ReconcileEngine<A> {
    pub fn new(
        store: Store,
        agent: A,
        allocator: Arc<dyn IpAllocator>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            projector: Projector::new(store.clone()),
            store,
            agent,
            allocator,
            config: Arc::new(config),
            last_scale: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the reconcile loop until shutdown.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "reconcile loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconcile loop shutting down");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass over every active deployment, then the
    /// teardown sweep.
    pub async fn tick(&self) -> ScalingResult<()> {
        for deployment in self.store.deployments_by_status(DeploymentStatus::Active)? {
            if let Err(e) = self.reconcile_deployment(&deployment).await {
                warn!(deployment = %deployment.id, error = %e, "reconcile failed; next tick retries");
            }
        }
        self.sweep_terminating().await
    }

    async fn reconcile_deployment(&self, deployment: &Deployment) -> ScalingResult<()> {
        let regions = self.resolve_regions();
        if regions.is_empty() {
            warn!("no configured region exists; nothing to reconcile");
            return Ok(());
        }
        let floor = region_floor(deployment.min_instances, regions.len());
        let instances = self.store.instances_by_deployment(&deployment.id)?;

        let mut live_by_region: HashMap<String, u32> = regions
            .iter()
            .map(|r| (r.id.clone(), 0))
            .collect();
        for instance in instances.iter().filter(|i| is_coming_up(i.state)) {
            if let Some(count) = live_by_region.get_mut(&instance.region_id) {
                *count += 1;
            }
        }
        let mut changed = false;

        // Per-region floor — never cooldown-gated.
        for region in &regions {
            let live = live_by_region[&region.id];
            if live < floor {
                let created = self.provision(deployment, region, floor - live).await?;
                if created > 0 {
                    info!(
                        deployment = %deployment.id,
                        region = %region.code,
                        created,
                        floor,
                        "region brought back toward its floor"
                    );
                    if let Some(count) = live_by_region.get_mut(&region.id) {
                        *count += created;
                    }
                    changed = true;
                }
            }
        }

        // Global minimum: fill the emptiest regions first.
        let mut total_live: u32 = live_by_region.values().sum();
        let mut exhausted: HashSet<String> = HashSet::new();
        while total_live < deployment.min_instances {
            let Some(region) = regions
                .iter()
                .filter(|r| !exhausted.contains(&r.id))
                .min_by_key(|r| (live_by_region[&r.id], r.code.clone()))
            else {
                warn!(
                    deployment = %deployment.id,
                    total_live,
                    min = deployment.min_instances,
                    "below minimum but no region has capacity"
                );
                break;
            };
            let created = self.provision(deployment, region, 1).await?;
            if created == 0 {
                exhausted.insert(region.id.clone());
            } else {
                if let Some(count) = live_by_region.get_mut(&region.id) {
                    *count += 1;
                }
                total_live += 1;
                changed = true;
            }
        }

        // Global maximum: shed the oldest surplus.
        let max = self.config.max_multiplier * deployment.min_instances;
        let mut running: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .collect();
        running.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if max > 0 && running.len() as u32 > max {
            let surplus = running.len() as u32 - max;
            info!(
                deployment = %deployment.id,
                surplus,
                max,
                "above maximum; terminating oldest instances"
            );
            for instance in running.iter().take(surplus as usize) {
                self.initiate_termination(instance).await?;
                changed = true;
            }
            running.drain(..surplus as usize);
        }

        // CPU policy, when the agents give us samples.
        if self
            .cpu_policy(deployment, &regions, &live_by_region, floor, max, total_live, &running)
            .await?
        {
            changed = true;
        }

        if changed {
            self.projector.refresh(deployment)?;
        }
        Ok(())
    }

    /// Mean-CPU scale decisions. Returns whether anything changed.
    #[allow(clippy::too_many_arguments)]
    async fn cpu_policy(
        &self,
        deployment: &Deployment,
        regions: &[Region],
        live_by_region: &HashMap<String, u32>,
        floor: u32,
        max: u32,
        total_live: u32,
        running: &[&Instance],
    ) -> ScalingResult<bool> {
        let mut samples: Vec<(&Instance, f64)> = Vec::new();
        for &instance in running {
            let node = match self.store.get_node(&instance.node_id) {
                Ok(node) => node,
                Err(_) => continue,
            };
            match self
                .agent
                .instance_health(&node.ip_address, &instance.id)
                .await
            {
                Ok(report) => samples.push((instance, report.cpu_pct)),
                Err(e) => {
                    debug!(instance = %instance.id, error = %e, "no metrics sample");
                }
            }
        }
        if samples.is_empty() {
            return Ok(false);
        }

        let mean = samples.iter().map(|(_, cpu)| cpu).sum::<f64>() / samples.len() as f64;
        let now = epoch_secs();
        let cooled = {
            let last_scale = self.last_scale.lock().unwrap();
            let last = last_scale.get(&deployment.id).copied().unwrap_or(0);
            now.saturating_sub(last) >= self.config.cooldown.as_secs()
        };
        if !cooled {
            return Ok(false);
        }

        if mean > self.config.scale_up_cpu && (max == 0 || total_live < max) {
            // Least-loaded region: lowest mean CPU across its samples;
            // a region with no samples carries no load at all.
            let mut region_load: HashMap<&str, (f64, u32)> = HashMap::new();
            for (instance, cpu) in &samples {
                let entry = region_load.entry(instance.region_id.as_str()).or_insert((0.0, 0));
                entry.0 += cpu;
                entry.1 += 1;
            }
            let target = regions.iter().min_by(|a, b| {
                let load = |r: &Region| {
                    region_load
                        .get(r.id.as_str())
                        .map(|(sum, n)| sum / f64::from(*n))
                        .unwrap_or(0.0)
                };
                load(a)
                    .partial_cmp(&load(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(live_by_region[&a.id].cmp(&live_by_region[&b.id]))
                    .then(a.code.cmp(&b.code))
            });
            if let Some(region) = target
                && self.provision(deployment, region, 1).await? > 0
            {
                self.last_scale
                    .lock()
                    .unwrap()
                    .insert(deployment.id.clone(), now);
                info!(
                    deployment = %deployment.id,
                    mean_cpu = mean,
                    region = %region.code,
                    "scaled up on CPU"
                );
                return Ok(true);
            }
        } else if mean < self.config.scale_down_cpu
            && running.len() as u32 > deployment.min_instances
        {
            // Least-loaded instance, but never out of a region sitting
            // at its floor — that would just churn against floor
            // enforcement next tick.
            let candidate = samples
                .iter()
                .filter(|(i, _)| live_by_region.get(&i.region_id).copied().unwrap_or(0) > floor)
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((instance, cpu)) = candidate {
                self.initiate_termination(instance).await?;
                self.last_scale
                    .lock()
                    .unwrap()
                    .insert(deployment.id.clone(), now);
                info!(
                    deployment = %deployment.id,
                    mean_cpu = mean,
                    instance = %instance.id,
                    instance_cpu = cpu,
                    "scaled down on CPU"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create and start up to `count` instances in one region. Returns
    /// how many the agents acknowledged.
    async fn provision(
        &self,
        deployment: &Deployment,
        region: &Region,
        count: u32,
    ) -> ScalingResult<u32> {
        let (snapshots, node_ips) = self.region_capacity(&region.id)?;
        let request = ResourceRequest {
            vcpu: self.config.instance_resources.vcpu,
            memory_mib: self.config.instance_resources.memory_mib,
        };
        let plan = plan_region(&region.id, count, &snapshots, &request);

        let mut created = 0;
        for placement in &plan.placements {
            let instance = self.store.create_instance(
                &NewInstance {
                    deployment_id: deployment.id.clone(),
                    region_id: region.id.clone(),
                    node_id: placement.node_id.clone(),
                    image_id: deployment.image_id.clone(),
                    resources: self.config.instance_resources.clone(),
                    default_port: self.config.default_port,
                    ip_address: self.allocator.allocate(&region.code),
                    environment_variables: HashMap::new(),
                },
                InstanceState::Creating,
            )?;
            let Some(node_ip) = node_ips.get(&placement.node_id) else {
                continue;
            };
            let start = StartInstanceRequest {
                instance_id: instance.id.clone(),
                image_id: deployment.image_id.clone(),
                resources: RequestedResources {
                    vcpu: instance.resources.vcpu,
                    memory: instance.resources.memory_mib,
                },
                default_port: instance.default_port,
                env: instance.environment_variables.clone(),
            };
            match self.agent.start_instance(node_ip, &start).await {
                Ok(_) => created += 1,
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "agent rejected replacement start");
                    let _ = self
                        .store
                        .instance_set_state(&instance.id, InstanceState::Failed);
                }
            }
        }
        Ok(created)
    }

    fn region_capacity(
        &self,
        region_id: &str,
    ) -> ScalingResult<(Vec<NodeSnapshot>, HashMap<String, String>)> {
        let nodes = self.store.nodes_ready_in_region(region_id)?;
        let mut snapshots = Vec::with_capacity(nodes.len());
        let mut node_ips = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let on_node: Vec<_> = self
                .store
                .instances_by_node(&node.id)?
                .into_iter()
                .filter(|i| !i.state.is_terminal())
                .collect();
            let used_vcpu: u32 = on_node.iter().map(|i| i.resources.vcpu).sum();
            let used_memory: u64 = on_node.iter().map(|i| i.resources.memory_mib).sum();
            snapshots.push(NodeSnapshot {
                node_id: node.id.clone(),
                hostname: node.hostname.clone(),
                free_vcpu: node.resources.vcpu.saturating_sub(used_vcpu),
                free_memory_mib: node.resources.memory_mib.saturating_sub(used_memory),
                instance_count: on_node.len() as u32,
            });
            node_ips.insert(node.id, node.ip_address);
        }
        Ok((snapshots, node_ips))
    }

    /// Begin teardown: `terminating` plus an idempotent agent stop.
    async fn initiate_termination(&self, instance: &Instance) -> ScalingResult<()> {
        match self
            .store
            .instance_set_state(&instance.id, InstanceState::Terminating)
        {
            Ok(_) => {}
            // Someone else already started teardown.
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.store.get_node(&instance.node_id) {
            Ok(node) => {
                if let Err(e) = self
                    .agent
                    .stop_instance(
                        &node.ip_address,
                        &instance.id,
                        self.config.stop_grace.as_secs(),
                    )
                    .await
                {
                    warn!(instance = %instance.id, error = %e, "stop failed; sweep will retry");
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Finish teardown of `terminating` instances older than the
    /// terminate grace: re-issue the idempotent stop, then mark
    /// `terminated` (which also drops the deployment link). A failing
    /// agent leaves the instance for the health loop to escalate.
    async fn sweep_terminating(&self) -> ScalingResult<()> {
        let now = epoch_secs();
        let grace = self.config.terminate_grace.as_secs();
        for instance in self.store.instances_by_state(InstanceState::Terminating)? {
            if now.saturating_sub(instance.updated_at) < grace {
                continue;
            }
            match self.store.get_node(&instance.node_id) {
                Ok(node) => {
                    match self
                        .agent
                        .stop_instance(&node.ip_address, &instance.id, 0)
                        .await
                    {
                        Ok(()) => {
                            self.store
                                .instance_set_state(&instance.id, InstanceState::Terminated)?;
                            debug!(instance = %instance.id, "teardown complete");
                        }
                        Err(e) => {
                            warn!(instance = %instance.id, error = %e, "stop still failing");
                        }
                    }
                }
                // The node is gone; there is nothing left to stop.
                Err(StoreError::NotFound(_)) => {
                    self.store
                        .instance_set_state(&instance.id, InstanceState::Terminated)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn resolve_regions(&self) -> Vec<Region> {
        self.config
            .regions
            .iter()
            .filter_map(|code| match self.store.region_by_code(code) {
                Ok(region) => Some(region),
                Err(e) => {
                    warn!(code, error = %e, "configured region missing from store");
                    None
                }
            })
            .collect()
    }
}

/// States counted when deciding whether more instances are needed.
/// Includes instances the agents are still booting, which is what
/// makes repeated ticks idempotent.
fn is_coming_up(state: InstanceState) -> bool {
    matches!(
        state,
        InstanceState::Pending
            | InstanceState::Creating
            | InstanceState::Starting
            | InstanceState::Running
    )
}
