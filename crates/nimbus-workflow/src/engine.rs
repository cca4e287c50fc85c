//! The workflow engine proper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use nimbus_core::ipam::IpAllocator;
use nimbus_nodeclient::types::RequestedResources;
use nimbus_nodeclient::{NodeAgentApi, StartInstanceRequest};
use nimbus_routing::Projector;
use nimbus_scheduler::{plan_region, region_target, NodeSnapshot, ResourceRequest};
use nimbus_store::{
    Deployment, DeploymentStatus, ImageStatus, InstanceResources, InstanceState, NewInstance,
    Store,
};

use crate::error::{WorkflowError, WorkflowResult};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Workflow engine tunables.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Ordered region codes the fan-out covers.
    pub regions: Vec<String>,
    /// Wait before terminating a superseded revision's instances.
    pub rollover_grace: Duration,
    /// Grace handed to node agents when stopping an instance.
    pub stop_grace: Duration,
    /// Resource envelope for every instance this engine creates.
    pub instance_resources: InstanceResources,
    /// Port guests serve traffic on.
    pub default_port: u16,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            regions: vec![
                "eu-central-1".to_string(),
                "us-east-1".to_string(),
                "ap-southeast-1".to_string(),
            ],
            rollover_grace: Duration::from_secs(300),
            stop_grace: Duration::from_secs(30),
            instance_resources: InstanceResources {
                vcpu: 1,
                memory_mib: 1024,
            },
            default_port: 8080,
        }
    }
}

/// Advisory in-memory record of one in-flight workflow. Reconstructible
/// from the store; never authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRecord {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub started_at: u64,
}

/// How a `start` invocation resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDisposition {
    /// The deployment reached `active`.
    Activated,
    /// Another invocation owns this deployment (already `deploying`
    /// or `active`); this call was a no-op.
    AlreadyInProgress,
    /// Every region failed; the deployment is `failed`.
    Failed { reason: String },
}

/// Result of materializing one region.
#[derive(Debug, Clone)]
pub struct RegionOutcome {
    pub region: String,
    /// Instances created-and-acknowledged plus surviving existing ones.
    pub live: u32,
    pub target: u32,
    pub ok: bool,
    pub detail: Option<String>,
}

impl RegionOutcome {
    fn failed(region: &str, target: u32, detail: String) -> Self {
        Self {
            region: region.to_string(),
            live: 0,
            target,
            ok: false,
            detail: Some(detail),
        }
    }
}

/// Drives deployments from `pending` to `active` and retires the
/// revision they replace.
pub struct WorkflowEngine<A: NodeAgentApi> {
    store: Store,
    agent: A,
    allocator: Arc<dyn IpAllocator>,
    config: Arc<WorkflowConfig>,
    /// In-flight workflows, advisory.
    runs: Arc<RwLock<HashMap<String, WorkflowRecord>>>,
    shutdown: watch::Receiver<bool>,
}

impl<A: NodeAgentApi> Clone for WorkflowEngine<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            agent: self.agent.clone(),
            allocator: self.allocator.clone(),
            config: self.config.clone(),
            runs: self.runs.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<A: NodeAgentApi> WorkflowEngine<A> {
    pub fn new(
        store: Store,
        agent: A,
        allocator: Arc<dyn IpAllocator>,
        config: WorkflowConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            agent,
            allocator,
            config: Arc::new(config),
            runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Snapshot of the in-flight workflow records.
    pub async fn active_runs(&self) -> Vec<WorkflowRecord> {
        self.runs.read().await.values().cloned().collect()
    }

    /// Rebuild the advisory run map after a restart by scanning
    /// deployments stuck in `deploying`.
    pub async fn rebuild_runs(&self) -> WorkflowResult<usize> {
        let deploying = self
            .store
            .deployments_by_status(DeploymentStatus::Deploying)?;
        let mut runs = self.runs.write().await;
        for deployment in &deploying {
            runs.insert(
                deployment.id.clone(),
                WorkflowRecord {
                    deployment_id: deployment.id.clone(),
                    status: DeploymentStatus::Deploying,
                    started_at: epoch_secs(),
                },
            );
        }
        Ok(deploying.len())
    }

    /// Run the full workflow for a `pending` deployment.
    ///
    /// Idempotent: a deployment already `deploying` or `active` is a
    /// no-op, and of two concurrent invocations exactly one wins the
    /// store-guarded `pending → deploying` claim.
    pub async fn start(&self, deployment_id: &str) -> WorkflowResult<StartDisposition> {
        let deployment = self.store.get_deployment(deployment_id)?;
        match deployment.status {
            DeploymentStatus::Deploying | DeploymentStatus::Active => {
                debug!(deployment = deployment_id, "start is a no-op");
                return Ok(StartDisposition::AlreadyInProgress);
            }
            DeploymentStatus::Pending => {}
            status => {
                return Err(WorkflowError::NotStartable {
                    deployment_id: deployment_id.to_string(),
                    status,
                });
            }
        }

        let image = self.store.get_image(&deployment.image_id)?;
        if image.status != ImageStatus::Ready {
            return Err(WorkflowError::ImageNotReady {
                image_id: image.id,
                status: image.status,
            });
        }

        // The claim: exactly one invocation transitions pending → deploying.
        match self
            .store
            .deployment_set_status(deployment_id, DeploymentStatus::Deploying, None)
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(deployment = deployment_id, "lost the claim to a concurrent start");
                return Ok(StartDisposition::AlreadyInProgress);
            }
            Err(e) => return Err(e.into()),
        }
        self.runs.write().await.insert(
            deployment_id.to_string(),
            WorkflowRecord {
                deployment_id: deployment_id.to_string(),
                status: DeploymentStatus::Deploying,
                started_at: epoch_secs(),
            },
        );
        info!(
            deployment = deployment_id,
            image = %deployment.image_id,
            regions = self.config.regions.len(),
            "deployment workflow started"
        );

        // Fan out one task per region; the loop below is the barrier.
        let mut handles = Vec::new();
        for code in &self.config.regions {
            let engine = self.clone();
            let code = code.clone();
            let deployment = deployment.clone();
            handles.push(tokio::spawn(async move {
                engine.materialize_region(&deployment, &code).await
            }));
        }
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "region task aborted"),
            }
        }

        if !outcomes.iter().any(|o| o.ok) {
            let reason = summarize_failure(&outcomes);
            self.store.deployment_set_failed(deployment_id, &reason)?;
            self.runs.write().await.remove(deployment_id);
            warn!(deployment = deployment_id, %reason, "deployment failed in every region");
            return Ok(StartDisposition::Failed { reason });
        }
        for outcome in outcomes.iter().filter(|o| !o.ok) {
            warn!(
                deployment = deployment_id,
                region = %outcome.region,
                live = outcome.live,
                target = outcome.target,
                "region below target — scaling will converge it"
            );
        }

        // Activation gate, strictly ordered: the routing cache must be
        // durable before the old revision steps aside, and the old
        // revision must be inactive before the new one claims active.
        Projector::new(self.store.clone()).refresh(&deployment)?;

        if let Some(previous) = self
            .store
            .active_deployment_for_project(&deployment.project_id)?
        {
            self.store
                .deployment_set_status(&previous.id, DeploymentStatus::Inactive, None)?;
            info!(
                deployment = %previous.id,
                successor = deployment_id,
                grace_secs = self.config.rollover_grace.as_secs(),
                "previous revision deactivated"
            );
            self.schedule_retirement(previous.id);
        }

        self.store
            .deployment_set_status(deployment_id, DeploymentStatus::Active, Some(epoch_secs()))?;
        self.runs.write().await.remove(deployment_id);
        info!(
            deployment = deployment_id,
            regions_ok = outcomes.iter().filter(|o| o.ok).count(),
            "deployment active"
        );
        Ok(StartDisposition::Activated)
    }

    /// Bring one region up to its target instance count.
    ///
    /// Existing live instances count toward the target, so re-running
    /// the workflow never creates duplicates. Success means at least
    /// `⌈target/2⌉` instances are live-or-acknowledged.
    async fn materialize_region(&self, deployment: &Deployment, code: &str) -> RegionOutcome {
        let target = region_target(deployment.min_instances, self.config.regions.len());

        let region = match self.store.region_by_code(code) {
            Ok(region) => region,
            Err(e) => return RegionOutcome::failed(code, target, e.to_string()),
        };

        let existing = match self.store.instances_by_deployment(&deployment.id) {
            Ok(instances) => instances,
            Err(e) => return RegionOutcome::failed(code, target, e.to_string()),
        };
        let mut live = existing
            .iter()
            .filter(|i| i.region_id == region.id && is_live(i.state))
            .count() as u32;

        if live < target {
            let needed = target - live;
            let (snapshots, node_ips) = match self.region_capacity(&region.id) {
                Ok(pair) => pair,
                Err(e) => return RegionOutcome::failed(code, target, e.to_string()),
            };
            let request = ResourceRequest {
                vcpu: self.config.instance_resources.vcpu,
                memory_mib: self.config.instance_resources.memory_mib,
            };
            let plan = plan_region(&region.id, needed, &snapshots, &request);

            for placement in &plan.placements {
                let ip_address = self.allocator.allocate(&region.code);
                let instance = match self.store.create_instance(
                    &NewInstance {
                        deployment_id: deployment.id.clone(),
                        region_id: region.id.clone(),
                        node_id: placement.node_id.clone(),
                        image_id: deployment.image_id.clone(),
                        resources: self.config.instance_resources.clone(),
                        default_port: self.config.default_port,
                        ip_address,
                        environment_variables: HashMap::new(),
                    },
                    InstanceState::Creating,
                ) {
                    Ok(instance) => instance,
                    Err(e) => {
                        warn!(region = code, error = %e, "instance creation failed");
                        continue;
                    }
                };

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
                    Ok(_) => {
                        debug!(
                            instance = %instance.id,
                            region = code,
                            node = %placement.node_id,
                            "instance start acknowledged"
                        );
                        live += 1;
                    }
                    Err(e) => {
                        warn!(
                            instance = %instance.id,
                            region = code,
                            error = %e,
                            "agent rejected instance start"
                        );
                        if let Err(e) = self
                            .store
                            .instance_set_state(&instance.id, InstanceState::Failed)
                        {
                            warn!(instance = %instance.id, error = %e, "failed to mark instance failed");
                        }
                    }
                }
            }
        }

        let ok = live >= target.div_ceil(2);
        RegionOutcome {
            region: code.to_string(),
            live,
            target,
            ok,
            detail: (!ok).then(|| format!("{live}/{target} instances live")),
        }
    }

    /// Free-capacity snapshots of the region's ready workers, plus a
    /// node-id → agent-ip map for the placement loop.
    fn region_capacity(
        &self,
        region_id: &str,
    ) -> Result<(Vec<NodeSnapshot>, HashMap<String, String>), nimbus_store::StoreError> {
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

    /// After the rollover grace elapses, move the superseded revision's
    /// instances to `terminating` and tell their agents to stop them.
    /// The scaling sweep finishes the job; a crash loses nothing since
    /// that sweep re-derives work from store state.
    fn schedule_retirement(&self, deployment_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut shutdown = engine.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(engine.config.rollover_grace) => {
                    if let Err(e) = engine.retire_instances(&deployment_id).await {
                        warn!(deployment = %deployment_id, error = %e, "retirement failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(deployment = %deployment_id, "retirement cancelled by shutdown");
                }
            }
        });
    }

    async fn retire_instances(&self, deployment_id: &str) -> WorkflowResult<()> {
        let instances = self.store.instances_by_deployment(deployment_id)?;
        for instance in instances.iter().filter(|i| !i.state.is_terminal()) {
            match self
                .store
                .instance_set_state(&instance.id, InstanceState::Terminating)
            {
                Ok(_) => {}
                // Already on its way out.
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
            let node = self.store.get_node(&instance.node_id)?;
            if let Err(e) = self
                .agent
                .stop_instance(
                    &node.ip_address,
                    &instance.id,
                    self.config.stop_grace.as_secs(),
                )
                .await
            {
                warn!(
                    instance = %instance.id,
                    error = %e,
                    "stop failed; health loop will escalate"
                );
            }
        }
        info!(
            deployment = deployment_id,
            count = instances.len(),
            "superseded revision terminating"
        );
        Ok(())
    }
}

/// States that count toward a region's live target.
fn is_live(state: InstanceState) -> bool {
    matches!(
        state,
        InstanceState::Pending
            | InstanceState::Creating
            | InstanceState::Starting
            | InstanceState::Running
    )
}

fn summarize_failure(outcomes: &[RegionOutcome]) -> String {
    let parts: Vec<String> = outcomes
        .iter()
        .map(|o| {
            format!(
                "{}: {}",
                o.region,
                o.detail.as_deref().unwrap_or("unknown failure")
            )
        })
        .collect();
    format!("no region succeeded ({})", parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use nimbus_core::ipam::UlaAllocator;
    use nimbus_nodeclient::{
        InstanceHealthReport, NodeClientError, NodeClientResult, StartOutcome,
    };
    use nimbus_store::{ImageRepository, NodeKind, NodeResources, NodeState};

    /// Scripted node agent: records calls, optionally refuses nodes.
    #[derive(Clone, Default)]
    struct MockAgent {
        started: Arc<StdMutex<Vec<(String, StartInstanceRequest)>>>,
        stopped: Arc<StdMutex<Vec<(String, String, u64)>>>,
        refuse: Arc<StdMutex<HashSet<String>>>,
    }

    impl MockAgent {
        fn refuse_node(&self, node_ip: &str) {
            self.refuse.lock().unwrap().insert(node_ip.to_string());
        }

        fn started_count(&self) -> usize {
            self.started.lock().unwrap().len()
        }

        fn stopped_ids(&self) -> Vec<String> {
            self.stopped
                .lock()
                .unwrap()
                .iter()
                .map(|(_, id, _)| id.clone())
                .collect()
        }
    }

    impl NodeAgentApi for MockAgent {
        fn start_instance(
            &self,
            node_ip: &str,
            req: &StartInstanceRequest,
        ) -> impl Future<Output = NodeClientResult<StartOutcome>> + Send {
            let this = self.clone();
            let node_ip = node_ip.to_string();
            let req = req.clone();
            async move {
                if this.refuse.lock().unwrap().contains(&node_ip) {
                    return Err(NodeClientError::Unreachable {
                        addr: node_ip,
                        reason: "connection refused".to_string(),
                    });
                }
                this.started.lock().unwrap().push((node_ip, req));
                Ok(StartOutcome::Created)
            }
        }

        fn stop_instance(
            &self,
            node_ip: &str,
            instance_id: &str,
            grace_period_sec: u64,
        ) -> impl Future<Output = NodeClientResult<()>> + Send {
            let this = self.clone();
            let node_ip = node_ip.to_string();
            let instance_id = instance_id.to_string();
            async move {
                this.stopped
                    .lock()
                    .unwrap()
                    .push((node_ip, instance_id, grace_period_sec));
                Ok(())
            }
        }

        fn instance_health(
            &self,
            _node_ip: &str,
            _instance_id: &str,
        ) -> impl Future<Output = NodeClientResult<InstanceHealthReport>> + Send {
            async move {
                Ok(InstanceHealthReport {
                    healthy: true,
                    cpu_pct: 0.5,
                    mem_pct: 0.5,
                    last_seen: epoch_secs(),
                })
            }
        }

        fn node_health(&self, _node_ip: &str) -> impl Future<Output = NodeClientResult<()>> + Send {
            async move { Ok(()) }
        }
    }

    const REGIONS: [&str; 3] = ["eu-central-1", "us-east-1", "ap-southeast-1"];

    struct Fixture {
        store: Store,
        agent: MockAgent,
        engine: WorkflowEngine<MockAgent>,
        /// Keeps the shutdown channel open for the engine's tasks.
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        fixture_with_nodes(2)
    }

    fn fixture_with_nodes(nodes_per_region: usize) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        for (r, code) in REGIONS.iter().enumerate() {
            let region = store.create_region(code, code, "xx").unwrap();
            for n in 0..nodes_per_region {
                store
                    .create_node(
                        &region.id,
                        &format!("worker-{r}-{n}"),
                        &format!("10.0.{r}.{n}"),
                        NodeState::Ready,
                        NodeResources {
                            vcpu: 16,
                            memory_mib: 32 * 1024,
                            disk_gb: 200,
                            kind: NodeKind::Worker,
                        },
                    )
                    .unwrap();
            }
        }
        let agent = MockAgent::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = WorkflowEngine::new(
            store.clone(),
            agent.clone(),
            Arc::new(UlaAllocator::new()),
            WorkflowConfig {
                rollover_grace: Duration::ZERO,
                ..Default::default()
            },
            shutdown_rx,
        );
        Fixture {
            store,
            agent,
            engine,
            _shutdown: shutdown_tx,
        }
    }

    impl Fixture {
        fn ready_image(&self) -> String {
            let image = self
                .store
                .create_image(
                    "api",
                    ImageRepository {
                        url: "https://github.com/acme/api".to_string(),
                        reference: "main".to_string(),
                    },
                )
                .unwrap();
            self.store
                .image_set_status(
                    &image.id,
                    ImageStatus::Ready,
                    Some("sha256:abc".to_string()),
                    Some(1024),
                )
                .unwrap();
            image.id
        }

        fn deployment(&self, project: &str, min: u32) -> Deployment {
            let image_id = self.ready_image();
            self.store
                .create_deployment(project, &image_id, min, &format!("{project}.nimbus.app"))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn fresh_deployment_activates_one_instance_per_region() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);

        let disposition = f.engine.start(&d.id).await.unwrap();
        assert_eq!(disposition, StartDisposition::Activated);

        let d = f.store.get_deployment(&d.id).unwrap();
        assert_eq!(d.status, DeploymentStatus::Active);
        assert!(d.activated_at.is_some());

        let instances = f.store.instances_by_deployment(&d.id).unwrap();
        assert_eq!(instances.len(), 3);
        let regions: HashSet<_> = instances.iter().map(|i| i.region_id.clone()).collect();
        assert_eq!(regions.len(), 3);
        assert!(instances.iter().all(|i| i.state == InstanceState::Creating));

        let row = f.store.routing_cache_get("proj-a.nimbus.app").unwrap().unwrap();
        assert_eq!(row.deployment_id, d.id);
        assert_eq!(row.instances.len(), 3);
        assert_eq!(f.agent.started_count(), 3);

        // Run record cleared once the workflow completed.
        assert!(f.engine.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn larger_minimum_raises_region_targets() {
        let f = fixture();
        let d = f.deployment("proj-a", 6);

        f.engine.start(&d.id).await.unwrap();

        // ⌈6/3⌉ = 2 per region.
        let instances = f.store.instances_by_deployment(&d.id).unwrap();
        assert_eq!(instances.len(), 6);
    }

    #[tokio::test]
    async fn pending_image_blocks_start() {
        let f = fixture();
        let image = f
            .store
            .create_image(
                "api",
                ImageRepository {
                    url: "u".to_string(),
                    reference: "r".to_string(),
                },
            )
            .unwrap();
        let d = f
            .store
            .create_deployment("proj-a", &image.id, 3, "proj-a.nimbus.app")
            .unwrap();

        let err = f.engine.start(&d.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ImageNotReady { .. }));
        // Deployment untouched.
        assert_eq!(
            f.store.get_deployment(&d.id).unwrap().status,
            DeploymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn failed_deployment_is_not_startable() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);
        f.store
            .deployment_set_status(&d.id, DeploymentStatus::Deploying, None)
            .unwrap();
        f.store.deployment_set_failed(&d.id, "builder exploded").unwrap();

        let err = f.engine.start(&d.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotStartable { .. }));
    }

    #[tokio::test]
    async fn no_capacity_anywhere_fails_the_deployment() {
        let f = fixture_with_nodes(0);
        let d = f.deployment("proj-a", 3);

        let disposition = f.engine.start(&d.id).await.unwrap();
        assert!(matches!(disposition, StartDisposition::Failed { .. }));

        let d = f.store.get_deployment(&d.id).unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert!(d.failure_reason.is_some());
        assert!(f.store.instances_by_deployment(&d.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_region_failure_still_activates() {
        let f = fixture();
        // All agents in the eu region refuse starts.
        f.agent.refuse_node("10.0.0.0");
        f.agent.refuse_node("10.0.0.1");
        let d = f.deployment("proj-a", 3);

        let disposition = f.engine.start(&d.id).await.unwrap();
        assert_eq!(disposition, StartDisposition::Activated);

        let instances = f.store.instances_by_deployment(&d.id).unwrap();
        let creating = instances
            .iter()
            .filter(|i| i.state == InstanceState::Creating)
            .count();
        let failed = instances
            .iter()
            .filter(|i| i.state == InstanceState::Failed)
            .count();
        assert_eq!(creating, 2);
        assert_eq!(failed, 1);

        // Routing only carries the surviving backends.
        let row = f.store.routing_cache_get("proj-a.nimbus.app").unwrap().unwrap();
        assert_eq!(row.instances.len(), 2);
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);

        assert_eq!(
            f.engine.start(&d.id).await.unwrap(),
            StartDisposition::Activated
        );
        assert_eq!(
            f.engine.start(&d.id).await.unwrap(),
            StartDisposition::AlreadyInProgress
        );

        // Same instance count, same routing row.
        assert_eq!(f.store.instances_by_deployment(&d.id).unwrap().len(), 3);
        assert_eq!(f.agent.started_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_duplicate_start_claims_once() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);

        let (a, b) = tokio::join!(f.engine.start(&d.id), f.engine.start(&d.id));
        let dispositions = [a.unwrap(), b.unwrap()];
        let activated = dispositions
            .iter()
            .filter(|d| **d == StartDisposition::Activated)
            .count();
        assert_eq!(activated, 1);

        assert_eq!(f.store.instances_by_deployment(&d.id).unwrap().len(), 3);
        let row = f.store.routing_cache_get("proj-a.nimbus.app").unwrap().unwrap();
        assert_eq!(row.instances.len(), 3);
    }

    #[tokio::test]
    async fn existing_instances_count_toward_target() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);

        // One instance already exists in the eu region.
        let region = f.store.region_by_code("eu-central-1").unwrap();
        let node = &f.store.nodes_ready_in_region(&region.id).unwrap()[0];
        f.store
            .create_instance(
                &NewInstance {
                    deployment_id: d.id.clone(),
                    region_id: region.id.clone(),
                    node_id: node.id.clone(),
                    image_id: d.image_id.clone(),
                    resources: InstanceResources {
                        vcpu: 1,
                        memory_mib: 1024,
                    },
                    default_port: 8080,
                    ip_address: "fd00::aa".to_string(),
                    environment_variables: HashMap::new(),
                },
                InstanceState::Creating,
            )
            .unwrap();

        f.engine.start(&d.id).await.unwrap();

        // Only the two missing regions got new instances.
        assert_eq!(f.store.instances_by_deployment(&d.id).unwrap().len(), 3);
        assert_eq!(f.agent.started_count(), 2);
    }

    #[tokio::test]
    async fn rollover_retires_previous_revision() {
        let f = fixture();
        let d1 = f.deployment("proj-a", 3);
        f.engine.start(&d1.id).await.unwrap();

        let d2 = f.deployment("proj-a", 3);
        assert_eq!(
            f.engine.start(&d2.id).await.unwrap(),
            StartDisposition::Activated
        );

        // d1 stepped aside, timestamp cleared.
        let d1 = f.store.get_deployment(&d1.id).unwrap();
        assert_eq!(d1.status, DeploymentStatus::Inactive);
        assert!(d1.activated_at.is_none());

        // The domain now points at d2's backends.
        let row = f.store.routing_cache_get("proj-a.nimbus.app").unwrap().unwrap();
        assert_eq!(row.deployment_id, d2.id);
        assert_eq!(row.instances.len(), 3);

        // Zero rollover grace: the retirement task fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let old_instances = f.store.instances_by_deployment(&d1.id).unwrap();
        assert_eq!(old_instances.len(), 3);
        assert!(
            old_instances
                .iter()
                .all(|i| i.state == InstanceState::Terminating)
        );
        assert_eq!(f.agent.stopped_ids().len(), 3);
    }

    #[tokio::test]
    async fn rebuild_runs_scans_deploying() {
        let f = fixture();
        let d = f.deployment("proj-a", 3);
        f.store
            .deployment_set_status(&d.id, DeploymentStatus::Deploying, None)
            .unwrap();

        let rebuilt = f.engine.rebuild_runs().await.unwrap();
        assert_eq!(rebuilt, 1);
        let runs = f.engine.active_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].deployment_id, d.id);
    }
}
