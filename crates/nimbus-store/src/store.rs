//! Store — redb-backed persistence gateway for the Nimbus control plane.
//!
//! Typed CRUD over regions, nodes, images, deployments, instances, and
//! the routing cache. Every mutation runs in a single write
//! transaction; multi-entity mutations (instance + association,
//! terminated + unlink) share one transaction so the "every live
//! instance belongs to a deployment" invariant can't be observed
//! broken. Uniqueness (region code, node hostname) and state-machine
//! transition rules are re-checked on every write; violations surface
//! as [`StoreError::Conflict`].
//!
//! The gateway never retries — callers decide.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REGIONS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(IMAGES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENT_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(ROUTING_CACHE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn read_one<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn read_all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn write_one<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Next sequential ID with the given prefix, scanning existing keys.
    fn next_id<K: redb::ReadableTable<&'static str, &'static [u8]>>(
        table: &K,
        prefix: &str,
    ) -> StoreResult<String> {
        let mut max = 0u64;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(rest) = key.value().strip_prefix(prefix)
                && let Ok(n) = rest.parse::<u64>()
            {
                max = max.max(n);
            }
        }
        Ok(format!("{prefix}{:06}", max + 1))
    }

    // ── Regions ────────────────────────────────────────────────────

    /// Register a region. The code must be unique.
    pub fn create_region(&self, name: &str, code: &str, country: &str) -> StoreResult<Region> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let region;
        {
            let mut table = txn.open_table(REGIONS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let existing: Region =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if existing.code == code {
                    return Err(StoreError::Conflict(format!(
                        "region code already registered: {code}"
                    )));
                }
            }
            region = Region {
                id: Self::next_id(&table, "reg-")?,
                name: name.to_string(),
                code: code.to_string(),
                country: country.to_string(),
            };
            let bytes = serde_json::to_vec(&region).map_err(map_err!(Serialize))?;
            table
                .insert(region.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(code, id = %region.id, "region created");
        Ok(region)
    }

    /// Get a region by ID.
    pub fn get_region(&self, id: &str) -> StoreResult<Region> {
        self.read_one(REGIONS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("region {id}")))
    }

    /// Look up a region by its unique code.
    pub fn region_by_code(&self, code: &str) -> StoreResult<Region> {
        self.read_all::<Region>(REGIONS)?
            .into_iter()
            .find(|r| r.code == code)
            .ok_or_else(|| StoreError::NotFound(format!("region code {code}")))
    }

    /// List all regions.
    pub fn list_regions(&self) -> StoreResult<Vec<Region>> {
        self.read_all(REGIONS)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a node. The hostname must be unique across the fleet.
    pub fn create_node(
        &self,
        region_id: &str,
        hostname: &str,
        ip_address: &str,
        state: NodeState,
        resources: NodeResources,
    ) -> StoreResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let existing: Node =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if existing.hostname == hostname {
                    return Err(StoreError::Conflict(format!(
                        "hostname already registered: {hostname}"
                    )));
                }
            }
            node = Node {
                id: Self::next_id(&table, "node-")?,
                region_id: region_id.to_string(),
                hostname: hostname.to_string(),
                ip_address: ip_address.to_string(),
                state,
                resources,
                updated_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(node.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(hostname, id = %node.id, "node registered");
        Ok(node)
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> StoreResult<Node> {
        self.read_one(NODES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        self.read_all(NODES)
    }

    /// Worker nodes in `ready` state in the given region — the only
    /// nodes that may receive new instances.
    pub fn nodes_ready_in_region(&self, region_id: &str) -> StoreResult<Vec<Node>> {
        Ok(self
            .read_all::<Node>(NODES)?
            .into_iter()
            .filter(|n| {
                n.region_id == region_id
                    && n.state == NodeState::Ready
                    && n.resources.kind == NodeKind::Worker
            })
            .collect())
    }

    /// Update a node's state, touching `updated_at`.
    pub fn node_set_state(&self, id: &str, state: NodeState) -> StoreResult<Node> {
        let mut node = self.get_node(id)?;
        node.state = state;
        node.updated_at = epoch_secs();
        self.write_one(NODES, id, &node)?;
        Ok(node)
    }

    /// Delete a node. Rejected while any instance on it is still live.
    pub fn delete_node(&self, id: &str) -> StoreResult<()> {
        let live = self
            .read_all::<Instance>(INSTANCES)?
            .into_iter()
            .any(|i| i.node_id == id && !i.state.is_terminal());
        if live {
            return Err(StoreError::Conflict(format!(
                "node {id} still has live instances"
            )));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !existed {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Register an image in `pending` status.
    pub fn create_image(&self, name: &str, repository: ImageRepository) -> StoreResult<Image> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let image;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            image = Image {
                id: Self::next_id(&table, "img-")?,
                name: name.to_string(),
                status: ImageStatus::Pending,
                repository,
                image_size: None,
                image_hash: None,
            };
            let bytes = serde_json::to_vec(&image).map_err(map_err!(Serialize))?;
            table
                .insert(image.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(image)
    }

    /// Get an image by ID.
    pub fn get_image(&self, id: &str) -> StoreResult<Image> {
        self.read_one(IMAGES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("image {id}")))
    }

    /// List all images.
    pub fn list_images(&self) -> StoreResult<Vec<Image>> {
        self.read_all(IMAGES)
    }

    /// Builder result: update status, recording hash and size on success.
    pub fn image_set_status(
        &self,
        id: &str,
        status: ImageStatus,
        image_hash: Option<String>,
        image_size: Option<u64>,
    ) -> StoreResult<Image> {
        let mut image = self.get_image(id)?;
        image.status = status;
        if status == ImageStatus::Ready {
            image.image_hash = image_hash;
            image.image_size = image_size;
        }
        self.write_one(IMAGES, id, &image)?;
        debug!(id, ?status, "image status updated");
        Ok(image)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Declare a deployment in `pending` status.
    pub fn create_deployment(
        &self,
        project_id: &str,
        image_id: &str,
        min_instances: u32,
        deployment_url: &str,
    ) -> StoreResult<Deployment> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            deployment = Deployment {
                id: Self::next_id(&table, "dep-")?,
                project_id: project_id.to_string(),
                image_id: image_id.to_string(),
                status: DeploymentStatus::Pending,
                min_instances,
                deployment_url: deployment_url.to_string(),
                activated_at: None,
                failure_reason: None,
                created_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(deployment.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %deployment.id, project_id, "deployment created");
        Ok(deployment)
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, id: &str) -> StoreResult<Deployment> {
        self.read_one(DEPLOYMENTS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("deployment {id}")))
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StoreResult<Vec<Deployment>> {
        self.read_all(DEPLOYMENTS)
    }

    /// Deployments currently in the given status.
    pub fn deployments_by_status(&self, status: DeploymentStatus) -> StoreResult<Vec<Deployment>> {
        Ok(self
            .read_all::<Deployment>(DEPLOYMENTS)?
            .into_iter()
            .filter(|d| d.status == status)
            .collect())
    }

    /// The project's `active` deployment, if any.
    pub fn active_deployment_for_project(
        &self,
        project_id: &str,
    ) -> StoreResult<Option<Deployment>> {
        Ok(self
            .read_all::<Deployment>(DEPLOYMENTS)?
            .into_iter()
            .find(|d| d.project_id == project_id && d.status == DeploymentStatus::Active))
    }

    /// Transition a deployment's status.
    ///
    /// Enforces the status machine, "at most one active per project",
    /// and the `activated_at ⇔ active` invariant: transitioning to
    /// `active` requires a timestamp, every other status clears it.
    /// Illegal transitions (including duplicate claims of the same
    /// transition) return `Conflict`.
    pub fn deployment_set_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        activated_at: Option<u64>,
    ) -> StoreResult<Deployment> {
        if status == DeploymentStatus::Active && activated_at.is_none() {
            return Err(StoreError::Conflict(
                "active deployment requires activated_at".to_string(),
            ));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut current: Deployment = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StoreError::NotFound(format!("deployment {id}"))),
            };
            if !current.status.can_transition(status) {
                return Err(StoreError::Conflict(format!(
                    "deployment {id}: illegal transition {:?} → {:?}",
                    current.status, status
                )));
            }
            if status == DeploymentStatus::Active {
                // At most one active deployment per project, checked
                // inside the write transaction.
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    if key.value() == id {
                        continue;
                    }
                    let other: Deployment =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if other.project_id == current.project_id
                        && other.status == DeploymentStatus::Active
                    {
                        return Err(StoreError::Conflict(format!(
                            "project {} already has active deployment {}",
                            current.project_id, other.id
                        )));
                    }
                }
            }
            current.status = status;
            current.activated_at = if status == DeploymentStatus::Active {
                activated_at
            } else {
                None
            };
            let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
            deployment = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, ?status, "deployment status updated");
        Ok(deployment)
    }

    /// Mark a deployment `failed`, retaining the human-readable reason.
    pub fn deployment_set_failed(&self, id: &str, reason: &str) -> StoreResult<Deployment> {
        let mut deployment = self.deployment_set_status(id, DeploymentStatus::Failed, None)?;
        deployment.failure_reason = Some(reason.to_string());
        self.write_one(DEPLOYMENTS, id, &deployment)?;
        Ok(deployment)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Create an instance and its deployment association in one
    /// transaction. The store assigns the ID and timestamps; the
    /// caller supplies the allocated IP and placement.
    pub fn create_instance(&self, new: &NewInstance, state: InstanceState) -> StoreResult<Instance> {
        if !matches!(state, InstanceState::Pending | InstanceState::Creating) {
            return Err(StoreError::Conflict(format!(
                "instances start in pending or creating, not {state:?}"
            )));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let now = epoch_secs();
            instance = Instance {
                id: Self::next_id(&instances, "i-")?,
                region_id: new.region_id.clone(),
                node_id: new.node_id.clone(),
                image_id: new.image_id.clone(),
                state,
                resources: new.resources.clone(),
                default_port: new.default_port,
                ip_address: new.ip_address.clone(),
                environment_variables: new.environment_variables.clone(),
                created_at: now,
                updated_at: now,
            };
            let bytes = serde_json::to_vec(&instance).map_err(map_err!(Serialize))?;
            instances
                .insert(instance.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut links = txn
                .open_table(DEPLOYMENT_INSTANCES)
                .map_err(map_err!(Table))?;
            let link_key = format!("{}:{}", new.deployment_id, instance.id);
            links
                .insert(link_key.as_str(), b"".as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            id = %instance.id,
            deployment = %new.deployment_id,
            node = %new.node_id,
            "instance created"
        );
        Ok(instance)
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, id: &str) -> StoreResult<Instance> {
        self.read_one(INSTANCES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("instance {id}")))
    }

    /// List all instances.
    pub fn list_instances(&self) -> StoreResult<Vec<Instance>> {
        self.read_all(INSTANCES)
    }

    /// All instances associated with a deployment.
    pub fn instances_by_deployment(&self, deployment_id: &str) -> StoreResult<Vec<Instance>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let links = txn
            .open_table(DEPLOYMENT_INSTANCES)
            .map_err(map_err!(Table))?;
        let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in links.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(instance_id) = key.value().strip_prefix(&prefix)
                && let Some(guard) = instances.get(instance_id).map_err(map_err!(Read))?
            {
                results
                    .push(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    /// All instances currently in the given state.
    pub fn instances_by_state(&self, state: InstanceState) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read_all::<Instance>(INSTANCES)?
            .into_iter()
            .filter(|i| i.state == state)
            .collect())
    }

    /// All instances placed on the given node.
    pub fn instances_by_node(&self, node_id: &str) -> StoreResult<Vec<Instance>> {
        Ok(self
            .read_all::<Instance>(INSTANCES)?
            .into_iter()
            .filter(|i| i.node_id == node_id)
            .collect())
    }

    /// The deployment an instance belongs to, if it is still linked.
    pub fn deployment_for_instance(&self, instance_id: &str) -> StoreResult<Option<DeploymentId>> {
        let suffix = format!(":{instance_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let links = txn
            .open_table(DEPLOYMENT_INSTANCES)
            .map_err(map_err!(Table))?;
        for entry in links.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(deployment_id) = key.value().strip_suffix(&suffix) {
                return Ok(Some(deployment_id.to_string()));
            }
        }
        Ok(None)
    }

    /// Transition an instance's state, touching `updated_at`.
    ///
    /// Transitions out of a terminal state are rejected. Entering
    /// `terminated` also deletes the deployment association, in the
    /// same transaction.
    pub fn instance_set_state(&self, id: &str, state: InstanceState) -> StoreResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut current: Instance = match instances.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StoreError::NotFound(format!("instance {id}"))),
            };
            if !current.state.can_transition(state) {
                return Err(StoreError::Conflict(format!(
                    "instance {id}: illegal transition {:?} → {:?}",
                    current.state, state
                )));
            }
            current.state = state;
            current.updated_at = epoch_secs();
            let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            instances
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;

            if state == InstanceState::Terminated {
                let mut links = txn
                    .open_table(DEPLOYMENT_INSTANCES)
                    .map_err(map_err!(Table))?;
                let suffix = format!(":{id}");
                let stale: Vec<String> = links
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| {
                        let (key, _) = entry.ok()?;
                        let k = key.value().to_string();
                        k.ends_with(&suffix).then_some(k)
                    })
                    .collect();
                for key in &stale {
                    links.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
            instance = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, ?state, "instance state updated");
        Ok(instance)
    }

    // ── Routing cache ──────────────────────────────────────────────

    /// Overwrite the routing entry for a domain. A single atomic row
    /// write: edge proxies see either the complete old set or the
    /// complete new set.
    pub fn routing_cache_upsert(
        &self,
        domain: &str,
        deployment_id: &str,
        instances: Vec<String>,
    ) -> StoreResult<RoutingCacheEntry> {
        let entry = RoutingCacheEntry {
            domain: domain.to_string(),
            deployment_id: deployment_id.to_string(),
            instances,
            updated_at: epoch_secs(),
        };
        self.write_one(ROUTING_CACHE, domain, &entry)?;
        debug!(domain, deployment_id, backends = entry.instances.len(), "routing cache updated");
        Ok(entry)
    }

    /// Get the routing entry for a domain.
    pub fn routing_cache_get(&self, domain: &str) -> StoreResult<Option<RoutingCacheEntry>> {
        self.read_one(ROUTING_CACHE, domain)
    }

    /// List all routing entries.
    pub fn routing_cache_all(&self) -> StoreResult<Vec<RoutingCacheEntry>> {
        self.read_all(ROUTING_CACHE)
    }

    /// Remove a domain's routing entry. Returns true if it existed.
    pub fn routing_cache_delete(&self, domain: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROUTING_CACHE).map_err(map_err!(Table))?;
            existed = table.remove(domain).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
