//! nimbus-routing — the routing cache projector.
//!
//! A derived view: for each customer domain, the set of backend
//! instance addresses edge proxies must send traffic to. The projector
//! recomputes a domain's row from store state and overwrites it in a
//! single upsert, so a reader sees either the complete old backend set
//! or the complete new one — never a mix. Concurrent writers for the
//! same domain serialize through the store; last writer wins.

use tracing::{debug, info};

use nimbus_store::{Deployment, DeploymentStatus, InstanceState, RoutingCacheEntry, Store, StoreResult};

/// Rebuilds `domain → {deployment, [instance IPs]}` rows.
#[derive(Clone)]
pub struct Projector {
    store: Store,
}

/// Counters from a full rebuild.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub domains_synced: u32,
    pub backends_total: u32,
    pub domains_removed: u32,
}

impl Projector {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Recompute and overwrite one deployment's routing row.
    ///
    /// Backends are the deployment's instances in `creating` or
    /// `running` — instances the agent is about to bring up count, so
    /// a fresh rollover points at the new revision before the first
    /// health report lands. The IP list is sorted for stable output.
    pub fn refresh(&self, deployment: &Deployment) -> StoreResult<RoutingCacheEntry> {
        let mut ips: Vec<String> = self
            .store
            .instances_by_deployment(&deployment.id)?
            .into_iter()
            .filter(|i| matches!(i.state, InstanceState::Creating | InstanceState::Running))
            .map(|i| i.ip_address)
            .collect();
        ips.sort();

        debug!(
            domain = %deployment.deployment_url,
            deployment = %deployment.id,
            backends = ips.len(),
            "routing row refreshed"
        );
        self.store
            .routing_cache_upsert(&deployment.deployment_url, &deployment.id, ips)
    }

    /// Full rebuild: refresh every `active` deployment's row and drop
    /// rows for domains no active deployment claims. Used at startup
    /// and after mass instance-state changes.
    pub fn sync_active(&self) -> StoreResult<SyncStats> {
        let active = self.store.deployments_by_status(DeploymentStatus::Active)?;
        let mut stats = SyncStats::default();

        for deployment in &active {
            let entry = self.refresh(deployment)?;
            stats.domains_synced += 1;
            stats.backends_total += entry.instances.len() as u32;
        }

        let claimed: Vec<&str> = active.iter().map(|d| d.deployment_url.as_str()).collect();
        for row in self.store.routing_cache_all()? {
            if !claimed.contains(&row.domain.as_str()) {
                self.store.routing_cache_delete(&row.domain)?;
                stats.domains_removed += 1;
            }
        }

        info!(
            domains = stats.domains_synced,
            backends = stats.backends_total,
            removed = stats.domains_removed,
            "routing cache sync complete"
        );
        Ok(stats)
    }
}
