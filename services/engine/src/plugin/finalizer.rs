//! Store-backed finalizer
//!
//! The only writer of status columns. Completions arriving for rows that
//! are already gone are treated as no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::driver::{Completion, Finalizer};
use crate::error::{LbaasError, Result};
use crate::model::{
    Entity, EntityKind, LoadBalancerStats, OperatingStatus, ProvisioningStatus,
};
use crate::network::NetworkApi;
use crate::store::ObjectStore;

/// Device owner stamped on VIP ports allocated by the dispatcher
pub const VIP_DEVICE_OWNER: &str = "neutron:LOADBALANCERV2";

pub struct StoreFinalizer {
    store: Arc<dyn ObjectStore>,
    network: Option<Arc<dyn NetworkApi>>,
}

fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "Finalizing an entity that no longer exists");
            Ok(())
        }
        other => other,
    }
}

impl StoreFinalizer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            network: None,
        }
    }

    /// Release dispatcher-allocated VIP ports when load balancers are removed
    pub fn with_network(mut self, network: Arc<dyn NetworkApi>) -> Self {
        self.network = Some(network);
        self
    }

    async fn release_vip_port(&self, port_id: &str) {
        let Some(network) = &self.network else {
            return;
        };
        match network.get_port(port_id).await {
            Ok(port) if port.device_owner == VIP_DEVICE_OWNER => {
                if let Err(e) = network.delete_port(port_id).await {
                    warn!(port_id = %port_id, error = %e, "Failed to delete VIP port");
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(port_id = %port_id, error = %e, "Failed to look up VIP port"),
        }
    }

    /// A finished graph create also finishes the children created with it
    async fn settle_graph(&self, lb_id: &str) -> Result<()> {
        let lb = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        for (kind, id, status) in lb.descendants() {
            if matches!(
                status,
                ProvisioningStatus::PendingCreate | ProvisioningStatus::PendingUpdate
            ) {
                tolerate_missing(
                    self.store
                        .update_status(
                            kind,
                            id,
                            Some(ProvisioningStatus::Active),
                            Some(OperatingStatus::Online),
                        )
                        .await,
                )?;
            }
        }
        Ok(())
    }

    async fn settle_root(&self, entity: &Entity, status: ProvisioningStatus) -> Result<()> {
        if entity.kind() == EntityKind::LoadBalancer {
            return Ok(());
        }
        tolerate_missing(
            self.store
                .update_status(
                    EntityKind::LoadBalancer,
                    entity.loadbalancer_id(),
                    Some(status),
                    None,
                )
                .await,
        )
    }
}

#[async_trait]
impl Finalizer for StoreFinalizer {
    async fn successful_completion(
        &self,
        _ctx: &RequestContext,
        entity: &Entity,
        completion: Completion,
    ) -> Result<()> {
        let kind = entity.kind();
        let id = entity.id();

        if completion.delete {
            let vip_port = match entity {
                Entity::LoadBalancer(lb) => lb.vip_port_id.clone(),
                _ => None,
            };
            tolerate_missing(self.store.delete_entity(kind, id).await)?;
            if let Some(port_id) = vip_port {
                self.release_vip_port(&port_id).await;
            }
            info!(kind = %kind, id = %id, "Deleted");
            return self.settle_root(entity, ProvisioningStatus::Active).await;
        }

        if completion.lb_create {
            if let Entity::LoadBalancer(lb) = entity {
                if let Some(vip_address) = &lb.vip_address {
                    tolerate_missing(
                        self.store
                            .update_loadbalancer_vip(id, vip_address, lb.vip_port_id.as_deref())
                            .await,
                    )?;
                }
            }
        }

        tolerate_missing(
            self.store
                .update_status(
                    kind,
                    id,
                    Some(ProvisioningStatus::Active),
                    Some(OperatingStatus::Online),
                )
                .await,
        )?;
        info!(kind = %kind, id = %id, "Provisioned ACTIVE");
        if completion.lb_create {
            return self.settle_graph(id).await;
        }
        self.settle_root(entity, ProvisioningStatus::Active).await
    }

    async fn failed_completion(&self, _ctx: &RequestContext, entity: &Entity) -> Result<()> {
        let kind = entity.kind();
        warn!(kind = %kind, id = %entity.id(), lb_id = %entity.loadbalancer_id(), "Provisioning failed");
        tolerate_missing(
            self.store
                .update_status(
                    kind,
                    entity.id(),
                    Some(ProvisioningStatus::Error),
                    Some(OperatingStatus::Error),
                )
                .await,
        )?;
        self.settle_root(entity, ProvisioningStatus::Error).await
    }

    async fn update_status(
        &self,
        _ctx: &RequestContext,
        kind: EntityKind,
        id: &str,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Result<()> {
        tolerate_missing(self.store.update_status(kind, id, provisioning, operating).await)
    }

    async fn update_loadbalancer_stats(
        &self,
        _ctx: &RequestContext,
        lb_id: &str,
        stats: LoadBalancerStats,
    ) -> Result<()> {
        match self.store.update_loadbalancer_stats(lb_id, stats).await {
            Err(LbaasError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }
}
