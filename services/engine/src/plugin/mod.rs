//! Operation dispatcher
//!
//! Validates requests, marks entities pending, and hands a fresh snapshot
//! to the provider driver owning the load balancer. Drivers report back
//! through the [`Finalizer`]; the dispatcher never writes terminal statuses
//! itself except when an operation is rejected after its rows were written.

pub mod finalizer;
pub mod validate;

pub use finalizer::{StoreFinalizer, VIP_DEVICE_OWNER};
pub use validate::Validate;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::certificates::{service_url, CertManager, SERVICE_NAME};
use crate::context::RequestContext;
use crate::driver::{Dispatchable, DriverRegistry, Finalizer, ProviderDriver};
use crate::error::{LbaasError, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    EntityKind, Listener, LoadBalancer, LoadBalancerStats, ManagedEntity, OperatingStatus,
    ProvisioningStatus,
};
use crate::network::{NetworkApi, PortRequest};
use crate::store::ObjectStore;

pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    finalizer: Arc<dyn Finalizer>,
    registry: DriverRegistry,
    cert_manager: Option<Arc<dyn CertManager>>,
    locks: KeyedLocks,
}

fn ensure_not_pending(lb: &LoadBalancer) -> Result<()> {
    if lb.provisioning_status.is_pending() {
        return Err(LbaasError::Conflict(format!(
            "load balancer {} is {}",
            lb.id, lb.provisioning_status
        )));
    }
    Ok(())
}

fn mark_graph_pending_create(lb: &mut LoadBalancer) {
    lb.provisioning_status = ProvisioningStatus::PendingCreate;
    lb.operating_status = OperatingStatus::Offline;
    for listener in &mut lb.listeners {
        listener.provisioning_status = ProvisioningStatus::PendingCreate;
        listener.operating_status = OperatingStatus::Offline;
        for policy in &mut listener.l7_policies {
            policy.provisioning_status = ProvisioningStatus::PendingCreate;
            for rule in &mut policy.rules {
                rule.provisioning_status = ProvisioningStatus::PendingCreate;
            }
        }
    }
    for pool in &mut lb.pools {
        pool.provisioning_status = ProvisioningStatus::PendingCreate;
        pool.operating_status = OperatingStatus::Offline;
        for member in &mut pool.members {
            member.provisioning_status = ProvisioningStatus::PendingCreate;
            member.operating_status = OperatingStatus::Offline;
        }
        if let Some(hm) = &mut pool.healthmonitor {
            hm.provisioning_status = ProvisioningStatus::PendingCreate;
        }
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        network: Arc<dyn NetworkApi>,
        finalizer: Arc<dyn Finalizer>,
        registry: DriverRegistry,
    ) -> Self {
        Self {
            store,
            network,
            finalizer,
            registry,
            cert_manager: None,
            locks: KeyedLocks::new(),
        }
    }

    /// Register load balancers as consumers of the TLS containers they use
    pub fn with_cert_manager(mut self, cert_manager: Arc<dyn CertManager>) -> Self {
        self.cert_manager = Some(cert_manager);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    async fn reload<T: ManagedEntity>(&self, id: &str) -> Result<T> {
        let entity = self.store.get_entity(T::KIND, id).await?;
        T::from_entity(entity)
            .ok_or_else(|| LbaasError::ModelMap(format!("{} {} has the wrong kind", T::KIND, id)))
    }

    async fn allocate_vip(&self, lb: &mut LoadBalancer) -> Result<bool> {
        if let Some(port_id) = &lb.vip_port_id {
            let port = self.network.get_port(port_id).await?;
            if lb.vip_address.is_none() {
                lb.vip_address = port.first_ip().map(|ip| ip.ip_address.clone());
            }
            return Ok(false);
        }
        let port = self
            .network
            .create_port(PortRequest {
                name: format!("loadbalancer-{}", lb.id),
                subnet_id: lb.vip_subnet_id.clone(),
                ip_address: lb.vip_address.clone(),
                device_owner: VIP_DEVICE_OWNER.to_string(),
                device_id: lb.id.clone(),
                project_id: lb.project_id.clone(),
            })
            .await?;
        info!(lb_id = %lb.id, port_id = %port.id, "Allocated VIP port");
        lb.vip_address = port.first_ip().map(|ip| ip.ip_address.clone());
        lb.vip_port_id = Some(port.id);
        Ok(true)
    }

    async fn register_certs(&self, ctx: &RequestContext, lb_id: &str, containers: &[String]) -> Result<()> {
        let Some(cert_manager) = &self.cert_manager else {
            return Ok(());
        };
        let resource = service_url(lb_id);
        for container in containers {
            cert_manager
                .get_cert(&ctx.project_id, container, &resource, false, SERVICE_NAME)
                .await
                .map_err(|e| {
                    LbaasError::BadRequest(format!("TLS container {} unusable: {}", container, e))
                })?;
        }
        Ok(())
    }

    async fn deregister_certs(&self, ctx: &RequestContext, lb_id: &str, containers: &[String]) {
        let Some(cert_manager) = &self.cert_manager else {
            return;
        };
        let resource = service_url(lb_id);
        for container in containers {
            if let Err(e) = cert_manager
                .delete_cert(&ctx.project_id, container, &resource, SERVICE_NAME)
                .await
            {
                warn!(lb_id = %lb_id, container = %container, error = %e, "Failed to deregister TLS consumer");
            }
        }
    }

    async fn reject_after_write(&self, ctx: &RequestContext, entity: crate::model::Entity, error: LbaasError) -> LbaasError {
        if let Err(e) = self.finalizer.failed_completion(ctx, &entity).await {
            warn!(kind = %entity.kind(), id = %entity.id(), error = %e, "Failed to record rejection");
        }
        error
    }

    pub async fn create_loadbalancer(&self, ctx: &RequestContext, lb: LoadBalancer) -> Result<LoadBalancer> {
        let _guard = self.locks.lock(&lb.id).await;
        let driver = self.registry.resolve(&lb)?;
        let caps = driver.capabilities();
        lb.validate(&caps)?;
        match self.store.get_loadbalancer(&lb.id).await {
            Ok(_) => {
                return Err(LbaasError::Conflict(format!("load balancer {} already exists", lb.id)));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut lb = lb;
        lb.provider = Some(driver.name().to_string());
        mark_graph_pending_create(&mut lb);
        let allocated = if caps.allocates_vip {
            false
        } else {
            self.allocate_vip(&mut lb).await?
        };

        if let Err(e) = self.store.upsert_entity(lb.clone().into()).await {
            if allocated {
                if let Some(port_id) = &lb.vip_port_id {
                    if let Err(err) = self.network.delete_port(port_id).await {
                        warn!(lb_id = %lb.id, error = %err, "Failed to release VIP port");
                    }
                }
            }
            return Err(e);
        }

        let snapshot = self.store.get_loadbalancer(&lb.id).await?;
        if let Err(e) = self.register_certs(ctx, &lb.id, &snapshot.tls_container_ids()).await {
            return Err(self.reject_after_write(ctx, snapshot.into(), e).await);
        }

        info!(lb_id = %snapshot.id, provider = %driver.name(), "Creating load balancer");
        let manager = driver.load_balancer();
        if caps.allocates_vip {
            manager.create_and_allocate_vip(ctx, &snapshot).await?;
        } else {
            manager.create(ctx, &snapshot).await?;
        }
        self.current_or(&snapshot).await
    }

    async fn current_or(&self, snapshot: &LoadBalancer) -> Result<LoadBalancer> {
        match self.store.get_loadbalancer(&snapshot.id).await {
            Err(e) if e.is_not_found() => Ok(snapshot.clone()),
            other => other,
        }
    }

    pub async fn update_loadbalancer(&self, ctx: &RequestContext, lb: LoadBalancer) -> Result<LoadBalancer> {
        let _guard = self.locks.lock(&lb.id).await;
        let old = self.store.get_loadbalancer(&lb.id).await?;
        ensure_not_pending(&old)?;
        let driver = self.registry.resolve(&old)?;

        let mut new = lb;
        new.vip_address = old.vip_address.clone();
        new.vip_port_id = old.vip_port_id.clone();
        new.vip_subnet_id = old.vip_subnet_id.clone();
        new.provider = old.provider.clone();
        new.operating_status = old.operating_status;
        new.provisioning_status = ProvisioningStatus::PendingUpdate;
        self.store.upsert_entity(new.into()).await?;

        let snapshot = self.store.get_loadbalancer(&old.id).await?;
        driver.load_balancer().update(ctx, &old, &snapshot).await?;
        self.current_or(&snapshot).await
    }

    /// Delete a load balancer; with `cascade` its whole graph goes too
    pub async fn delete_loadbalancer(&self, ctx: &RequestContext, id: &str, cascade: bool) -> Result<()> {
        let guard = self.locks.lock(id).await;
        let lb = self.store.get_loadbalancer(id).await?;
        ensure_not_pending(&lb)?;
        let driver = self.registry.resolve(&lb)?;
        let caps = driver.capabilities();

        let has_children = !lb.listeners.is_empty() || !lb.pools.is_empty();
        if cascade && !caps.deletes_cascade {
            return Err(LbaasError::BadRequest(format!(
                "provider {} does not support cascade delete",
                driver.name()
            )));
        }
        if has_children && !cascade {
            return Err(LbaasError::Conflict(format!(
                "load balancer {} still has listeners or pools",
                id
            )));
        }

        let containers = lb.tls_container_ids();
        for (kind, child_id, _) in lb.descendants() {
            self.store
                .update_status(kind, child_id, Some(ProvisioningStatus::PendingDelete), None)
                .await?;
        }
        self.store
            .update_status(EntityKind::LoadBalancer, id, Some(ProvisioningStatus::PendingDelete), None)
            .await?;
        let snapshot = self.store.get_loadbalancer(id).await?;

        info!(lb_id = %id, cascade, provider = %driver.name(), "Deleting load balancer");
        if cascade {
            driver.load_balancer().delete_cascade(ctx, &snapshot).await?;
        } else {
            driver.load_balancer().delete(ctx, &snapshot).await?;
        }
        self.deregister_certs(ctx, id, &containers).await;

        drop(guard);
        self.locks.forget(id);
        Ok(())
    }

    /// Re-realize a load balancer; driver failures are logged only
    pub async fn refresh_loadbalancer(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let lb = self.store.get_loadbalancer(id).await?;
        let driver = self.registry.resolve(&lb)?;
        if let Err(e) = driver.load_balancer().refresh(ctx, &lb).await {
            warn!(lb_id = %id, error = %e, "Refresh failed");
        }
        Ok(())
    }

    /// Fresh counters from the driver, persisted; empty when the driver fails
    pub async fn loadbalancer_stats(&self, ctx: &RequestContext, id: &str) -> Result<LoadBalancerStats> {
        let lb = self.store.get_loadbalancer(id).await?;
        let driver = self.registry.resolve(&lb)?;
        match driver.load_balancer().stats(ctx, &lb).await {
            Ok(stats) => {
                self.store.update_loadbalancer_stats(id, stats.clone()).await?;
                Ok(stats)
            }
            Err(e) => {
                warn!(lb_id = %id, error = %e, "Stats collection failed");
                Ok(LoadBalancerStats::default())
            }
        }
    }

    async fn driver_for(&self, lb_id: &str) -> Result<(LoadBalancer, Arc<dyn ProviderDriver>)> {
        let lb = self.store.get_loadbalancer(lb_id).await?;
        ensure_not_pending(&lb)?;
        let driver = self.registry.resolve(&lb)?;
        Ok((lb, driver))
    }

    async fn mark_root_pending(&self, lb_id: &str) -> Result<()> {
        self.store
            .update_status(
                EntityKind::LoadBalancer,
                lb_id,
                Some(ProvisioningStatus::PendingUpdate),
                None,
            )
            .await
    }

    fn listener_containers<T: ManagedEntity>(obj: &T) -> Vec<String> {
        match obj.clone().into_entity() {
            crate::model::Entity::Listener(listener) => Listener::tls_container_ids(&listener),
            _ => Vec::new(),
        }
    }

    pub async fn create<T: Dispatchable + Validate>(&self, ctx: &RequestContext, obj: T) -> Result<T> {
        let lb_id = obj.loadbalancer_id().to_string();
        let _guard = self.locks.lock(&lb_id).await;
        let (_, driver) = self.driver_for(&lb_id).await?;
        obj.validate(&driver.capabilities())?;

        let mut obj = obj;
        obj.set_provisioning_status(ProvisioningStatus::PendingCreate);
        self.store.upsert_entity(obj.clone().into_entity()).await?;
        self.mark_root_pending(&lb_id).await?;
        let stored: T = self.reload(obj.id()).await?;

        let containers = Self::listener_containers(&stored);
        if let Err(e) = self.register_certs(ctx, &lb_id, &containers).await {
            return Err(self.reject_after_write(ctx, stored.into_entity(), e).await);
        }

        debug!(kind = %T::KIND, id = %stored.id(), lb_id = %lb_id, "Dispatching create");
        T::manager(driver.as_ref()).create(ctx, &stored).await?;
        match self.reload(stored.id()).await {
            Err(e) if e.is_not_found() => Ok(stored),
            other => other,
        }
    }

    pub async fn update<T: Dispatchable + Validate>(&self, ctx: &RequestContext, obj: T) -> Result<T> {
        let lb_id = obj.loadbalancer_id().to_string();
        let _guard = self.locks.lock(&lb_id).await;
        let (_, driver) = self.driver_for(&lb_id).await?;
        let old: T = self.reload(obj.id()).await?;
        if old.loadbalancer_id() != lb_id {
            return Err(LbaasError::BadRequest(format!(
                "{} {} cannot move between load balancers",
                T::KIND,
                obj.id()
            )));
        }
        obj.validate(&driver.capabilities())?;

        let mut new = obj;
        new.set_provisioning_status(ProvisioningStatus::PendingUpdate);
        self.store.upsert_entity(new.clone().into_entity()).await?;
        self.mark_root_pending(&lb_id).await?;
        let stored: T = self.reload(new.id()).await?;

        let added: Vec<String> = Self::listener_containers(&stored)
            .into_iter()
            .filter(|c| !Self::listener_containers(&old).contains(c))
            .collect();
        if let Err(e) = self.register_certs(ctx, &lb_id, &added).await {
            return Err(self.reject_after_write(ctx, stored.into_entity(), e).await);
        }

        debug!(kind = %T::KIND, id = %stored.id(), lb_id = %lb_id, "Dispatching update");
        T::manager(driver.as_ref()).update(ctx, &old, &stored).await?;
        match self.reload(stored.id()).await {
            Err(e) if e.is_not_found() => Ok(stored),
            other => other,
        }
    }

    pub async fn delete<T: Dispatchable>(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let lb_id = self
            .store
            .get_entity(T::KIND, id)
            .await?
            .loadbalancer_id()
            .to_string();
        let _guard = self.locks.lock(&lb_id).await;
        let (_, driver) = self.driver_for(&lb_id).await?;

        self.store
            .update_status(T::KIND, id, Some(ProvisioningStatus::PendingDelete), None)
            .await?;
        self.mark_root_pending(&lb_id).await?;
        let stored: T = self.reload(id).await?;
        let containers = Self::listener_containers(&stored);

        debug!(kind = %T::KIND, id = %id, lb_id = %lb_id, "Dispatching delete");
        T::manager(driver.as_ref()).delete(ctx, &stored).await?;
        self.deregister_certs(ctx, &lb_id, &containers).await;
        Ok(())
    }
}
