//! Applies casts from the engine to the local driver
//!
//! Every cast carries the whole load balancer graph. The worker's cache is
//! replaced with it before the driver runs, so drivers read the same tree
//! the engine holds.

use std::sync::Arc;

use tracing::{debug, info};

use lbaas_engine::agent::rpc::Cast;
use lbaas_engine::driver::Dispatchable;
use lbaas_engine::model::{Entity, EntityKind};
use lbaas_engine::network::InMemoryNetwork;
use lbaas_engine::store::{InMemoryStore, ObjectStore};
use lbaas_engine::{LbaasError, ProviderDriver, RequestContext, Result};

pub struct CastProcessor {
    store: Arc<InMemoryStore>,
    network: Arc<InMemoryNetwork>,
    driver: Arc<dyn ProviderDriver>,
}

fn unsupported(method: &str) -> LbaasError {
    LbaasError::BadRequest(format!("unsupported cast method {}", method))
}

async fn apply<T: Dispatchable>(
    driver: &dyn ProviderDriver,
    ctx: &RequestContext,
    method: &str,
    op: &str,
    obj: T,
    previous: Option<Entity>,
) -> Result<()> {
    let manager = T::manager(driver);
    match op {
        "create" => manager.create(ctx, &obj).await,
        "update" => {
            let old = previous.and_then(T::from_entity).unwrap_or_else(|| obj.clone());
            manager.update(ctx, &old, &obj).await
        }
        "delete" => manager.delete(ctx, &obj).await,
        _ => Err(unsupported(method)),
    }
}

impl CastProcessor {
    pub fn new(store: Arc<InMemoryStore>, network: Arc<InMemoryNetwork>, driver: Arc<dyn ProviderDriver>) -> Self {
        Self { store, network, driver }
    }

    /// Replace the cached graph with the cast one, returning the entity as it was cached
    async fn cache(&self, cast: &Cast) -> Result<Option<Entity>> {
        if let Some(subnet) = &cast.vip_subnet {
            self.network.add_subnet(subnet.clone()).await;
        }
        if let Some(port) = &cast.vip_port {
            self.network.add_port(port.clone()).await;
        }

        let previous = match self.store.get_entity(cast.entity.kind(), cast.entity.id()).await {
            Ok(entity) => Some(entity),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match self
            .store
            .delete_entity(EntityKind::LoadBalancer, &cast.loadbalancer.id)
            .await
        {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.store
            .upsert_entity(cast.loadbalancer.clone().into())
            .await?;
        Ok(previous)
    }

    pub async fn handle(&self, cast: Cast) -> Result<()> {
        let previous = self.cache(&cast).await?;
        let ctx = RequestContext::new(cast.loadbalancer.project_id.clone());
        let op = cast.operation().to_string();
        let driver = self.driver.as_ref();
        info!(
            method = %cast.method,
            lb_id = %cast.loadbalancer.id,
            entity_id = %cast.entity.id(),
            "Applying cast"
        );

        let lb_ops = driver.load_balancer();
        if op == "refresh" {
            return lb_ops.refresh(&ctx, &cast.loadbalancer).await;
        }

        match cast.entity {
            Entity::LoadBalancer(lb) => match op.as_str() {
                "create" => lb_ops.create(&ctx, &lb).await,
                "update" => {
                    let old = previous
                        .and_then(|e| e.as_loadbalancer().cloned())
                        .unwrap_or_else(|| lb.clone());
                    lb_ops.update(&ctx, &old, &lb).await
                }
                "delete" => {
                    let has_children = !lb.listeners.is_empty() || !lb.pools.is_empty();
                    if has_children && driver.capabilities().deletes_cascade {
                        debug!(lb_id = %lb.id, "Deleting with children");
                        lb_ops.delete_cascade(&ctx, &lb).await
                    } else {
                        lb_ops.delete(&ctx, &lb).await
                    }
                }
                _ => Err(unsupported(&cast.method)),
            },
            Entity::Listener(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
            Entity::Pool(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
            Entity::Member(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
            Entity::HealthMonitor(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
            Entity::L7Policy(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
            Entity::L7Rule(e) => apply(driver, &ctx, &cast.method, &op, e, previous).await,
        }
    }
}
