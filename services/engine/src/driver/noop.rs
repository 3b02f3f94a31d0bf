//! Logging no-op driver
//!
//! Realizes nothing and finalizes every operation inline. Useful as a
//! provider for API-only deployments and as the synchronous reference for
//! the finalization contract.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{
    finalize_sync, Completion, DriverCapabilities, EntityManager, Finalizer, LoadBalancerManager,
    ProviderDriver,
};
use crate::context::RequestContext;
use crate::error::Result;
use crate::model::{
    HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats, ManagedEntity,
    Member, Pool,
};

pub struct NoopManager<T> {
    finalizer: Arc<dyn Finalizer>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> NoopManager<T> {
    fn new(finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            finalizer,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: ManagedEntity> EntityManager<T> for NoopManager<T> {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        info!(kind = %T::KIND, id = %obj.id(), "noop create");
        let entity = obj.clone().into_entity();
        finalize_sync(self.finalizer.clone(), ctx, entity, Completion::default(), async { Ok(()) })
            .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &T, new: &T) -> Result<()> {
        info!(kind = %T::KIND, id = %new.id(), "noop update");
        let entity = new.clone().into_entity();
        finalize_sync(self.finalizer.clone(), ctx, entity, Completion::default(), async { Ok(()) })
            .await
    }

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        info!(kind = %T::KIND, id = %obj.id(), "noop delete");
        let entity = obj.clone().into_entity();
        finalize_sync(self.finalizer.clone(), ctx, entity, Completion::delete(), async { Ok(()) })
            .await
    }
}

#[async_trait]
impl LoadBalancerManager for NoopManager<LoadBalancer> {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        info!(lb_id = %lb.id, "noop create loadbalancer");
        finalize_sync(
            self.finalizer.clone(),
            ctx,
            lb.clone().into(),
            Completion::lb_create(),
            async { Ok(()) },
        )
        .await
    }

    async fn update(&self, ctx: &RequestContext, old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
        EntityManager::update(self, ctx, old, new).await
    }

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        EntityManager::delete(self, ctx, lb).await
    }

    async fn delete_cascade(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        EntityManager::delete(self, ctx, lb).await
    }

    async fn refresh(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        info!(lb_id = %lb.id, "noop refresh");
        Ok(())
    }

    async fn stats(&self, _ctx: &RequestContext, _lb: &LoadBalancer) -> Result<LoadBalancerStats> {
        Ok(LoadBalancerStats::default())
    }
}

pub struct LoggingNoopDriver {
    name: String,
    capabilities: DriverCapabilities,
    load_balancer: NoopManager<LoadBalancer>,
    listener: NoopManager<Listener>,
    pool: NoopManager<Pool>,
    member: NoopManager<Member>,
    health_monitor: NoopManager<HealthMonitor>,
    l7_policy: NoopManager<L7Policy>,
    l7_rule: NoopManager<L7Rule>,
}

impl LoggingNoopDriver {
    pub fn new(finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            name: "noop".to_string(),
            capabilities: DriverCapabilities {
                allows_create_graph: true,
                allocates_vip: false,
                allows_healthmonitor_thresholds: true,
                deletes_cascade: true,
            },
            load_balancer: NoopManager::new(finalizer.clone()),
            listener: NoopManager::new(finalizer.clone()),
            pool: NoopManager::new(finalizer.clone()),
            member: NoopManager::new(finalizer.clone()),
            health_monitor: NoopManager::new(finalizer.clone()),
            l7_policy: NoopManager::new(finalizer.clone()),
            l7_rule: NoopManager::new(finalizer),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl ProviderDriver for LoggingNoopDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn load_balancer(&self) -> &dyn LoadBalancerManager {
        &self.load_balancer
    }

    fn listener(&self) -> &dyn EntityManager<Listener> {
        &self.listener
    }

    fn pool(&self) -> &dyn EntityManager<Pool> {
        &self.pool
    }

    fn member(&self) -> &dyn EntityManager<Member> {
        &self.member
    }

    fn health_monitor(&self) -> &dyn EntityManager<HealthMonitor> {
        &self.health_monitor
    }

    fn l7_policy(&self) -> &dyn EntityManager<L7Policy> {
        &self.l7_policy
    }

    fn l7_rule(&self) -> &dyn EntityManager<L7Rule> {
        &self.l7_rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::completion::MockFinalizer;
    use crate::driver::DriverRegistry;
    use crate::model::fixtures;

    #[tokio::test]
    async fn test_lb_create_finalizes_with_lb_create_flag() {
        let mut finalizer = MockFinalizer::new();
        finalizer
            .expect_successful_completion()
            .withf(|_, e, c| e.id() == fixtures::LB_ID && c.lb_create && !c.delete)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let driver = LoggingNoopDriver::new(Arc::new(finalizer));
        driver
            .load_balancer()
            .create(&RequestContext::admin(), &fixtures::bare_loadbalancer())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_delete_finalizes_as_delete() {
        let mut finalizer = MockFinalizer::new();
        finalizer
            .expect_successful_completion()
            .withf(|_, e, c| e.id() == fixtures::POOL_ID && c.delete)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let driver = LoggingNoopDriver::new(Arc::new(finalizer));
        driver
            .pool()
            .delete(&RequestContext::admin(), &fixtures::pool())
            .await
            .unwrap();
    }

    #[test]
    fn test_registry_resolution() {
        let finalizer: Arc<dyn Finalizer> = Arc::new(MockFinalizer::new());
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(LoggingNoopDriver::new(finalizer.clone())));
        registry.register(Arc::new(
            LoggingNoopDriver::new(finalizer).with_name("other"),
        ));

        let mut lb = fixtures::bare_loadbalancer();
        assert_eq!(registry.resolve(&lb).unwrap().name(), "noop");
        lb.provider = Some("other".into());
        assert_eq!(registry.resolve(&lb).unwrap().name(), "other");
        lb.provider = Some("missing".into());
        assert!(registry.resolve(&lb).err().unwrap().is_not_found());

        registry.set_default("other").unwrap();
        assert!(registry.set_default("missing").is_err());
        assert_eq!(registry.names(), vec!["noop", "other"]);
    }
}
