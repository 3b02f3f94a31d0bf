//! Provider driver contract
//!
//! A driver exposes one manager per entity kind. The load balancer manager
//! adds refresh and stats, plus the optional entrypoints gated by
//! [`DriverCapabilities`].

pub mod completion;
pub mod noop;

pub use completion::{finalize_sync, Completion, CompletionGuard, Finalizer};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{LbaasError, Result};
use crate::model::{
    HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats, ManagedEntity,
    Member, Pool,
};

/// Optional behaviour a driver declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Accepts a whole LB tree in one create call
    pub allows_create_graph: bool,
    /// Allocates the VIP itself; `create_and_allocate_vip` replaces `create`
    pub allocates_vip: bool,
    /// Honours `max_retries_down` on health monitors
    pub allows_healthmonitor_thresholds: bool,
    /// Removes an LB and all children in a single call
    pub deletes_cascade: bool,
}

#[async_trait]
pub trait EntityManager<T: ManagedEntity>: Send + Sync {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()>;

    async fn update(&self, ctx: &RequestContext, old: &T, new: &T) -> Result<()>;

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()>;
}

#[async_trait]
pub trait LoadBalancerManager: Send + Sync {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()>;

    async fn update(&self, ctx: &RequestContext, old: &LoadBalancer, new: &LoadBalancer)
        -> Result<()>;

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()>;

    /// Called in place of `create` by drivers declaring `allocates_vip`
    async fn create_and_allocate_vip(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        Err(LbaasError::BadRequest(format!(
            "driver cannot allocate a VIP for load balancer {}",
            lb.id
        )))
    }

    /// Called in place of `delete` for cascading deletes by drivers declaring `deletes_cascade`
    async fn delete_cascade(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        Err(LbaasError::BadRequest(format!(
            "driver cannot cascade-delete load balancer {}",
            lb.id
        )))
    }

    /// Re-realize the LB from its current graph
    async fn refresh(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()>;

    async fn stats(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<LoadBalancerStats>;
}

pub trait ProviderDriver: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities;

    fn load_balancer(&self) -> &dyn LoadBalancerManager;

    fn listener(&self) -> &dyn EntityManager<Listener>;

    fn pool(&self) -> &dyn EntityManager<Pool>;

    fn member(&self) -> &dyn EntityManager<Member>;

    fn health_monitor(&self) -> &dyn EntityManager<HealthMonitor>;

    fn l7_policy(&self) -> &dyn EntityManager<L7Policy>;

    fn l7_rule(&self) -> &dyn EntityManager<L7Rule>;
}

/// Child entity kinds routed through a driver's per-kind manager
pub trait Dispatchable: ManagedEntity {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self>;
}

impl Dispatchable for Listener {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.listener()
    }
}

impl Dispatchable for Pool {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.pool()
    }
}

impl Dispatchable for Member {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.member()
    }
}

impl Dispatchable for HealthMonitor {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.health_monitor()
    }
}

impl Dispatchable for L7Policy {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.l7_policy()
    }
}

impl Dispatchable for L7Rule {
    fn manager(driver: &dyn ProviderDriver) -> &dyn EntityManager<Self> {
        driver.l7_rule()
    }
}

/// Drivers keyed by provider name, resolved at startup
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ProviderDriver>>,
    default_provider: Option<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn ProviderDriver>) {
        let name = driver.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.drivers.insert(name, driver);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.drivers.contains_key(name) {
            return Err(LbaasError::not_found("provider", name));
        }
        self.default_provider = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| LbaasError::not_found("provider", name))
    }

    /// Driver selected for a load balancer: its provider, else the default
    pub fn resolve(&self, lb: &LoadBalancer) -> Result<Arc<dyn ProviderDriver>> {
        match lb.provider.as_deref().or(self.default_provider.as_deref()) {
            Some(name) => self.get(name),
            None => Err(LbaasError::ServiceUnavailable("no provider drivers registered".into())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<dyn ProviderDriver>> {
        self.drivers.values()
    }
}
