//! External orchestration driver
//!
//! Forwards every mutation to an orchestrator that does the work
//! asynchronously, then hands the completion to the poll dispatcher, which
//! watches the load balancer until it settles.

pub mod client;
pub mod payload;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::completion::{PollDispatcher, PollHandle};
use crate::config::OctaviaSettings;
use crate::context::RequestContext;
use crate::driver::{
    Completion, CompletionGuard, DriverCapabilities, EntityManager, Finalizer, LoadBalancerManager,
    ProviderDriver,
};
use crate::error::Result;
use crate::model::{
    Entity, HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats, Member,
    Pool,
};
use crate::store::ObjectStore;

use client::OctaviaClient;
use payload::{loadbalancer_create_body, loadbalancer_path, loadbalancer_update_body, Resource};

pub const DRIVER_NAME: &str = "octavia";

pub struct OrchestratorCore {
    settings: OctaviaSettings,
    client: Arc<OctaviaClient>,
    store: Arc<dyn ObjectStore>,
    finalizer: Arc<dyn Finalizer>,
    poller: PollHandle,
}

impl OrchestratorCore {
    /// Issue `request`, then watch the LB until the orchestrator settles it
    async fn submit<F>(
        &self,
        ctx: &RequestContext,
        entity: Entity,
        completion: Completion,
        request: F,
    ) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send,
    {
        let lb_id = entity.loadbalancer_id().to_string();
        let guard = CompletionGuard::new(self.finalizer.clone(), ctx, entity, completion);
        match request.await {
            Ok(()) => {
                self.poller.watch(&lb_id, guard).await;
                Ok(())
            }
            Err(e) => {
                guard.fail().await;
                Err(e)
            }
        }
    }

    async fn parent(&self, lb_id: &str) -> Result<LoadBalancer> {
        self.store.get_loadbalancer(lb_id).await
    }

    async fn create_loadbalancer(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let body = loadbalancer_create_body(lb, true);
        info!(lb_id = %lb.id, graph = !lb.listeners.is_empty(), "Submitting load balancer");
        self.submit(
            ctx,
            lb.clone().into(),
            Completion::lb_create(),
            self.client.post("/v1/loadbalancers", &body),
        )
        .await
    }
}

pub struct LoadBalancerOps {
    core: Arc<OrchestratorCore>,
}

#[async_trait]
impl LoadBalancerManager for LoadBalancerOps {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core.create_loadbalancer(ctx, lb).await
    }

    async fn create_and_allocate_vip(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core.create_loadbalancer(ctx, lb).await
    }

    async fn update(&self, ctx: &RequestContext, _old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
        let body = loadbalancer_update_body(new);
        let path = loadbalancer_path(&new.id);
        self.core
            .submit(ctx, new.clone().into(), Completion::default(), self.core.client.put(&path, &body))
            .await
    }

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let path = loadbalancer_path(&lb.id);
        self.core
            .submit(ctx, lb.clone().into(), Completion::delete(), self.core.client.delete(&path))
            .await
    }

    async fn delete_cascade(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let path = format!("{}/delete_cascade", loadbalancer_path(&lb.id));
        self.core
            .submit(ctx, lb.clone().into(), Completion::delete(), self.core.client.delete(&path))
            .await
    }

    async fn refresh(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        debug!(lb_id = %lb.id, "Refresh is a no-op; the orchestrator owns the realization");
        Ok(())
    }

    async fn stats(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<LoadBalancerStats> {
        // counters arrive on the status topic
        self.core.store.get_loadbalancer_stats(&lb.id).await
    }
}

pub struct ChildOps<T> {
    core: Arc<OrchestratorCore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> ChildOps<T> {
    fn new(core: Arc<OrchestratorCore>) -> Self {
        Self {
            core,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Resource> EntityManager<T> for ChildOps<T> {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        let lb = self.core.parent(obj.loadbalancer_id()).await?;
        let path = obj.collection_path(&lb);
        let body = obj.create_body();
        self.core
            .submit(ctx, obj.clone().into_entity(), Completion::default(), self.core.client.post(&path, &body))
            .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &T, new: &T) -> Result<()> {
        let lb = self.core.parent(new.loadbalancer_id()).await?;
        let path = new.item_path(&lb);
        let body = new.update_body();
        self.core
            .submit(ctx, new.clone().into_entity(), Completion::default(), self.core.client.put(&path, &body))
            .await
    }

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        let lb = self.core.parent(obj.loadbalancer_id()).await?;
        let path = obj.item_path(&lb);
        self.core
            .submit(ctx, obj.clone().into_entity(), Completion::delete(), self.core.client.delete(&path))
            .await
    }
}

pub struct OrchestratorDriver {
    core: Arc<OrchestratorCore>,
    load_balancer: LoadBalancerOps,
    listener: ChildOps<Listener>,
    pool: ChildOps<Pool>,
    member: ChildOps<Member>,
    health_monitor: ChildOps<HealthMonitor>,
    l7_policy: ChildOps<L7Policy>,
    l7_rule: ChildOps<L7Rule>,
}

impl OrchestratorDriver {
    pub fn new(
        settings: OctaviaSettings,
        client: Arc<OctaviaClient>,
        store: Arc<dyn ObjectStore>,
        finalizer: Arc<dyn Finalizer>,
        poller: PollHandle,
    ) -> Self {
        let core = Arc::new(OrchestratorCore {
            settings,
            client,
            store,
            finalizer,
            poller,
        });
        Self {
            load_balancer: LoadBalancerOps { core: core.clone() },
            listener: ChildOps::new(core.clone()),
            pool: ChildOps::new(core.clone()),
            member: ChildOps::new(core.clone()),
            health_monitor: ChildOps::new(core.clone()),
            l7_policy: ChildOps::new(core.clone()),
            l7_rule: ChildOps::new(core.clone()),
            core,
        }
    }

    /// Driver plus the poll dispatcher that must be spawned alongside it,
    /// paced by the configured poll interval and timeout
    pub fn with_poller(
        settings: OctaviaSettings,
        client: Arc<OctaviaClient>,
        store: Arc<dyn ObjectStore>,
        finalizer: Arc<dyn Finalizer>,
    ) -> (Self, PollDispatcher) {
        let (dispatcher, handle) = PollDispatcher::new(
            client.clone(),
            settings.request_poll_interval(),
            settings.request_poll_timeout(),
        );
        (Self::new(settings, client, store, finalizer, handle), dispatcher)
    }
}

impl ProviderDriver for OrchestratorDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            allows_create_graph: true,
            allocates_vip: self.core.settings.allocates_vip,
            allows_healthmonitor_thresholds: true,
            deletes_cascade: true,
        }
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
