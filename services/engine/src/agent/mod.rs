//! Agent-backed driver
//!
//! Each operation resolves the agent hosting the load balancer, casts the
//! entity together with the stored LB graph, and returns with the entity
//! still pending. The agent reports the outcome on the status callback.

pub mod rpc;
pub mod scheduler;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::driver::{
    Completion, CompletionGuard, DriverCapabilities, EntityManager, Finalizer, LoadBalancerManager,
    ProviderDriver,
};
use crate::error::Result;
use crate::model::{
    Entity, HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats,
    ManagedEntity, Member, Pool,
};
use crate::network::NetworkApi;
use crate::store::ObjectStore;

use rpc::{AgentCast, Cast};
use scheduler::{AgentRegistry, Scheduler};

pub const DRIVER_NAME: &str = "agent";

/// Fill in the VIP port and subnet when the network knows them
pub(crate) async fn attach_network(network: &dyn NetworkApi, cast: Cast) -> Cast {
    let lb = &cast.loadbalancer;
    let port = match lb.vip_port_id.as_deref() {
        Some(port_id) => match network.get_port(port_id).await {
            Ok(port) => Some(port),
            Err(e) => {
                warn!(lb_id = %lb.id, port_id = %port_id, error = %e, "VIP port lookup failed");
                None
            }
        },
        None => None,
    };
    let subnet = network.get_subnet(&lb.vip_subnet_id).await.ok();
    cast.with_network(port, subnet)
}

pub struct AgentCore {
    registry: Arc<AgentRegistry>,
    scheduler: Arc<dyn Scheduler>,
    rpc: Arc<dyn AgentCast>,
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    finalizer: Arc<dyn Finalizer>,
}

impl AgentCore {
    pub fn new(
        registry: Arc<AgentRegistry>,
        scheduler: Arc<dyn Scheduler>,
        rpc: Arc<dyn AgentCast>,
        store: Arc<dyn ObjectStore>,
        network: Arc<dyn NetworkApi>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            rpc,
            store,
            network,
            finalizer,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    async fn deliver(&self, cast: Cast) -> Result<()> {
        let agent = self
            .registry
            .schedule(&cast.loadbalancer.id, self.scheduler.as_ref())?;
        let cast = attach_network(self.network.as_ref(), cast).await;
        self.rpc.cast(&agent.address, &cast).await?;
        info!(
            lb_id = %cast.loadbalancer.id,
            host = %agent.host,
            method = %cast.method,
            "Cast delivered"
        );
        Ok(())
    }

    /// Cast `op` for `entity`; the guard is handed to the agent on success
    async fn cast(
        &self,
        ctx: &RequestContext,
        op: &str,
        entity: Entity,
        loadbalancer: LoadBalancer,
        completion: Completion,
    ) -> Result<()> {
        let guard = CompletionGuard::new(self.finalizer.clone(), ctx, entity.clone(), completion);
        match self.deliver(Cast::new(op, entity, loadbalancer)).await {
            Ok(()) => {
                guard.defer();
                Ok(())
            }
            Err(e) => {
                guard.fail().await;
                Err(e)
            }
        }
    }

    async fn cast_child(&self, ctx: &RequestContext, op: &str, entity: Entity, completion: Completion) -> Result<()> {
        let lb = self.store.get_loadbalancer(entity.loadbalancer_id()).await?;
        self.cast(ctx, op, entity, lb, completion).await
    }
}

pub struct LoadBalancerOps {
    core: Arc<AgentCore>,
}

#[async_trait]
impl LoadBalancerManager for LoadBalancerOps {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core
            .cast(ctx, "create", lb.clone().into(), lb.clone(), Completion::lb_create())
            .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
        self.core
            .cast(ctx, "update", new.clone().into(), new.clone(), Completion::default())
            .await
    }

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core
            .cast(ctx, "delete", lb.clone().into(), lb.clone(), Completion::delete())
            .await?;
        self.core.registry.unbind(&lb.id);
        Ok(())
    }

    async fn delete_cascade(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        LoadBalancerManager::delete(self, ctx, lb).await
    }

    async fn refresh(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core.deliver(Cast::refresh(lb.clone())).await
    }

    async fn stats(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<LoadBalancerStats> {
        debug!(lb_id = %lb.id, "Serving agent-reported stats");
        self.core.store.get_loadbalancer_stats(&lb.id).await
    }
}

pub struct ChildOps<T> {
    core: Arc<AgentCore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> ChildOps<T> {
    fn new(core: Arc<AgentCore>) -> Self {
        Self {
            core,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: ManagedEntity> EntityManager<T> for ChildOps<T> {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        self.core
            .cast_child(ctx, "create", obj.clone().into_entity(), Completion::default())
            .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &T, new: &T) -> Result<()> {
        self.core
            .cast_child(ctx, "update", new.clone().into_entity(), Completion::default())
            .await
    }

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        self.core
            .cast_child(ctx, "delete", obj.clone().into_entity(), Completion::delete())
            .await
    }
}

pub struct AgentDriver {
    core: Arc<AgentCore>,
    load_balancer: LoadBalancerOps,
    listener: ChildOps<Listener>,
    pool: ChildOps<Pool>,
    member: ChildOps<Member>,
    health_monitor: ChildOps<HealthMonitor>,
    l7_policy: ChildOps<L7Policy>,
    l7_rule: ChildOps<L7Rule>,
}

impl AgentDriver {
    pub fn new(core: AgentCore) -> Self {
        let core = Arc::new(core);
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

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }
}

impl ProviderDriver for AgentDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            allows_create_graph: true,
            allocates_vip: false,
            allows_healthmonitor_thresholds: false,
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

#[cfg(test)]
mod tests {
    use super::rpc::MockAgentCast;
    use super::scheduler::{Heartbeat, LeastLoadedScheduler};
    use super::*;
    use crate::completion::events::StatusPayload;
    use crate::completion::EventHandler;
    use crate::driver::DriverRegistry;
    use crate::error::{LbaasError, RestFailure};
    use crate::model::{fixtures, EntityKind, ProvisioningStatus};
    use crate::network::{InMemoryNetwork, Subnet};
    use crate::plugin::{Dispatcher, StoreFinalizer};
    use crate::store::InMemoryStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// Records every cast instead of sending it
    #[derive(Default)]
    struct RecordingCast {
        casts: Mutex<Vec<(String, Cast)>>,
    }

    impl RecordingCast {
        fn casts(&self) -> Vec<(String, Cast)> {
            self.casts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentCast for RecordingCast {
        async fn cast(&self, address: &str, cast: &Cast) -> Result<()> {
            self.casts
                .lock()
                .unwrap()
                .push((address.to_string(), cast.clone()));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        registry: Arc<AgentRegistry>,
        dispatcher: Dispatcher,
        events: EventHandler,
    }

    async fn harness(rpc: Arc<dyn AgentCast>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let network = Arc::new(InMemoryNetwork::new());
        network
            .add_subnet(Subnet {
                id: fixtures::SUBNET_ID.into(),
                network_id: "sample_network_id".into(),
                cidr: "10.0.0.0/24".into(),
                gateway_ip: Some("10.0.0.1".into()),
            })
            .await;
        let finalizer: Arc<dyn Finalizer> =
            Arc::new(StoreFinalizer::new(store.clone()).with_network(network.clone()));
        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(75)));
        registry.report_state(Heartbeat {
            host: "agent-1".into(),
            address: "127.0.0.1:9100".into(),
        });
        let driver = AgentDriver::new(AgentCore::new(
            registry.clone(),
            Arc::new(LeastLoadedScheduler),
            rpc,
            store.clone(),
            network.clone(),
            finalizer.clone(),
        ));
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(driver));
        let dispatcher = Dispatcher::new(store.clone(), network, finalizer.clone(), drivers);
        let events = EventHandler::new(store.clone(), finalizer);
        Harness {
            store,
            registry,
            dispatcher,
            events,
        }
    }

    fn new_lb() -> LoadBalancer {
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        lb.vip_address = None;
        lb
    }

    fn active() -> StatusPayload {
        StatusPayload {
            provisioning_status: Some(ProvisioningStatus::Active),
            operating_status: None,
        }
    }

    #[tokio::test]
    async fn test_create_casts_graph_and_waits_for_agent() {
        let rpc = Arc::new(RecordingCast::default());
        let h = harness(rpc.clone()).await;
        let ctx = RequestContext::new(fixtures::PROJECT_ID);

        let lb = h.dispatcher.create_loadbalancer(&ctx, new_lb()).await.unwrap();
        let stored = h.store.get_loadbalancer(&lb.id).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::PendingCreate);

        let casts = rpc.casts();
        assert_eq!(casts.len(), 1);
        let (address, cast) = &casts[0];
        assert_eq!(address, "127.0.0.1:9100");
        assert_eq!(cast.method, "create_loadbalancer");
        assert_eq!(cast.loadbalancer.listeners.len(), 1);
        let port = cast.vip_port.as_ref().expect("VIP port attached");
        assert_eq!(Some(&port.id), stored.vip_port_id.as_ref());
        assert_eq!(cast.vip_subnet.as_ref().map(|s| s.id.as_str()), Some(fixtures::SUBNET_ID));
        assert_eq!(h.registry.binding(&lb.id).as_deref(), Some("agent-1"));

        h.events
            .apply_status(&ctx, EntityKind::LoadBalancer, &lb.id, active())
            .await
            .unwrap();
        let stored = h.store.get_loadbalancer(&lb.id).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_child_cast_carries_current_graph() {
        let rpc = Arc::new(RecordingCast::default());
        let h = harness(rpc.clone()).await;
        let ctx = RequestContext::new(fixtures::PROJECT_ID);
        let lb = h.dispatcher.create_loadbalancer(&ctx, new_lb()).await.unwrap();
        h.events
            .apply_status(&ctx, EntityKind::LoadBalancer, &lb.id, active())
            .await
            .unwrap();

        let member = fixtures::member("sample_member_id_3", "10.0.0.9");
        h.dispatcher.create(&ctx, member).await.unwrap();

        let casts = rpc.casts();
        let (_, cast) = casts.last().unwrap();
        assert_eq!(cast.method, "create_member");
        assert_eq!(cast.entity.id(), "sample_member_id_3");
        assert_eq!(cast.loadbalancer.pools[0].members.len(), 3);

        assert_ok!(
            h.events
                .apply_status(&ctx, EntityKind::Member, "sample_member_id_3", active())
                .await
        );
        let stored = h.store.get_loadbalancer(&lb.id).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Active);
        let member = h
            .store
            .get_entity(EntityKind::Member, "sample_member_id_3")
            .await
            .unwrap();
        assert!(matches!(member, Entity::Member(m) if m.provisioning_status == ProvisioningStatus::Active));
    }

    #[tokio::test]
    async fn test_failed_cast_marks_error() {
        let mut rpc = MockAgentCast::new();
        rpc.expect_cast()
            .times(1)
            .returning(|_, _| Err(RestFailure::connect("connection refused").into()));
        let h = harness(Arc::new(rpc)).await;
        let ctx = RequestContext::new(fixtures::PROJECT_ID);

        let err = h.dispatcher.create_loadbalancer(&ctx, new_lb()).await.unwrap_err();
        assert!(matches!(err, LbaasError::Rest(_)));
        let stored = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Error);
    }

    #[tokio::test]
    async fn test_no_live_agent_is_unavailable() {
        let rpc = Arc::new(RecordingCast::default());
        let h = harness(rpc.clone()).await;
        h.registry.report_state_at(
            Heartbeat {
                host: "agent-1".into(),
                address: "127.0.0.1:9100".into(),
            },
            chrono::Utc::now() - chrono::Duration::seconds(600),
        );
        let ctx = RequestContext::new(fixtures::PROJECT_ID);

        let err = assert_err!(h.dispatcher.create_loadbalancer(&ctx, new_lb()).await);
        assert!(matches!(err, LbaasError::ServiceUnavailable(_)));
        assert!(rpc.casts().is_empty());
        let stored = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Error);
    }

    #[tokio::test]
    async fn test_delete_unbinds_and_refresh_reuses_binding() {
        let rpc = Arc::new(RecordingCast::default());
        let h = harness(rpc.clone()).await;
        let ctx = RequestContext::new(fixtures::PROJECT_ID);
        let lb = h.dispatcher.create_loadbalancer(&ctx, new_lb()).await.unwrap();
        h.events
            .apply_status(&ctx, EntityKind::LoadBalancer, &lb.id, active())
            .await
            .unwrap();

        assert_ok!(h.dispatcher.refresh_loadbalancer(&ctx, &lb.id).await);
        assert_eq!(rpc.casts().last().unwrap().1.method, "refresh_loadbalancer");

        h.dispatcher
            .delete_loadbalancer(&ctx, &lb.id, true)
            .await
            .unwrap();
        assert_eq!(rpc.casts().last().unwrap().1.method, "delete_loadbalancer");
        assert!(h.registry.binding(&lb.id).is_none());

        h.events
            .apply_status(
                &ctx,
                EntityKind::LoadBalancer,
                &lb.id,
                StatusPayload {
                    provisioning_status: Some(ProvisioningStatus::Deleted),
                    operating_status: None,
                },
            )
            .await
            .unwrap();
        assert!(h.store.get_loadbalancer(&lb.id).await.unwrap_err().is_not_found());
    }
}
