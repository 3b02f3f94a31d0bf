//! Agent liveness, LB placement and rescheduling

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerType;
use crate::context::RequestContext;
use crate::driver::Finalizer;
use crate::error::{LbaasError, Result};
use crate::network::NetworkApi;
use crate::store::ObjectStore;

use super::attach_network;
use super::rpc::{AgentCast, Cast};

/// Periodic state report sent by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub host: String,
    /// `host:port` the agent accepts casts on
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    pub host: String,
    pub address: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Known agents and the load balancers bound to them
pub struct AgentRegistry {
    agents: DashMap<String, AgentState>,
    bindings: DashMap<String, String>,
    down_time: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(agent_down_time: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            bindings: DashMap::new(),
            down_time: chrono::Duration::from_std(agent_down_time)
                .unwrap_or_else(|_| chrono::Duration::seconds(75)),
        }
    }

    pub fn report_state(&self, heartbeat: Heartbeat) {
        self.report_state_at(heartbeat, Utc::now());
    }

    pub fn report_state_at(&self, heartbeat: Heartbeat, at: DateTime<Utc>) {
        let revived = self
            .agents
            .get(&heartbeat.host)
            .map(|a| !self.alive_at(&a, at))
            .unwrap_or(true);
        if revived {
            info!(host = %heartbeat.host, address = %heartbeat.address, "Agent is up");
        }
        self.agents.insert(
            heartbeat.host.clone(),
            AgentState {
                host: heartbeat.host,
                address: heartbeat.address,
                last_heartbeat: at,
            },
        );
    }

    fn alive_at(&self, agent: &AgentState, now: DateTime<Utc>) -> bool {
        now - agent.last_heartbeat < self.down_time
    }

    pub fn is_alive(&self, host: &str, now: DateTime<Utc>) -> bool {
        self.agents
            .get(host)
            .map(|a| self.alive_at(&a, now))
            .unwrap_or(false)
    }

    pub fn agent(&self, host: &str) -> Option<AgentState> {
        self.agents.get(host).map(|a| a.clone())
    }

    /// Live agents, ordered by host
    pub fn alive_agents(&self, now: DateTime<Utc>) -> Vec<AgentState> {
        let mut alive: Vec<AgentState> = self
            .agents
            .iter()
            .filter(|a| self.alive_at(a.value(), now))
            .map(|a| a.value().clone())
            .collect();
        alive.sort_by(|a, b| a.host.cmp(&b.host));
        alive
    }

    pub fn binding(&self, lb_id: &str) -> Option<String> {
        self.bindings.get(lb_id).map(|h| h.clone())
    }

    pub fn bind(&self, lb_id: &str, host: &str) {
        self.bindings.insert(lb_id.to_string(), host.to_string());
    }

    pub fn unbind(&self, lb_id: &str) -> Option<String> {
        self.bindings.remove(lb_id).map(|(_, host)| host)
    }

    /// Number of load balancers bound to `host`
    pub fn load(&self, host: &str) -> usize {
        self.bindings.iter().filter(|b| b.value() == host).count()
    }

    /// `(lb_id, host)` pairs whose agent has stopped reporting
    pub fn bound_to_dead(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let mut dead: Vec<(String, String)> = self
            .bindings
            .iter()
            .filter(|b| !self.is_alive(b.value(), now))
            .map(|b| (b.key().clone(), b.value().clone()))
            .collect();
        dead.sort();
        dead
    }

    /// Move `lb_id` from `from` to `to` only if it is still bound to `from`
    pub fn rebind(&self, lb_id: &str, from: &str, to: &str) -> bool {
        match self.bindings.entry(lb_id.to_string()) {
            Entry::Occupied(mut e) if e.get() == from => {
                e.insert(to.to_string());
                true
            }
            _ => false,
        }
    }

    /// Agent hosting `lb_id`: its live binding, else a fresh placement
    pub fn schedule(&self, lb_id: &str, scheduler: &dyn Scheduler) -> Result<AgentState> {
        let now = Utc::now();
        if let Some(host) = self.binding(lb_id) {
            if let Some(agent) = self.agent(&host).filter(|a| self.alive_at(a, now)) {
                return Ok(agent);
            }
        }
        let candidates = self.alive_agents(now);
        let chosen = scheduler
            .select(self, &candidates)
            .cloned()
            .ok_or_else(|| {
                LbaasError::ServiceUnavailable(format!("no live agent can host load balancer {}", lb_id))
            })?;
        self.bind(lb_id, &chosen.host);
        info!(lb_id = %lb_id, host = %chosen.host, "Load balancer scheduled");
        Ok(chosen)
    }
}

pub trait Scheduler: Send + Sync {
    fn select<'a>(&self, registry: &AgentRegistry, candidates: &'a [AgentState]) -> Option<&'a AgentState>;
}

pub struct ChanceScheduler;

impl Scheduler for ChanceScheduler {
    fn select<'a>(&self, _registry: &AgentRegistry, candidates: &'a [AgentState]) -> Option<&'a AgentState> {
        candidates.choose(&mut rand::thread_rng())
    }
}

pub struct LeastLoadedScheduler;

impl Scheduler for LeastLoadedScheduler {
    fn select<'a>(&self, registry: &AgentRegistry, candidates: &'a [AgentState]) -> Option<&'a AgentState> {
        candidates.iter().min_by_key(|a| registry.load(&a.host))
    }
}

pub fn scheduler_for(kind: SchedulerType) -> Arc<dyn Scheduler> {
    match kind {
        SchedulerType::Chance => Arc::new(ChanceScheduler),
        SchedulerType::LeastLoaded => Arc::new(LeastLoadedScheduler),
    }
}

/// Moves load balancers off agents whose heartbeat went stale
pub struct Rescheduler {
    registry: Arc<AgentRegistry>,
    scheduler: Arc<dyn Scheduler>,
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    rpc: Arc<dyn AgentCast>,
    finalizer: Arc<dyn Finalizer>,
}

impl Rescheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        scheduler: Arc<dyn Scheduler>,
        store: Arc<dyn ObjectStore>,
        network: Arc<dyn NetworkApi>,
        rpc: Arc<dyn AgentCast>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            store,
            network,
            rpc,
            finalizer,
        }
    }

    /// Move one load balancer off `from`. Returns the new host, or `None`
    /// when the LB is gone, admin-down or was moved concurrently.
    pub async fn reschedule(&self, lb_id: &str, from: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let lb = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                self.registry.unbind(lb_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !lb.admin_state_up {
            return Ok(None);
        }

        let candidates = self.registry.alive_agents(now);
        let Some(target) = self.scheduler.select(&self.registry, &candidates).cloned() else {
            let ctx = RequestContext::admin();
            if let Err(e) = self.finalizer.failed_completion(&ctx, &lb.clone().into()).await {
                error!(lb_id = %lb_id, error = %e, "Could not mark unschedulable load balancer");
            }
            return Err(LbaasError::ReschedulingFailed(format!(
                "no live agent for load balancer {} (was on {})",
                lb_id, from
            )));
        };

        if !self.registry.rebind(lb_id, from, &target.host) {
            return Ok(None);
        }
        info!(lb_id = %lb_id, from = %from, to = %target.host, "Load balancer rescheduled");
        let cast = attach_network(self.network.as_ref(), Cast::refresh(lb)).await;
        if let Err(e) = self.rpc.cast(&target.address, &cast).await {
            warn!(lb_id = %lb_id, host = %target.host, error = %e, "Refresh cast after rescheduling failed");
        }
        Ok(Some(target.host))
    }

    /// One pass over every binding to a dead agent; returns how many moved
    pub async fn reschedule_stale(&self, now: DateTime<Utc>) -> usize {
        let mut moved = 0;
        for (lb_id, host) in self.registry.bound_to_dead(now) {
            match self.reschedule(&lb_id, &host, now).await {
                Ok(Some(_)) => moved += 1,
                Ok(None) => {}
                Err(e) => error!(lb_id = %lb_id, host = %host, error = %e, "Rescheduling failed"),
            }
        }
        moved
    }

    pub fn spawn(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Rescheduler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.reschedule_stale(Utc::now()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::rpc::MockAgentCast;
    use crate::driver::completion::MockFinalizer;
    use crate::model::fixtures;
    use crate::network::InMemoryNetwork;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn heartbeat(host: &str) -> Heartbeat {
        Heartbeat {
            host: host.to_string(),
            address: format!("{}:9000", host),
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Duration::from_secs(75))
    }

    #[test]
    fn test_liveness_follows_down_time() {
        let registry = registry();
        registry.report_state_at(heartbeat("a"), t(0));
        assert!(registry.is_alive("a", t(74)));
        assert!(!registry.is_alive("a", t(75)));
        assert!(!registry.is_alive("unknown", t(0)));
        registry.report_state_at(heartbeat("a"), t(100));
        assert!(registry.is_alive("a", t(120)));
    }

    #[test]
    fn test_least_loaded_prefers_idle_agent() {
        let registry = registry();
        let now = Utc::now();
        registry.report_state_at(heartbeat("a"), now);
        registry.report_state_at(heartbeat("b"), now);
        registry.bind("lb-1", "a");
        let agent = registry.schedule("lb-2", &LeastLoadedScheduler).unwrap();
        assert_eq!(agent.host, "b");
        assert_eq!(registry.binding("lb-2").as_deref(), Some("b"));
    }

    #[test]
    fn test_schedule_keeps_live_binding() {
        let registry = registry();
        registry.report_state(heartbeat("a"));
        registry.report_state(heartbeat("b"));
        registry.bind("lb-1", "b");
        for _ in 0..5 {
            assert_eq!(registry.schedule("lb-1", &ChanceScheduler).unwrap().host, "b");
        }
    }

    #[test]
    fn test_schedule_without_agents_is_unavailable() {
        let registry = registry();
        let err = registry.schedule("lb-1", &ChanceScheduler).unwrap_err();
        assert!(matches!(err, LbaasError::ServiceUnavailable(_)));
        assert!(registry.binding("lb-1").is_none());
    }

    #[test]
    fn test_rebind_is_conditional() {
        let registry = registry();
        registry.bind("lb-1", "a");
        assert!(!registry.rebind("lb-1", "b", "c"));
        assert_eq!(registry.binding("lb-1").as_deref(), Some("a"));
        assert!(registry.rebind("lb-1", "a", "c"));
        assert_eq!(registry.binding("lb-1").as_deref(), Some("c"));
        assert!(!registry.rebind("missing", "a", "c"));
    }

    async fn store_with_lb(admin_state_up: bool) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let mut lb = fixtures::loadbalancer();
        lb.admin_state_up = admin_state_up;
        store.upsert_entity(lb.into()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_dead_agent_loads_move_to_live_agent() {
        let registry = Arc::new(registry());
        registry.report_state_at(heartbeat("dead"), t(0));
        registry.report_state_at(heartbeat("live"), t(100));
        registry.bind(fixtures::LB_ID, "dead");

        let mut rpc = MockAgentCast::new();
        rpc.expect_cast()
            .withf(|address, cast| address.to_string() == "live:9000" && cast.method == "refresh_loadbalancer")
            .times(1)
            .returning(|_, _| Ok(()));
        let mut finalizer = MockFinalizer::new();
        finalizer.expect_failed_completion().times(0);

        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(LeastLoadedScheduler),
            store_with_lb(true).await,
            Arc::new(InMemoryNetwork::new()),
            Arc::new(rpc),
            Arc::new(finalizer),
        );
        assert_eq!(rescheduler.reschedule_stale(t(120)).await, 1);
        assert_eq!(registry.binding(fixtures::LB_ID).as_deref(), Some("live"));
        assert_eq!(rescheduler.reschedule_stale(t(120)).await, 0);
    }

    #[tokio::test]
    async fn test_admin_down_lb_stays_put() {
        let registry = Arc::new(registry());
        registry.report_state_at(heartbeat("dead"), t(0));
        registry.report_state_at(heartbeat("live"), t(100));
        registry.bind(fixtures::LB_ID, "dead");

        let mut rpc = MockAgentCast::new();
        rpc.expect_cast().times(0);
        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(ChanceScheduler),
            store_with_lb(false).await,
            Arc::new(InMemoryNetwork::new()),
            Arc::new(rpc),
            Arc::new(MockFinalizer::new()),
        );
        assert_eq!(rescheduler.reschedule_stale(t(120)).await, 0);
        assert_eq!(registry.binding(fixtures::LB_ID).as_deref(), Some("dead"));
    }

    #[tokio::test]
    async fn test_no_live_agent_fails_the_lb() {
        let registry = Arc::new(registry());
        registry.report_state_at(heartbeat("dead"), t(0));
        registry.bind(fixtures::LB_ID, "dead");

        let mut finalizer = MockFinalizer::new();
        finalizer
            .expect_failed_completion()
            .withf(|_, entity| entity.id() == fixtures::LB_ID)
            .times(1)
            .returning(|_, _| Ok(()));
        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(ChanceScheduler),
            store_with_lb(true).await,
            Arc::new(InMemoryNetwork::new()),
            Arc::new(MockAgentCast::new()),
            Arc::new(finalizer),
        );
        let err = rescheduler
            .reschedule(fixtures::LB_ID, "dead", t(200))
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::ReschedulingFailed(_)));
        assert_eq!(registry.binding(fixtures::LB_ID).as_deref(), Some("dead"));
    }

    #[tokio::test]
    async fn test_deleted_lb_is_unbound() {
        let registry = Arc::new(registry());
        registry.bind("gone", "dead");
        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(ChanceScheduler),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryNetwork::new()),
            Arc::new(MockAgentCast::new()),
            Arc::new(MockFinalizer::new()),
        );
        assert_eq!(rescheduler.reschedule("gone", "dead", t(0)).await.unwrap(), None);
        assert!(registry.binding("gone").is_none());
    }
}
