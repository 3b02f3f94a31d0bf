//! HAProxy namespace driver
//!
//! Realizes each load balancer as one haproxy process inside a dedicated
//! network namespace on this host. Every operation re-reads the LB graph
//! from the store, re-renders the whole config and reloads, so managers
//! differ only in how they finalize.

pub mod executor;
pub mod namespace;
pub mod process;
pub mod render;
pub mod stats;
pub mod tls;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::certificates::CertManager;
use crate::config::HaproxySettings;
use crate::context::RequestContext;
use crate::driver::{
    finalize_sync, Completion, DriverCapabilities, EntityManager, Finalizer, LoadBalancerManager,
    ProviderDriver,
};
use crate::error::{LbaasError, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    EntityKind, HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats,
    ManagedEntity, Member, Pool,
};
use crate::network::NetworkApi;
use crate::store::ObjectStore;

use executor::CommandExecutor;
use namespace::{namespace_name, NamespaceManager};
use process::{InstancePaths, ProcessManager};
use render::{render_config, RenderOptions};

pub const DRIVER_NAME: &str = "haproxy";

/// State shared by every manager of the driver
pub struct HaproxyCore {
    settings: HaproxySettings,
    host: String,
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    finalizer: Arc<dyn Finalizer>,
    certs: Option<Arc<dyn CertManager>>,
    namespaces: NamespaceManager,
    processes: ProcessManager,
    deployed: DashSet<String>,
    locks: KeyedLocks,
}

impl HaproxyCore {
    pub fn new(
        settings: HaproxySettings,
        host: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        network: Arc<dyn NetworkApi>,
        finalizer: Arc<dyn Finalizer>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let namespaces = NamespaceManager::new(executor.clone(), &settings);
        let processes = ProcessManager::new(
            executor,
            settings.haproxy_binary.clone(),
            settings.kill_grace_period(),
        );
        Self {
            settings,
            host: host.into(),
            store,
            network,
            finalizer,
            certs: None,
            namespaces,
            processes,
            deployed: DashSet::new(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_cert_manager(mut self, certs: Arc<dyn CertManager>) -> Self {
        self.certs = Some(certs);
        self
    }

    fn paths(&self, lb_id: &str) -> InstancePaths {
        InstancePaths::new(&self.settings.loadbalancer_state_path, lb_id)
    }

    pub fn is_deployed(&self, lb_id: &str) -> bool {
        self.deployed.contains(lb_id)
    }

    pub fn deployed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.deployed.iter().map(|id| id.clone()).collect();
        ids.sort();
        ids
    }

    async fn plug_vip(&self, lb: &LoadBalancer) -> Result<()> {
        let port_id = lb.vip_port_id.as_deref().ok_or_else(|| {
            LbaasError::BadRequest(format!("load balancer {} has no VIP port", lb.id))
        })?;
        let port = self.network.get_port(port_id).await?;
        let subnet = self.network.get_subnet(&lb.vip_subnet_id).await?;
        self.namespaces.plug_vip(&lb.id, &port, &subnet).await?;
        self.network.plug_vip_port(port_id, &self.host).await
    }

    /// Create or reload the instance; `false` when the LB is not deployable
    async fn deploy_instance(&self, lb: &LoadBalancer) -> Result<bool> {
        if !lb.is_deployable() {
            return Ok(false);
        }
        let paths = self.paths(&lb.id);
        tokio::fs::create_dir_all(paths.dir()).await?;

        let running = self.deployed.contains(&lb.id) || self.processes.is_running(&paths).await;
        if !running {
            self.plug_vip(lb).await?;
        }
        if let Some(certs) = &self.certs {
            tls::materialize(certs.as_ref(), lb, paths.dir()).await?;
        }

        let config = render_config(
            lb,
            &RenderOptions {
                user_group: self.settings.user_group.clone(),
                stats_socket: paths.stats_socket(),
                lb_dir: paths.dir().to_path_buf(),
            },
        )?;
        tokio::fs::write(paths.config(), config).await?;
        self.processes
            .start(&namespace_name(&lb.id), &paths, running)
            .await?;
        self.deployed.insert(lb.id.clone());
        info!(lb_id = %lb.id, reload = running, "haproxy instance deployed");
        Ok(true)
    }

    async fn undeploy_instance(&self, lb_id: &str, vip_port_id: Option<&str>) -> Result<()> {
        let paths = self.paths(lb_id);
        self.processes.stop(&paths).await?;
        if let Some(port_id) = vip_port_id {
            self.namespaces.unplug_vip(lb_id, port_id).await;
            if let Err(e) = self.network.unplug_vip_port(port_id, &self.host).await {
                warn!(lb_id = %lb_id, port_id = %port_id, error = %e, "Failed to unbind VIP port");
            }
        }
        if self.settings.cleanup_namespace {
            self.namespaces.cleanup(lb_id).await;
        }
        match tokio::fs::remove_dir_all(paths.dir()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.deployed.remove(lb_id);
        info!(lb_id = %lb_id, "haproxy instance removed");
        Ok(())
    }

    /// Bring the instance in line with the stored graph
    pub async fn sync(&self, lb_id: &str) -> Result<()> {
        let _guard = self.locks.lock(lb_id).await;
        let lb = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                debug!(lb_id = %lb_id, "Load balancer gone; nothing to sync");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !self.deploy_instance(&lb).await? && self.is_deployed(lb_id) {
            self.undeploy_instance(lb_id, lb.vip_port_id.as_deref()).await?;
        }
        Ok(())
    }

    pub async fn destroy(&self, lb: &LoadBalancer) -> Result<()> {
        let guard = self.locks.lock(&lb.id).await;
        self.undeploy_instance(&lb.id, lb.vip_port_id.as_deref()).await?;
        drop(guard);
        self.locks.forget(&lb.id);
        Ok(())
    }

    /// Scrape the stats socket, writing member statuses back
    pub async fn collect_stats(&self, lb_id: &str) -> Result<LoadBalancerStats> {
        let Some(csv) = stats::query_socket(&self.paths(lb_id).stats_socket()).await? else {
            return Ok(LoadBalancerStats::default());
        };
        let snapshot = stats::parse_snapshot(&csv);
        let ctx = RequestContext::admin();
        for (member_id, status) in &snapshot.members {
            match self
                .finalizer
                .update_status(&ctx, EntityKind::Member, member_id, None, Some(*status))
                .await
            {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        Ok(snapshot.loadbalancer)
    }

    async fn scrape_all(&self) {
        let ctx = RequestContext::admin();
        for lb_id in self.deployed_ids() {
            let stats = match self.collect_stats(&lb_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(lb_id = %lb_id, error = %e, "Stats scrape failed");
                    continue;
                }
            };
            if let Err(e) = self
                .finalizer
                .update_loadbalancer_stats(&ctx, &lb_id, stats)
                .await
            {
                warn!(lb_id = %lb_id, error = %e, "Failed to record stats");
            }
        }
    }

    pub fn spawn_stats_collector(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.periodic_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(every = ?self.settings.periodic_interval(), "Stats collector started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.scrape_all().await,
                }
            }
            info!("Stats collector stopped");
        })
    }

    /// Re-deploy every instance found on disk; ids unknown to the store are
    /// torn down
    pub async fn recover(&self) -> Result<()> {
        let root = InstancePaths::root(&self.settings.loadbalancer_state_path);
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        for lb_id in ids {
            match self.store.get_loadbalancer(&lb_id).await {
                Ok(_) => {
                    if let Err(e) = self.sync(&lb_id).await {
                        error!(lb_id = %lb_id, error = %e, "Failed to recover instance");
                    }
                }
                Err(e) if e.is_not_found() => {
                    info!(lb_id = %lb_id, "Removing orphaned instance");
                    if let Err(e) = self.undeploy_instance(&lb_id, None).await {
                        warn!(lb_id = %lb_id, error = %e, "Failed to remove orphaned instance");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct LoadBalancerOps {
    core: Arc<HaproxyCore>,
}

#[async_trait]
impl LoadBalancerManager for LoadBalancerOps {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            lb.clone().into(),
            Completion::lb_create(),
            self.core.sync(&lb.id),
        )
        .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            new.clone().into(),
            Completion::default(),
            self.core.sync(&new.id),
        )
        .await
    }

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            lb.clone().into(),
            Completion::delete(),
            self.core.destroy(lb),
        )
        .await
    }

    async fn delete_cascade(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        LoadBalancerManager::delete(self, ctx, lb).await
    }

    async fn refresh(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        self.core.sync(&lb.id).await
    }

    async fn stats(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<LoadBalancerStats> {
        self.core.collect_stats(&lb.id).await
    }
}

/// Child manager; any change re-deploys the owning LB
pub struct ChildOps<T> {
    core: Arc<HaproxyCore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> ChildOps<T> {
    fn new(core: Arc<HaproxyCore>) -> Self {
        Self {
            core,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: ManagedEntity> EntityManager<T> for ChildOps<T> {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            obj.clone().into_entity(),
            Completion::default(),
            self.core.sync(obj.loadbalancer_id()),
        )
        .await
    }

    async fn update(&self, ctx: &RequestContext, _old: &T, new: &T) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            new.clone().into_entity(),
            Completion::default(),
            self.core.sync(new.loadbalancer_id()),
        )
        .await
    }

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        finalize_sync(
            self.core.finalizer.clone(),
            ctx,
            obj.clone().into_entity(),
            Completion::delete(),
            self.core.sync(obj.loadbalancer_id()),
        )
        .await
    }
}

pub struct HaproxyDriver {
    core: Arc<HaproxyCore>,
    load_balancer: LoadBalancerOps,
    listener: ChildOps<Listener>,
    pool: ChildOps<Pool>,
    member: ChildOps<Member>,
    health_monitor: ChildOps<HealthMonitor>,
    l7_policy: ChildOps<L7Policy>,
    l7_rule: ChildOps<L7Rule>,
}

impl HaproxyDriver {
    pub fn new(core: HaproxyCore) -> Self {
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

    pub fn core(&self) -> &Arc<HaproxyCore> {
        &self.core
    }
}

impl ProviderDriver for HaproxyDriver {
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
    use super::*;
    use crate::driver::DriverRegistry;
    use crate::model::{fixtures, ProvisioningStatus};
    use crate::network::{InMemoryNetwork, Subnet};
    use crate::plugin::{Dispatcher, StoreFinalizer};
    use crate::store::InMemoryStore;
    use executor::fake::RecordingExecutor;
    use executor::Signal;

    struct Harness {
        state: tempfile::TempDir,
        store: Arc<InMemoryStore>,
        network: Arc<InMemoryNetwork>,
        executor: Arc<RecordingExecutor>,
        core: Arc<HaproxyCore>,
        dispatcher: Dispatcher,
    }

    async fn harness() -> Harness {
        let state = tempfile::tempdir().unwrap();
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
        let executor = Arc::new(RecordingExecutor::new());
        let settings = HaproxySettings {
            loadbalancer_state_path: state.path().to_path_buf(),
            send_gratuitous_arp: 0,
            ..HaproxySettings::default()
        };
        let driver = HaproxyDriver::new(HaproxyCore::new(
            settings,
            "compute-1",
            store.clone(),
            network.clone(),
            finalizer.clone(),
            executor.clone(),
        ));
        let core = driver.core().clone();
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(driver));
        let dispatcher = Dispatcher::new(store.clone(), network.clone(), finalizer, registry);
        Harness {
            state,
            store,
            network,
            executor,
            core,
            dispatcher,
        }
    }

    fn new_lb() -> LoadBalancer {
        let mut lb = fixtures::bare_loadbalancer();
        lb.vip_port_id = None;
        lb.vip_address = None;
        lb
    }

    fn spawns(executor: &RecordingExecutor) -> Vec<String> {
        executor.commands_containing("haproxy -f")
    }

    #[tokio::test]
    async fn test_create_then_update_reloads_running_instance() {
        let h = harness().await;
        let ctx = RequestContext::new(fixtures::PROJECT_ID);

        let lb = h.dispatcher.create_loadbalancer(&ctx, new_lb()).await.unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
        assert!(spawns(&h.executor).is_empty());
        assert!(!h.core.is_deployed(fixtures::LB_ID));

        let mut listener = fixtures::listener();
        listener.default_pool_id = None;
        h.dispatcher.create(&ctx, listener).await.unwrap();
        let mut pool = fixtures::pool();
        pool.members.clear();
        pool.healthmonitor = None;
        h.dispatcher.create(&ctx, pool).await.unwrap();
        h.dispatcher
            .create(&ctx, fixtures::member("sample_member_id_1", "10.0.0.99"))
            .await
            .unwrap();

        let first = spawns(&h.executor);
        assert_eq!(first.len(), 3);
        assert!(!first[0].contains("-sf"));
        assert!(first[0].starts_with("ip netns exec nlbaas-sample_loadbalancer_id_1 haproxy -f "));
        assert!(h.core.is_deployed(fixtures::LB_ID));
        let port = h.network.get_port(lb.vip_port_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(port.host.as_deref(), Some("compute-1"));

        let mut member = fixtures::member("sample_member_id_1", "10.0.0.99");
        member.weight = 50;
        h.dispatcher.update(&ctx, member).await.unwrap();
        let all = spawns(&h.executor);
        assert_eq!(all.len(), 4);
        assert!(all[3].ends_with("haproxy.pid -sf 4002"), "{}", all[3]);
        assert_eq!(h.executor.alive(), vec![4003]);

        let stored = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Active);
        assert_eq!(stored.pools[0].members[0].weight, 50);
        assert_eq!(stored.pools[0].members[0].provisioning_status, ProvisioningStatus::Active);
        // ovs plug happens once, at first deploy
        assert_eq!(h.executor.commands_containing("add-port").len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_delete_tears_down_instance() {
        let h = harness().await;
        let ctx = RequestContext::admin();
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        lb.vip_address = None;
        let lb = h.dispatcher.create_loadbalancer(&ctx, lb).await.unwrap();
        assert!(h.core.is_deployed(fixtures::LB_ID));
        let dir = h.state.path().join("v2").join(fixtures::LB_ID);
        let config = std::fs::read_to_string(dir.join("haproxy.conf")).unwrap();
        assert!(config.contains("backend sample_pool_id_1"));
        let port_id = lb.vip_port_id.clone().unwrap();

        h.dispatcher
            .delete_loadbalancer(&ctx, fixtures::LB_ID, true)
            .await
            .unwrap();

        assert_eq!(h.executor.signals(), vec![(4000, Signal::Term)]);
        assert!(h.executor.alive().is_empty());
        let device = namespace::device_name(&port_id);
        assert!(h
            .executor
            .commands()
            .contains(&format!("ovs-vsctl --if-exists del-port br-int {}", device)));
        assert!(!dir.exists());
        assert!(!h.core.is_deployed(fixtures::LB_ID));
        assert!(h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap_err().is_not_found());
        assert!(h.network.get_port(&port_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_removing_last_listener_undeploys() {
        let h = harness().await;
        let ctx = RequestContext::admin();
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        h.dispatcher.create_loadbalancer(&ctx, lb).await.unwrap();
        assert!(h.core.is_deployed(fixtures::LB_ID));

        h.dispatcher
            .delete::<Listener>(&ctx, fixtures::LISTENER_ID)
            .await
            .unwrap();
        assert!(!h.core.is_deployed(fixtures::LB_ID));
        let lb = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert!(lb.listeners.is_empty());
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_error() {
        let h = harness().await;
        h.executor.reply(
            "haproxy -f",
            executor::CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "[ALERT] parsing".into(),
            },
        );
        let ctx = RequestContext::admin();
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        assert!(h.dispatcher.create_loadbalancer(&ctx, lb).await.is_err());
        let stored = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Error);
    }

    #[tokio::test]
    async fn test_missing_stats_socket_leaves_members_untouched() {
        let h = harness().await;
        let ctx = RequestContext::admin();
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        h.dispatcher.create_loadbalancer(&ctx, lb).await.unwrap();
        let stats = h
            .dispatcher
            .loadbalancer_stats(&ctx, fixtures::LB_ID)
            .await
            .unwrap();
        assert_eq!(stats, LoadBalancerStats::default());
        let lb = h.store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert_eq!(
            lb.pools[0].members[0].operating_status,
            crate::model::OperatingStatus::Online
        );
    }

    #[tokio::test]
    async fn test_recovery_reloads_known_and_removes_orphans() {
        let h = harness().await;
        let ctx = RequestContext::admin();
        let mut lb = fixtures::loadbalancer();
        lb.vip_port_id = None;
        h.dispatcher.create_loadbalancer(&ctx, lb).await.unwrap();
        let orphan = h.state.path().join("v2").join("orphan_lb");
        std::fs::create_dir_all(&orphan).unwrap();

        let restarted = HaproxyCore::new(
            HaproxySettings {
                loadbalancer_state_path: h.state.path().to_path_buf(),
                send_gratuitous_arp: 0,
                ..HaproxySettings::default()
            },
            "compute-1",
            h.store.clone(),
            h.network.clone(),
            Arc::new(StoreFinalizer::new(h.store.clone())),
            h.executor.clone(),
        );
        restarted.recover().await.unwrap();

        assert!(!orphan.exists());
        assert!(restarted.is_deployed(fixtures::LB_ID));
        let spawned = spawns(&h.executor);
        assert!(spawned.last().unwrap().ends_with("-sf 4000"));
        assert_eq!(h.executor.commands_containing("add-port").len(), 1);
    }
}
