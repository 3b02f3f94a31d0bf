//! Workflow controller driver
//!
//! Every load balancer maps to one workflow on a remote controller. Each
//! change pushes the whole live graph through the workflow's apply action.
//! Completion is deferred: accepted controller operations are polled
//! through the operation queue, and the pending-set sweeper reconciles the
//! controller's status tree into the store.

pub mod client;
pub mod payload;
pub mod proxy_port;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::{PendingLoadBalancers, RemoteStatus, StatusSource, StatusSweeper};
use crate::config::RadwareSettings;
use crate::context::RequestContext;
use crate::driver::{
    Completion, CompletionGuard, DriverCapabilities, EntityManager, Finalizer, LoadBalancerManager,
    ProviderDriver,
};
use crate::error::{LbaasError, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    EntityKind, HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, LoadBalancerStats,
    ManagedEntity, Member, OperatingStatus, Pool, ProvisioningStatus,
};
use crate::network::NetworkApi;
use crate::queue::{OperationQueue, TaskHandler, TaskOutcome};
use crate::store::ObjectStore;

use client::RestClient;
use payload::{apply_parameters, create_parameters, workflow_name};

pub const DRIVER_NAME: &str = "radwarev2";

const OPERATION_QUEUE_CAPACITY: usize = 1024;

fn workflow_path(lb_id: &str) -> String {
    format!("/api/workflow/{}", workflow_name(lb_id))
}

fn action_path(lb_id: &str, action: &str) -> String {
    format!("{}/action/{}", workflow_path(lb_id), action)
}

/// Path part of an operation URI; controllers may return absolute URLs
fn relative_uri(uri: &str) -> &str {
    match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => uri,
    }
}

/// Accepted controller operation waiting to complete
pub struct Operation {
    uri: String,
    lb_id: String,
    guard: Option<CompletionGuard>,
    deadline: Instant,
}

/// Polls accepted operations until the controller reports them complete
struct OperationPoller {
    client: Arc<RestClient>,
    pending: Arc<PendingLoadBalancers>,
    interval: Duration,
}

#[async_trait]
impl TaskHandler<Operation> for OperationPoller {
    async fn handle(&self, op: &mut Operation) -> TaskOutcome {
        if Instant::now() >= op.deadline {
            warn!(lb_id = %op.lb_id, uri = %op.uri, "Controller operation timed out");
            if let Some(guard) = op.guard.take() {
                guard.fail().await;
            }
            return TaskOutcome::Done;
        }
        let reply = match self.client.get(relative_uri(&op.uri)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(lb_id = %op.lb_id, uri = %op.uri, error = %e, "Failed to poll controller operation");
                return TaskOutcome::Retry(self.interval);
            }
        };
        if !reply.body.get("complete").and_then(Value::as_bool).unwrap_or(false) {
            return TaskOutcome::Retry(self.interval);
        }
        let Some(guard) = op.guard.take() else {
            return TaskOutcome::Done;
        };
        if reply.body.get("success").and_then(Value::as_bool).unwrap_or(false) {
            debug!(lb_id = %op.lb_id, uri = %op.uri, "Controller operation succeeded");
            guard.defer();
            self.pending.track(&op.lb_id);
        } else {
            warn!(lb_id = %op.lb_id, uri = %op.uri, reply = %reply.body, "Controller operation failed");
            guard.fail().await;
        }
        TaskOutcome::Done
    }
}

/// Status tree reported by the controller for a workflow
pub struct WorkflowStatusSource {
    client: Arc<RestClient>,
}

fn flatten(kind: EntityKind, node: &Value, out: &mut Vec<RemoteStatus>) {
    let id = node.get("id").and_then(Value::as_str);
    let status = node
        .get("provisioning_status")
        .and_then(Value::as_str)
        .and_then(ProvisioningStatus::parse);
    if let (Some(id), Some(status)) = (id, status) {
        out.push(RemoteStatus {
            kind,
            id: id.to_string(),
            provisioning_status: status,
            operating_status: node
                .get("operating_status")
                .and_then(Value::as_str)
                .and_then(OperatingStatus::parse),
        });
    }
    let children: [(&str, EntityKind); 6] = [
        ("listeners", EntityKind::Listener),
        ("pools", EntityKind::Pool),
        ("members", EntityKind::Member),
        ("l7policies", EntityKind::L7Policy),
        ("rules", EntityKind::L7Rule),
        ("healthmonitor", EntityKind::HealthMonitor),
    ];
    for (key, child_kind) in children {
        match node.get(key) {
            Some(Value::Array(items)) => {
                for item in items {
                    flatten(child_kind, item, out);
                }
            }
            Some(item @ Value::Object(_)) => flatten(child_kind, item, out),
            _ => {}
        }
    }
}

/// Flatten a `{"statuses": {"loadbalancer": ...}}` reply
pub fn parse_status_tree(body: &Value) -> Vec<RemoteStatus> {
    let mut out = Vec::new();
    if let Some(root) = body.get("statuses").and_then(|s| s.get("loadbalancer")) {
        flatten(EntityKind::LoadBalancer, root, &mut out);
    }
    out
}

#[async_trait]
impl StatusSource for WorkflowStatusSource {
    async fn status_tree(&self, lb_id: &str) -> Result<Option<Vec<RemoteStatus>>> {
        match self.client.get(&format!("{}/statuses", workflow_path(lb_id))).await {
            Ok(reply) => Ok(Some(parse_status_tree(&reply.body))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

enum Realized {
    /// Nothing left to deploy; the workflow is gone
    Removed,
    /// Applied synchronously
    Applied,
    /// Accepted as an asynchronous operation
    Accepted(String),
}

pub struct WorkflowCore {
    settings: RadwareSettings,
    client: Arc<RestClient>,
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    finalizer: Arc<dyn Finalizer>,
    pending: Arc<PendingLoadBalancers>,
    operations: OperationQueue<Operation>,
    locks: KeyedLocks,
}

impl WorkflowCore {
    pub fn new(
        settings: RadwareSettings,
        client: RestClient,
        store: Arc<dyn ObjectStore>,
        network: Arc<dyn NetworkApi>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        Self {
            settings,
            client: Arc::new(client),
            store,
            network,
            finalizer,
            pending: Arc::new(PendingLoadBalancers::new()),
            operations: OperationQueue::bounded(OPERATION_QUEUE_CAPACITY),
            locks: KeyedLocks::new(),
        }
    }

    pub fn pending(&self) -> &Arc<PendingLoadBalancers> {
        &self.pending
    }

    pub fn status_source(&self) -> Arc<dyn StatusSource> {
        Arc::new(WorkflowStatusSource {
            client: self.client.clone(),
        })
    }

    pub fn sweeper(&self) -> StatusSweeper {
        StatusSweeper::new(
            self.status_source(),
            self.store.clone(),
            self.finalizer.clone(),
            self.pending.clone(),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.settings.status_sweep_interval)
    }

    pub fn spawn_operation_worker(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let poller = OperationPoller {
            client: self.client.clone(),
            pending: self.pending.clone(),
            interval: Duration::from_secs(self.settings.operation_poll_interval),
        };
        self.operations.spawn_worker(Arc::new(poller), shutdown)
    }

    async fn workflow_exists(&self, lb_id: &str) -> Result<bool> {
        match self.client.get(&workflow_path(lb_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_workflow(&self, lb: &LoadBalancer) -> Result<()> {
        if self.workflow_exists(&lb.id).await? {
            return Ok(());
        }
        let path = format!(
            "/api/workflowTemplate/{}?name={}",
            urlencoding::encode(&self.settings.workflow_template_name),
            urlencoding::encode(&workflow_name(&lb.id))
        );
        self.client
            .post(&path, &create_parameters(&self.settings, lb))
            .await?;
        info!(lb_id = %lb.id, template = %self.settings.workflow_template_name, "Workflow created");
        Ok(())
    }

    async fn remove_workflow(&self, lb_id: &str) -> Result<()> {
        if self.workflow_exists(lb_id).await? {
            match self.client.delete(&workflow_path(lb_id)).await {
                Ok(_) => info!(lb_id = %lb_id, "Workflow deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        proxy_port::release(self.network.as_ref(), lb_id).await;
        Ok(())
    }

    async fn realize(&self, lb_id: &str) -> Result<Realized> {
        let lb = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                self.remove_workflow(lb_id).await?;
                return Ok(Realized::Removed);
            }
            Err(e) => return Err(e),
        };
        if !lb.is_deployable() {
            self.remove_workflow(lb_id).await?;
            return Ok(Realized::Removed);
        }

        self.ensure_workflow(&lb).await?;
        let plan = proxy_port::plan(self.network.as_ref(), &lb).await?;
        let body = json!({ "parameters": apply_parameters(&lb, &plan) });
        let reply = self
            .client
            .post(&action_path(lb_id, &self.settings.workflow_action_name), &body)
            .await?;
        match reply.operation_uri() {
            Some(uri) => Ok(Realized::Accepted(uri.to_string())),
            None => Ok(Realized::Applied),
        }
    }

    /// Push the current graph of `lb_id` and route the guard to whichever
    /// engine will finalize it
    pub async fn sync(&self, lb_id: &str, guard: CompletionGuard) -> Result<()> {
        let _lock = self.locks.lock(lb_id).await;
        match self.realize(lb_id).await {
            Ok(Realized::Removed) => {
                guard.succeed().await;
                Ok(())
            }
            Ok(Realized::Applied) => {
                guard.defer();
                self.pending.track(lb_id);
                Ok(())
            }
            Ok(Realized::Accepted(uri)) => {
                debug!(lb_id = %lb_id, uri = %uri, "Controller accepted operation");
                let deadline = Instant::now() + Duration::from_secs(self.settings.operation_timeout);
                self.operations
                    .push(Operation {
                        uri,
                        lb_id: lb_id.to_string(),
                        guard: Some(guard),
                        deadline,
                    })
                    .await
            }
            Err(e) => {
                guard.fail().await;
                Err(e)
            }
        }
    }

    pub async fn stats(&self, lb_id: &str) -> Result<LoadBalancerStats> {
        let reply = self
            .client
            .post(&action_path(lb_id, &self.settings.stats_action_name), &json!({ "parameters": {} }))
            .await?;
        let stats = reply
            .body
            .get("stats")
            .cloned()
            .ok_or_else(|| LbaasError::Unknown(format!("stats reply for {} carries no counters", lb_id)))?;
        Ok(serde_json::from_value(stats)?)
    }

    fn guard(&self, ctx: &RequestContext, entity: crate::model::Entity, completion: Completion) -> CompletionGuard {
        CompletionGuard::new(self.finalizer.clone(), ctx, entity, completion)
    }
}

pub struct LoadBalancerOps {
    core: Arc<WorkflowCore>,
}

#[async_trait]
impl LoadBalancerManager for LoadBalancerOps {
    async fn create(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let guard = self.core.guard(ctx, lb.clone().into(), Completion::lb_create());
        self.core.sync(&lb.id, guard).await
    }

    async fn update(&self, ctx: &RequestContext, _old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
        let guard = self.core.guard(ctx, new.clone().into(), Completion::default());
        self.core.sync(&new.id, guard).await
    }

    async fn delete(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let guard = self.core.guard(ctx, lb.clone().into(), Completion::delete());
        self.core.sync(&lb.id, guard).await
    }

    async fn delete_cascade(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        LoadBalancerManager::delete(self, ctx, lb).await
    }

    async fn refresh(&self, ctx: &RequestContext, lb: &LoadBalancer) -> Result<()> {
        let guard = self.core.guard(ctx, lb.clone().into(), Completion::default());
        self.core.sync(&lb.id, guard).await
    }

    async fn stats(&self, _ctx: &RequestContext, lb: &LoadBalancer) -> Result<LoadBalancerStats> {
        self.core.stats(&lb.id).await
    }
}

pub struct ChildOps<T> {
    core: Arc<WorkflowCore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> ChildOps<T> {
    fn new(core: Arc<WorkflowCore>) -> Self {
        Self {
            core,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: ManagedEntity> EntityManager<T> for ChildOps<T> {
    async fn create(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        let guard = self.core.guard(ctx, obj.clone().into_entity(), Completion::default());
        self.core.sync(obj.loadbalancer_id(), guard).await
    }

    async fn update(&self, ctx: &RequestContext, _old: &T, new: &T) -> Result<()> {
        let guard = self.core.guard(ctx, new.clone().into_entity(), Completion::default());
        self.core.sync(new.loadbalancer_id(), guard).await
    }

    async fn delete(&self, ctx: &RequestContext, obj: &T) -> Result<()> {
        let guard = self.core.guard(ctx, obj.clone().into_entity(), Completion::delete());
        self.core.sync(obj.loadbalancer_id(), guard).await
    }
}

pub struct WorkflowDriver {
    core: Arc<WorkflowCore>,
    load_balancer: LoadBalancerOps,
    listener: ChildOps<Listener>,
    pool: ChildOps<Pool>,
    member: ChildOps<Member>,
    health_monitor: ChildOps<HealthMonitor>,
    l7_policy: ChildOps<L7Policy>,
    l7_rule: ChildOps<L7Rule>,
}

impl WorkflowDriver {
    pub fn new(core: WorkflowCore) -> Self {
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

    pub fn core(&self) -> &Arc<WorkflowCore> {
        &self.core
    }
}

impl ProviderDriver for WorkflowDriver {
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
