//! Pending-set sweeper
//!
//! Drivers that cannot observe completion directly record the LB id in a
//! shared pending set. One periodic sweeper fetches the controller's status
//! tree for every tracked LB and reconciles it into the store through the
//! finalizer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::context::RequestContext;
use crate::driver::{Completion, Finalizer};
use crate::error::Result;
use crate::model::{Entity, EntityKind, OperatingStatus, ProvisioningStatus};
use crate::store::ObjectStore;

/// Status trees fetched at once during a sweep
const SWEEP_CONCURRENCY: usize = 8;

/// One node of a controller-reported status tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub kind: EntityKind,
    pub id: String,
    pub provisioning_status: ProvisioningStatus,
    pub operating_status: Option<OperatingStatus>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Flattened status tree for an LB, or `None` when the controller has no such LB
    async fn status_tree(&self, lb_id: &str) -> Result<Option<Vec<RemoteStatus>>>;
}

/// LB ids with operations the controller has not finished.
///
/// Every `track` stamps the id with a fresh generation; `release` only drops
/// the id if it still carries the generation the caller saw.
#[derive(Debug, Default)]
pub struct PendingLoadBalancers {
    ids: DashMap<String, u64>,
    generation: AtomicU64,
}

impl PendingLoadBalancers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, lb_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ids.insert(lb_id.to_string(), generation).is_none() {
            debug!(lb_id = %lb_id, "Tracking pending load balancer");
        }
    }

    /// Drop `lb_id` unless it was tracked again after `generation` was read
    pub fn release(&self, lb_id: &str, generation: u64) -> bool {
        self.ids.remove_if(lb_id, |_, current| *current == generation).is_some()
    }

    pub fn contains(&self, lb_id: &str) -> bool {
        self.ids.contains_key(lb_id)
    }

    /// Tracked ids with their current generation, sorted by id
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut ids: Vec<(String, u64)> = self
            .ids
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct StatusSweeper {
    source: Arc<dyn StatusSource>,
    store: Arc<dyn ObjectStore>,
    finalizer: Arc<dyn Finalizer>,
    pending: Arc<PendingLoadBalancers>,
}

enum Verdict {
    Waiting,
    Succeeded(Completion),
    Failed,
    Settled,
}

fn verdict(local: ProvisioningStatus, remote: Option<&RemoteStatus>) -> Verdict {
    let deleting = local == ProvisioningStatus::PendingDelete;
    match remote {
        None if deleting => Verdict::Succeeded(Completion::delete()),
        None => Verdict::Waiting,
        Some(r) => match r.provisioning_status {
            ProvisioningStatus::Deleted => Verdict::Succeeded(Completion::delete()),
            ProvisioningStatus::Error => Verdict::Failed,
            // still present at the controller, the delete has not landed yet
            ProvisioningStatus::Active if deleting => Verdict::Waiting,
            ProvisioningStatus::Active => Verdict::Succeeded(Completion::default()),
            status if status.is_pending() => Verdict::Waiting,
            _ => Verdict::Settled,
        },
    }
}

impl StatusSweeper {
    pub fn new(
        source: Arc<dyn StatusSource>,
        store: Arc<dyn ObjectStore>,
        finalizer: Arc<dyn Finalizer>,
        pending: Arc<PendingLoadBalancers>,
    ) -> Self {
        Self {
            source,
            store,
            finalizer,
            pending,
        }
    }

    pub fn pending(&self) -> &Arc<PendingLoadBalancers> {
        &self.pending
    }

    async fn apply(&self, ctx: &RequestContext, entity: &Entity, verdict: Verdict) -> Result<bool> {
        match verdict {
            Verdict::Waiting => Ok(true),
            Verdict::Settled => Ok(false),
            Verdict::Succeeded(completion) => {
                self.finalizer
                    .successful_completion(ctx, entity, completion)
                    .await?;
                Ok(false)
            }
            Verdict::Failed => {
                self.finalizer.failed_completion(ctx, entity).await?;
                Ok(false)
            }
        }
    }

    /// Reconcile one LB; returns whether it still has pending work
    pub async fn reconcile(&self, lb_id: &str) -> Result<bool> {
        let ctx = RequestContext::admin();
        let local = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(tree) = self.source.status_tree(lb_id).await? else {
            if local.provisioning_status == ProvisioningStatus::PendingDelete {
                self.finalizer
                    .successful_completion(&ctx, &local.into(), Completion::delete())
                    .await?;
                return Ok(false);
            }
            return Ok(local.provisioning_status.is_pending()
                || local.descendants().iter().any(|(_, _, s)| s.is_pending()));
        };
        let remote: HashMap<(EntityKind, &str), &RemoteStatus> = tree
            .iter()
            .map(|r| ((r.kind, r.id.as_str()), r))
            .collect();

        let mut waiting = false;
        for (kind, id, status) in local.descendants() {
            let reported = remote.get(&(kind, id)).copied();
            if !status.is_pending() {
                if let Some(op) = reported.and_then(|r| r.operating_status) {
                    self.finalizer
                        .update_status(&ctx, kind, id, None, Some(op))
                        .await?;
                }
                continue;
            }
            let Some(entity) = local.find(kind, id) else {
                continue;
            };
            waiting |= self.apply(&ctx, &entity, verdict(status, reported)).await?;
        }

        // child completions move the root, so judge it from a fresh read
        let root = match self.store.get_loadbalancer(lb_id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let reported = remote.get(&(EntityKind::LoadBalancer, lb_id)).copied();
        if root.provisioning_status.is_pending() && !waiting {
            let verdict = verdict(root.provisioning_status, reported);
            waiting |= self.apply(&ctx, &root.into(), verdict).await?;
        } else if root.provisioning_status.is_pending() {
            waiting = true;
        } else if let Some(op) = reported.and_then(|r| r.operating_status) {
            self.finalizer
                .update_status(&ctx, EntityKind::LoadBalancer, lb_id, None, Some(op))
                .await?;
        }
        Ok(waiting)
    }

    pub async fn sweep_once(&self) {
        stream::iter(self.pending.snapshot())
            .for_each_concurrent(SWEEP_CONCURRENCY, |(lb_id, generation)| async move {
                match self.reconcile(&lb_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if self.pending.release(&lb_id, generation) {
                            debug!(lb_id = %lb_id, "No pending work left");
                        } else {
                            debug!(lb_id = %lb_id, "Tracked again during sweep; keeping it");
                        }
                    }
                    Err(e) => warn!(lb_id = %lb_id, error = %e, "Status sweep failed"),
                }
            })
            .await;
    }

    pub fn spawn(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Status sweeper started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.sweep_once().await,
                }
            }
            info!("Status sweeper stopped");
        })
    }
}
