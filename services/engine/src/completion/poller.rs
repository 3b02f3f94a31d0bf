//! Poll-based completion
//!
//! Each pending operation is a record holding its [`CompletionGuard`]. A
//! single dispatcher task keeps the records in a timer heap and hands due
//! ones to probe tasks, at most one per CPU at a time. A record is owned by
//! exactly one place at any moment, so every operation is finalized once.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{unbounded, Receiver, Sender};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::driver::CompletionGuard;
use crate::error::Result;
use crate::model::{Entity, ProvisioningStatus};

/// What the controller currently says about a load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub provisioning_status: ProvisioningStatus,
    pub vip_address: Option<String>,
    pub vip_port_id: Option<String>,
}

impl ProbeReport {
    pub fn status(provisioning_status: ProvisioningStatus) -> Self {
        Self {
            provisioning_status,
            vip_address: None,
            vip_port_id: None,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerProbe: Send + Sync {
    /// Fetch the LB; an LB unknown to the controller reports `DELETED`,
    /// which settles only a delete
    async fn probe(&self, lb_id: &str) -> Result<ProbeReport>;
}

struct PollRecord {
    lb_id: String,
    guard: CompletionGuard,
    deadline: Instant,
    due: Instant,
    seq: u64,
}

impl PartialEq for PollRecord {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for PollRecord {}

impl PartialOrd for PollRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PollRecord {
    // min-heap on due time
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cloneable entrypoint drivers use to hand over pending operations
#[derive(Clone)]
pub struct PollHandle {
    tx: Sender<PollRecord>,
    interval: Duration,
    timeout: Duration,
}

impl PollHandle {
    /// Watch `lb_id` until the operation held by `guard` settles or times out
    pub async fn watch(&self, lb_id: &str, guard: CompletionGuard) {
        let now = Instant::now();
        let record = PollRecord {
            lb_id: lb_id.to_string(),
            guard,
            deadline: now + self.timeout,
            due: now + self.interval,
            seq: 0,
        };
        debug!(lb_id = %lb_id, kind = %record.guard.entity().kind(), "Watching operation");
        if let Err(e) = self.tx.send(record).await {
            let record = e.into_inner();
            warn!(lb_id = %record.lb_id, "Poll dispatcher is gone, failing operation");
            record.guard.fail().await;
        }
    }
}

pub struct PollDispatcher {
    probe: Arc<dyn LoadBalancerProbe>,
    interval: Duration,
    permits: Arc<Semaphore>,
    rx: Receiver<PollRecord>,
    requeue: Sender<PollRecord>,
}

impl PollDispatcher {
    pub fn new(
        probe: Arc<dyn LoadBalancerProbe>,
        interval: Duration,
        timeout: Duration,
    ) -> (Self, PollHandle) {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let (tx, rx) = unbounded();
        let dispatcher = Self {
            probe,
            interval,
            permits: Arc::new(Semaphore::new(workers)),
            rx,
            requeue: tx.clone(),
        };
        let handle = PollHandle {
            tx,
            interval,
            timeout,
        };
        (dispatcher, handle)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Poll dispatcher started");
        let mut heap: BinaryHeap<PollRecord> = BinaryHeap::new();
        let mut seq: u64 = 0;
        loop {
            let next_due = heap.peek().map(|r| r.due);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Ok(mut record) => {
                        seq += 1;
                        record.seq = seq;
                        heap.push(record);
                    }
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    while heap.peek().map_or(false, |r| r.due <= now) {
                        let Some(record) = heap.pop() else { break };
                        let permit = match self.permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                record.guard.defer();
                                continue;
                            }
                        };
                        let probe = self.probe.clone();
                        let requeue = self.requeue.clone();
                        let interval = self.interval;
                        tokio::spawn(async move {
                            poll_once(probe, record, requeue, interval).await;
                            drop(permit);
                        });
                    }
                }
            }
        }
        // nothing resumes these after shutdown
        let abandoned = heap.len();
        for record in heap.drain() {
            warn!(lb_id = %record.lb_id, "Poll dispatcher stopping, failing operation");
            record.guard.fail().await;
        }
        info!(abandoned, "Poll dispatcher stopped");
    }
}

async fn poll_once(
    probe: Arc<dyn LoadBalancerProbe>,
    mut record: PollRecord,
    requeue: Sender<PollRecord>,
    interval: Duration,
) {
    match probe.probe(&record.lb_id).await {
        Ok(report) => match report.provisioning_status {
            // gone at the controller only settles a delete
            ProvisioningStatus::Deleted if !record.guard.completion().delete => {
                debug!(lb_id = %record.lb_id, "Controller has no such LB yet")
            }
            ProvisioningStatus::Active | ProvisioningStatus::Deleted => {
                if record.guard.completion().lb_create {
                    if let Entity::LoadBalancer(lb) = record.guard.entity() {
                        let mut lb = lb.clone();
                        if report.vip_address.is_some() {
                            lb.vip_address = report.vip_address;
                        }
                        if report.vip_port_id.is_some() {
                            lb.vip_port_id = report.vip_port_id;
                        }
                        record.guard.set_entity(lb.into());
                    }
                }
                debug!(lb_id = %record.lb_id, status = %report.provisioning_status, "Operation settled");
                record.guard.succeed().await;
                return;
            }
            ProvisioningStatus::Error => {
                warn!(lb_id = %record.lb_id, "Controller reported ERROR");
                record.guard.fail().await;
                return;
            }
            status => debug!(lb_id = %record.lb_id, status = %status, "Still pending"),
        },
        Err(e) => warn!(lb_id = %record.lb_id, error = %e, "Status probe failed"),
    }

    let now = Instant::now();
    if now >= record.deadline {
        warn!(lb_id = %record.lb_id, "Operation timed out");
        record.guard.fail().await;
        return;
    }
    record.due = now + interval;
    if let Err(e) = requeue.send(record).await {
        e.into_inner().guard.defer();
    }
}
