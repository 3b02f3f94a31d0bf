//! Callbacks from the agent to the engine
//!
//! Local completions are mirrored into the worker's cache and then reported
//! to the engine: entity outcomes on the status callback, counters on the
//! event topic, liveness on the heartbeat endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lbaas_engine::agent::rpc::{StatusReport, REPORT_STATE_PATH, UPDATE_STATUS_PATH};
use lbaas_engine::agent::scheduler::Heartbeat;
use lbaas_engine::completion::events::StatusPayload;
use lbaas_engine::completion::InfoContainer;
use lbaas_engine::driver::{Completion, Finalizer};
use lbaas_engine::error::{LbaasError, RestFailure, Result};
use lbaas_engine::model::{Entity, EntityKind, LoadBalancerStats, OperatingStatus, ProvisioningStatus};
use lbaas_engine::{RequestContext, StoreFinalizer};

pub struct EngineReporter {
    http: Client,
    engine_url: String,
    topic: String,
}

impl EngineReporter {
    pub fn new(engine_url: &str, topic: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LbaasError::Unknown(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            engine_url: engine_url.trim_end_matches('/').to_string(),
            topic: topic.to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.engine_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| LbaasError::from(RestFailure::connect(e.to_string())))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(RestFailure::new(
            status.as_u16() as i32,
            status.canonical_reason().unwrap_or("error"),
            text,
        )
        .into())
    }

    pub async fn report_status(&self, report: &StatusReport) -> Result<()> {
        debug!(kind = %report.kind, id = %report.id, "Reporting status");
        self.post(UPDATE_STATUS_PATH, report).await
    }

    pub async fn publish(&self, event: &InfoContainer) -> Result<()> {
        self.post(&format!("/v1/topics/{}/events", self.topic), event)
            .await
    }

    pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.post(REPORT_STATE_PATH, heartbeat).await
    }
}

/// Report liveness every `every` until shutdown
pub fn spawn_heartbeat(
    reporter: Arc<EngineReporter>,
    heartbeat: Heartbeat,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(host = %heartbeat.host, every = ?every, "Heartbeat started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = reporter.heartbeat(&heartbeat).await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        info!("Heartbeat stopped");
    })
}

fn report(kind: EntityKind, id: &str, provisioning: Option<ProvisioningStatus>, operating: Option<OperatingStatus>) -> StatusReport {
    StatusReport {
        kind,
        id: id.to_string(),
        status: StatusPayload {
            provisioning_status: provisioning,
            operating_status: operating,
        },
    }
}

/// Finalizer of the agent's drivers: the local cache first, then the engine
pub struct CallbackFinalizer {
    local: StoreFinalizer,
    reporter: Arc<EngineReporter>,
}

impl CallbackFinalizer {
    pub fn new(local: StoreFinalizer, reporter: Arc<EngineReporter>) -> Self {
        Self { local, reporter }
    }

    async fn send(&self, reports: Vec<StatusReport>) {
        for report in reports {
            if let Err(e) = self.reporter.report_status(&report).await {
                warn!(kind = %report.kind, id = %report.id, error = %e, "Status callback failed");
            }
        }
    }
}

#[async_trait]
impl Finalizer for CallbackFinalizer {
    async fn successful_completion(&self, ctx: &RequestContext, entity: &Entity, completion: Completion) -> Result<()> {
        self.local.successful_completion(ctx, entity, completion).await?;

        if completion.delete {
            self.send(vec![report(entity.kind(), entity.id(), Some(ProvisioningStatus::Deleted), None)])
                .await;
            return Ok(());
        }

        let mut reports = vec![report(
            entity.kind(),
            entity.id(),
            Some(ProvisioningStatus::Active),
            Some(OperatingStatus::Online),
        )];
        // a realized LB realizes every child that was waiting on it
        if let Entity::LoadBalancer(lb) = entity {
            reports.extend(
                lb.descendants()
                    .into_iter()
                    .filter(|(_, _, status)| status.is_pending() && *status != ProvisioningStatus::PendingDelete)
                    .map(|(kind, id, _)| report(kind, id, Some(ProvisioningStatus::Active), Some(OperatingStatus::Online))),
            );
        }
        self.send(reports).await;
        Ok(())
    }

    async fn failed_completion(&self, ctx: &RequestContext, entity: &Entity) -> Result<()> {
        self.local.failed_completion(ctx, entity).await?;
        self.send(vec![report(
            entity.kind(),
            entity.id(),
            Some(ProvisioningStatus::Error),
            Some(OperatingStatus::Error),
        )])
        .await;
        Ok(())
    }

    async fn update_status(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        id: &str,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Result<()> {
        self.local
            .update_status(ctx, kind, id, provisioning, operating)
            .await?;
        self.send(vec![report(kind, id, provisioning, operating)]).await;
        Ok(())
    }

    async fn update_loadbalancer_stats(&self, ctx: &RequestContext, lb_id: &str, stats: LoadBalancerStats) -> Result<()> {
        self.local
            .update_loadbalancer_stats(ctx, lb_id, stats.clone())
            .await?;
        let event = InfoContainer::new("loadbalancer_stats", lb_id, serde_json::to_value(&stats)?);
        if let Err(e) = self.reporter.publish(&event).await {
            warn!(lb_id = %lb_id, error = %e, "Stats publish failed");
        }
        Ok(())
    }
}
