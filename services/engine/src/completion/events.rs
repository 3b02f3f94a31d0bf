//! Status event stream
//!
//! Controllers push `InfoContainer` messages onto a topic. A single
//! consumer applies them in arrival order: entity status changes go
//! through the finalizer, aggregated LB counters replace the stored ones.

use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::driver::{Completion, Finalizer};
use crate::error::{LbaasError, Result};
use crate::model::{EntityKind, LoadBalancerStats, OperatingStatus, ProvisioningStatus};
use crate::store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoContainer {
    pub info_type: String,
    pub info_id: String,
    #[serde(default)]
    pub info_payload: serde_json::Value,
}

impl InfoContainer {
    pub fn new(info_type: impl Into<String>, info_id: impl Into<String>, info_payload: serde_json::Value) -> Self {
        Self {
            info_type: info_type.into(),
            info_id: info_id.into(),
            info_payload,
        }
    }

    pub fn status(
        kind: EntityKind,
        id: impl Into<String>,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Self {
        Self::new(
            kind.as_str(),
            id,
            serde_json::to_value(StatusPayload {
                provisioning_status: provisioning,
                operating_status: operating,
            })
            .unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    Status(EntityKind),
    LoadBalancerStats,
    ListenerStats,
}

impl InfoType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "loadbalancer" => Ok(InfoType::Status(EntityKind::LoadBalancer)),
            "listener" => Ok(InfoType::Status(EntityKind::Listener)),
            "pool" => Ok(InfoType::Status(EntityKind::Pool)),
            "member" => Ok(InfoType::Status(EntityKind::Member)),
            "loadbalancer_stats" => Ok(InfoType::LoadBalancerStats),
            "listener_stats" => Ok(InfoType::ListenerStats),
            other => Err(LbaasError::ModelMap(format!("unknown info_type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_status: Option<ProvisioningStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_status: Option<OperatingStatus>,
}

pub struct EventHandler {
    store: Arc<dyn ObjectStore>,
    finalizer: Arc<dyn Finalizer>,
}

impl EventHandler {
    pub fn new(store: Arc<dyn ObjectStore>, finalizer: Arc<dyn Finalizer>) -> Self {
        Self { store, finalizer }
    }

    pub async fn handle(&self, event: InfoContainer) -> Result<()> {
        let ctx = RequestContext::admin();
        match InfoType::parse(&event.info_type)? {
            InfoType::Status(kind) => {
                let payload: StatusPayload = serde_json::from_value(event.info_payload)
                    .map_err(|e| LbaasError::BadRequest(format!("status payload: {}", e)))?;
                self.apply_status(&ctx, kind, &event.info_id, payload).await
            }
            InfoType::LoadBalancerStats => {
                let stats: LoadBalancerStats = serde_json::from_value(event.info_payload)
                    .map_err(|e| LbaasError::BadRequest(format!("stats payload: {}", e)))?;
                self.finalizer
                    .update_loadbalancer_stats(&ctx, &event.info_id, stats)
                    .await
            }
            InfoType::ListenerStats => {
                debug!(listener_id = %event.info_id, "Ignoring listener stats");
                Ok(())
            }
        }
    }

    /// Apply one status report to a stored entity
    pub async fn apply_status(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        id: &str,
        payload: StatusPayload,
    ) -> Result<()> {
        let entity = match self.store.get_entity(kind, id).await {
            Ok(entity) => entity,
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, id = %id, "Status event for an entity that is gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match payload.provisioning_status {
            Some(ProvisioningStatus::Deleted) => {
                self.finalizer
                    .successful_completion(ctx, &entity, Completion::delete())
                    .await
            }
            Some(ProvisioningStatus::Active) => {
                self.finalizer
                    .successful_completion(ctx, &entity, Completion::default())
                    .await?;
                match payload.operating_status {
                    Some(op) if op != OperatingStatus::Online => {
                        self.finalizer.update_status(ctx, kind, id, None, Some(op)).await
                    }
                    _ => Ok(()),
                }
            }
            Some(ProvisioningStatus::Error) => self.finalizer.failed_completion(ctx, &entity).await,
            provisioning => {
                self.finalizer
                    .update_status(ctx, kind, id, provisioning, payload.operating_status)
                    .await
            }
        }
    }
}

/// Producer side of the status topic
#[derive(Clone)]
pub struct EventPublisher {
    topic: String,
    tx: Sender<InfoContainer>,
}

impl EventPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, event: InfoContainer) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| LbaasError::ServiceUnavailable(format!("topic {} is closed", self.topic)))
    }
}

pub struct EventConsumer {
    handler: Arc<EventHandler>,
    rx: Receiver<InfoContainer>,
}

/// A bounded topic and the consumer draining it
pub fn topic(name: &str, capacity: usize, handler: Arc<EventHandler>) -> (EventPublisher, EventConsumer) {
    let (tx, rx) = bounded(capacity);
    (
        EventPublisher {
            topic: name.to_string(),
            tx,
        },
        EventConsumer { handler, rx },
    )
}

impl EventConsumer {
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Status event consumer started");
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = self.rx.recv() => match received {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                };
                let (info_type, info_id) = (event.info_type.clone(), event.info_id.clone());
                if let Err(e) = self.handler.handle(event).await {
                    warn!(info_type = %info_type, info_id = %info_id, error = %e, "Dropped status event");
                }
            }
            info!("Status event consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::plugin::StoreFinalizer;
    use crate::store::InMemoryStore;

    async fn handler() -> (Arc<InMemoryStore>, EventHandler) {
        let store = Arc::new(InMemoryStore::new());
        let mut lb = fixtures::loadbalancer();
        lb.provisioning_status = ProvisioningStatus::PendingUpdate;
        lb.pools[0].members[0].provisioning_status = ProvisioningStatus::PendingCreate;
        store.upsert_entity(lb.into()).await.unwrap();
        let finalizer = Arc::new(StoreFinalizer::new(store.clone()));
        (store.clone(), EventHandler::new(store, finalizer))
    }

    #[test]
    fn test_info_type_parsing() {
        assert_eq!(
            InfoType::parse("member").unwrap(),
            InfoType::Status(EntityKind::Member)
        );
        assert_eq!(InfoType::parse("listener_stats").unwrap(), InfoType::ListenerStats);
        assert!(matches!(InfoType::parse("amphora"), Err(LbaasError::ModelMap(_))));
    }

    #[tokio::test]
    async fn test_active_member_event() {
        let (store, handler) = handler().await;
        handler
            .handle(InfoContainer::status(
                EntityKind::Member,
                "sample_member_id_1",
                Some(ProvisioningStatus::Active),
                Some(OperatingStatus::Degraded),
            ))
            .await
            .unwrap();
        let lb = store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        let member = lb.member("sample_member_id_1").unwrap();
        assert_eq!(member.provisioning_status, ProvisioningStatus::Active);
        assert_eq!(member.operating_status, OperatingStatus::Degraded);
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_deleted_and_error_events() {
        let (store, handler) = handler().await;
        handler
            .handle(InfoContainer::status(
                EntityKind::Member,
                "sample_member_id_2",
                Some(ProvisioningStatus::Deleted),
                None,
            ))
            .await
            .unwrap();
        handler
            .handle(InfoContainer::status(
                EntityKind::Pool,
                fixtures::POOL_ID,
                Some(ProvisioningStatus::Error),
                None,
            ))
            .await
            .unwrap();
        let lb = store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        assert!(lb.member("sample_member_id_2").is_none());
        assert_eq!(lb.pools[0].provisioning_status, ProvisioningStatus::Error);
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Error);
    }

    #[tokio::test]
    async fn test_stats_replace_counters_and_gone_entities_are_ignored() {
        let (store, handler) = handler().await;
        handler
            .handle(InfoContainer::new(
                "loadbalancer_stats",
                fixtures::LB_ID,
                serde_json::json!({"bytes_in": 10, "bytes_out": 20, "active_connections": 1, "total_connections": 7}),
            ))
            .await
            .unwrap();
        let stats = store.get_loadbalancer_stats(fixtures::LB_ID).await.unwrap();
        assert_eq!(stats.bytes_in, 10);
        assert_eq!(stats.total_connections, 7);

        handler
            .handle(InfoContainer::status(
                EntityKind::Listener,
                "no_such_listener",
                Some(ProvisioningStatus::Active),
                None,
            ))
            .await
            .unwrap();
        handler
            .handle(InfoContainer::new("listener_stats", fixtures::LISTENER_ID, serde_json::json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consumer_drains_topic() {
        let (store, handler) = handler().await;
        let (publisher, consumer) = topic("neutron_lbaas_event", 4, Arc::new(handler));
        let shutdown = CancellationToken::new();
        let task = consumer.spawn(shutdown.clone());
        publisher
            .publish(InfoContainer::new("bogus", "x", serde_json::Value::Null))
            .await
            .unwrap();
        publisher
            .publish(InfoContainer::status(
                EntityKind::LoadBalancer,
                fixtures::LB_ID,
                Some(ProvisioningStatus::Active),
                None,
            ))
            .await
            .unwrap();

        let mut lb = store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        for _ in 0..100 {
            if lb.provisioning_status == ProvisioningStatus::Active {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            lb = store.get_loadbalancer(fixtures::LB_ID).await.unwrap();
        }
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
        shutdown.cancel();
        task.await.unwrap();
    }
}
