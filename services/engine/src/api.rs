//! Inbound HTTP surface of the engine
//!
//! Controllers publish status events onto the topic, agents report
//! heartbeats and per-entity outcomes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::rpc::{StatusReport, REPORT_STATE_PATH, UPDATE_STATUS_PATH};
use crate::agent::scheduler::{AgentRegistry, Heartbeat};
use crate::completion::{EventHandler, EventPublisher, InfoContainer, InfoType};
use crate::context::RequestContext;
use crate::error::{ErrorKind, LbaasError};

#[derive(Clone)]
pub struct ApiState {
    pub publisher: EventPublisher,
    pub events: Arc<EventHandler>,
    pub agents: Option<Arc<AgentRegistry>>,
    pub providers: Vec<String>,
}

/// Error rendered as `{"error": kind, "message": ...}`
pub struct ApiError(LbaasError);

impl From<LbaasError> for ApiError {
    fn from(e: LbaasError) -> Self {
        Self(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::BadRequest | ErrorKind::ModelMap => StatusCode::BAD_REQUEST,
        ErrorKind::NotAuthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status_for(kind), body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/topics/:topic/events", post(publish_event))
        .route(REPORT_STATE_PATH, post(report_state))
        .route(UPDATE_STATUS_PATH, post(update_status))
        .with_state(state)
}

async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "lbaas-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.providers,
    }))
}

async fn publish_event(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Json(event): Json<InfoContainer>,
) -> Result<StatusCode, ApiError> {
    if topic != state.publisher.topic() {
        return Err(LbaasError::not_found("topic", &topic).into());
    }
    InfoType::parse(&event.info_type)?;
    debug!(info_type = %event.info_type, info_id = %event.info_id, "Status event received");
    state.publisher.publish(event).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn report_state(
    State(state): State<ApiState>,
    Json(heartbeat): Json<Heartbeat>,
) -> Result<StatusCode, ApiError> {
    let Some(agents) = &state.agents else {
        warn!(host = %heartbeat.host, "Heartbeat from an agent while the agent provider is disabled");
        return Err(LbaasError::not_found("provider", "agent").into());
    };
    agents.report_state(heartbeat);
    Ok(StatusCode::NO_CONTENT)
}

async fn update_status(
    State(state): State<ApiState>,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ApiError> {
    let ctx = RequestContext::admin();
    state
        .events
        .apply_status(&ctx, report.kind, &report.id, report.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::topic;
    use crate::model::{fixtures, EntityKind, ProvisioningStatus};
    use crate::plugin::StoreFinalizer;
    use crate::store::{InMemoryStore, ObjectStore};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Served {
        base: String,
        store: Arc<InMemoryStore>,
        agents: Arc<AgentRegistry>,
        shutdown: CancellationToken,
    }

    impl Drop for Served {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn serve() -> Served {
        let store = Arc::new(InMemoryStore::new());
        let mut lb = fixtures::loadbalancer();
        lb.provisioning_status = ProvisioningStatus::PendingUpdate;
        store.upsert_entity(lb.into()).await.unwrap();
        let finalizer = Arc::new(StoreFinalizer::new(store.clone()));
        let events = Arc::new(EventHandler::new(store.clone(), finalizer));
        let (publisher, consumer) = topic("lbaas_events", 16, events.clone());
        let shutdown = CancellationToken::new();
        consumer.spawn(shutdown.clone());
        let agents = Arc::new(AgentRegistry::new(Duration::from_secs(75)));
        let app = router(ApiState {
            publisher,
            events,
            agents: Some(agents.clone()),
            providers: vec!["agent".into()],
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Served {
            base: format!("http://{}", addr),
            store,
            agents,
            shutdown,
        }
    }

    async fn lb_status(store: &InMemoryStore) -> ProvisioningStatus {
        store
            .get_loadbalancer(fixtures::LB_ID)
            .await
            .unwrap()
            .provisioning_status
    }

    #[tokio::test]
    async fn test_published_event_reaches_the_store() {
        let served = serve().await;
        let client = reqwest::Client::new();
        let event = InfoContainer::status(
            EntityKind::LoadBalancer,
            fixtures::LB_ID,
            Some(ProvisioningStatus::Active),
            None,
        );
        let response = client
            .post(format!("{}/v1/topics/lbaas_events/events", served.base))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

        for _ in 0..100 {
            if lb_status(&served.store).await == ProvisioningStatus::Active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status event was never applied");
    }

    #[tokio::test]
    async fn test_bad_events_are_rejected() {
        let served = serve().await;
        let client = reqwest::Client::new();
        let event = InfoContainer::new("amphora", "x", Value::Null);
        let response = client
            .post(format!("{}/v1/topics/lbaas_events/events", served.base))
            .json(&event)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "ModelMap");

        let response = client
            .post(format!("{}/v1/topics/other/events", served.base))
            .json(&InfoContainer::new("loadbalancer", "x", json!({})))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_callbacks() {
        let served = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}{}", served.base, REPORT_STATE_PATH))
            .json(&Heartbeat {
                host: "agent-1".into(),
                address: "10.0.0.7:9100".into(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        assert!(served.agents.is_alive("agent-1", chrono::Utc::now()));

        let response = client
            .post(format!("{}{}", served.base, UPDATE_STATUS_PATH))
            .json(&json!({
                "kind": "loadbalancer",
                "id": fixtures::LB_ID,
                "provisioning_status": "ERROR",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(lb_status(&served.store).await, ProvisioningStatus::Error);
    }
}
