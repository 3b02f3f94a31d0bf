//! Engine stand-in and sample graphs for the worker's tests

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use lbaas_engine::agent::rpc::{StatusReport, REPORT_STATE_PATH, UPDATE_STATUS_PATH};
use lbaas_engine::agent::scheduler::Heartbeat;
use lbaas_engine::completion::InfoContainer;
use lbaas_engine::model::{
    EntityKind, LbAlgorithm, Listener, LoadBalancer, Member, Pool, Protocol, ProvisioningStatus,
};

pub const LB_ID: &str = "lb-1";
pub const POOL_ID: &str = "pool-1";
pub const SUBNET_ID: &str = "subnet-1";

/// Active LB with one HTTP listener and a two-member pool
pub fn loadbalancer() -> LoadBalancer {
    let mut lb = LoadBalancer::new(LB_ID, "project-1", SUBNET_ID);
    lb.vip_address = Some("10.0.0.2".to_string());
    lb.vip_port_id = Some("vip-port-1".to_string());
    lb.provisioning_status = ProvisioningStatus::Active;

    let mut listener = Listener::new("listener-1", LB_ID, Protocol::Http, 80);
    listener.default_pool_id = Some(POOL_ID.to_string());
    listener.provisioning_status = ProvisioningStatus::Active;

    let mut pool = Pool::new(POOL_ID, LB_ID, Protocol::Http, LbAlgorithm::RoundRobin);
    pool.listener_id = Some(listener.id.clone());
    pool.provisioning_status = ProvisioningStatus::Active;
    pool.members = vec![member("member-1", "10.0.0.10"), member("member-2", "10.0.0.11")];

    lb.listeners.push(listener);
    lb.pools.push(pool);
    lb
}

pub fn member(id: &str, address: &str) -> Member {
    let mut member = Member::new(id, LB_ID, POOL_ID, address, 8080);
    member.provisioning_status = ProvisioningStatus::Active;
    member
}

#[derive(Default)]
pub struct Engine {
    pub statuses: Mutex<Vec<StatusReport>>,
    pub events: Mutex<Vec<(String, InfoContainer)>>,
    pub heartbeats: Mutex<Vec<Heartbeat>>,
}

impl Engine {
    pub fn statuses(&self) -> Vec<(EntityKind, String, Option<ProvisioningStatus>)> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.kind, r.id.clone(), r.status.provisioning_status))
            .collect()
    }
}

async fn status(State(engine): State<Arc<Engine>>, Json(report): Json<StatusReport>) -> StatusCode {
    engine.statuses.lock().unwrap().push(report);
    StatusCode::NO_CONTENT
}

async fn event(
    State(engine): State<Arc<Engine>>,
    Path(topic): Path<String>,
    Json(event): Json<InfoContainer>,
) -> StatusCode {
    engine.events.lock().unwrap().push((topic, event));
    StatusCode::ACCEPTED
}

async fn heartbeat(State(engine): State<Arc<Engine>>, Json(hb): Json<Heartbeat>) -> StatusCode {
    engine.heartbeats.lock().unwrap().push(hb);
    StatusCode::NO_CONTENT
}

/// Serve the engine's callback routes on an ephemeral port
pub async fn serve(engine: Arc<Engine>) -> String {
    let app = Router::new()
        .route(UPDATE_STATUS_PATH, post(status))
        .route("/v1/topics/:topic/events", post(event))
        .route(REPORT_STATE_PATH, post(heartbeat))
        .with_state(engine);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
