//! LBaaS Agent Worker
//!
//! Receives casts from the engine, realizes them with the local HAProxy
//! driver and reports outcomes back over the engine's callback endpoints.

mod processor;
mod reporter;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{bounded, Receiver, Sender};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use lbaas_engine::agent::rpc::{Cast, CASTS_PATH};
use lbaas_engine::agent::scheduler::Heartbeat;
use lbaas_engine::config::Settings;
use lbaas_engine::haproxy::executor::HostExecutor;
use lbaas_engine::haproxy::{HaproxyCore, HaproxyDriver};
use lbaas_engine::network::InMemoryNetwork;
use lbaas_engine::store::InMemoryStore;
use lbaas_engine::{Finalizer, StoreFinalizer};

use processor::CastProcessor;
use reporter::{spawn_heartbeat, CallbackFinalizer, EngineReporter};

const CAST_QUEUE_CAPACITY: usize = 1000;
const MAX_RECENT_CASTS: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// INI configuration file
    #[arg(long, env = "LBAAS_CONFIG_FILE", default_value = "/etc/neutron/neutron_lbaas.conf")]
    config_file: PathBuf,

    /// Address casts are accepted on
    #[arg(long, env = "LBAAS_AGENT_BIND", default_value = "0.0.0.0:9100")]
    bind: SocketAddr,

    /// Base URL of the engine's callback endpoints
    #[arg(long, env = "LBAAS_ENGINE_URL", default_value = "http://127.0.0.1:9877")]
    engine_url: String,

    /// host:port the engine should cast to; defaults to the bind address
    #[arg(long, env = "LBAAS_AGENT_ADVERTISE")]
    advertise: Option<String>,

    /// Seconds between heartbeats
    #[arg(long, env = "LBAAS_AGENT_REPORT_INTERVAL", default_value_t = 30)]
    report_interval: u64,
}

#[derive(Clone)]
struct AppState {
    casts_tx: Sender<(String, Cast)>,
    casts_rx: Receiver<(String, Cast)>,
    recent: Arc<RwLock<Vec<CastRecord>>>,
}

impl AppState {
    fn new() -> Self {
        let (casts_tx, casts_rx) = bounded(CAST_QUEUE_CAPACITY);
        Self {
            casts_tx,
            casts_rx,
            recent: Arc::new(RwLock::new(Vec::new())),
        }
    }

    async fn set_status(&self, cast_id: &str, status: &str, error: Option<String>) {
        let mut recent = self.recent.write().await;
        if let Some(record) = recent.iter_mut().find(|r| r.cast_id == cast_id) {
            record.status = status.to_string();
            record.error = error;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastRecord {
    pub cast_id: String,
    pub method: String,
    pub lb_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(CASTS_PATH, post(submit_cast))
        .route(CASTS_PATH, get(list_casts))
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lbaas-agent-worker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn submit_cast(
    State(state): State<AppState>,
    Json(cast): Json<Cast>,
) -> (StatusCode, Json<serde_json::Value>) {
    let cast_id = Uuid::new_v4().to_string();
    let record = CastRecord {
        cast_id: cast_id.clone(),
        method: cast.method.clone(),
        lb_id: cast.loadbalancer.id.clone(),
        status: "queued".to_string(),
        error: None,
    };

    {
        let mut recent = state.recent.write().await;
        recent.push(record);
        if recent.len() > MAX_RECENT_CASTS {
            let excess = recent.len() - MAX_RECENT_CASTS;
            recent.drain(..excess);
        }
    }

    if state.casts_tx.send((cast_id.clone(), cast)).await.is_err() {
        state
            .set_status(&cast_id, "failed", Some("worker is shutting down".into()))
            .await;
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"cast_id": cast_id, "status": "failed"})),
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"cast_id": cast_id, "status": "queued"})),
    )
}

async fn list_casts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let casts = state.recent.read().await;
    Json(serde_json::json!({"casts": casts.clone(), "count": casts.len()}))
}

/// Apply queued casts one at a time until shutdown
fn spawn_processor(state: AppState, processor: Arc<CastProcessor>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (cast_id, cast) = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = state.casts_rx.recv() => match next {
                    Ok(next) => next,
                    Err(_) => break,
                },
            };

            state.set_status(&cast_id, "running", None).await;
            let method = cast.method.clone();
            match processor.handle(cast).await {
                Ok(()) => state.set_status(&cast_id, "completed", None).await,
                Err(e) => {
                    error!(cast_id = %cast_id, method = %method, error = %e, "Cast failed");
                    state.set_status(&cast_id, "failed", Some(e.to_string())).await;
                }
            }
        }
        info!("Cast processor stopped");
    })
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config_file)
        .with_context(|| format!("loading {}", cli.config_file.display()))?;
    let advertise = cli.advertise.clone().unwrap_or_else(|| cli.bind.to_string());
    info!(
        host = %settings.host,
        advertise = %advertise,
        engine = %cli.engine_url,
        "Starting LBaaS agent worker"
    );

    let reporter = Arc::new(
        EngineReporter::new(
            &cli.engine_url,
            &settings.event_topic,
            Duration::from_secs(settings.agent.cast_timeout),
        )
        .context("engine callback client")?,
    );

    let store = Arc::new(InMemoryStore::new());
    let network = Arc::new(InMemoryNetwork::new());
    let finalizer: Arc<dyn Finalizer> = Arc::new(CallbackFinalizer::new(
        StoreFinalizer::new(store.clone()),
        reporter.clone(),
    ));
    let core = HaproxyCore::new(
        settings.haproxy.clone(),
        settings.host.clone(),
        store.clone(),
        network.clone(),
        finalizer,
        Arc::new(HostExecutor::new(settings.haproxy.command_timeout())),
    );
    let driver = HaproxyDriver::new(core);
    if let Err(e) = driver.core().recover().await {
        warn!(error = %e, "Instance recovery failed");
    }

    let shutdown = CancellationToken::new();
    let mut workers = vec![
        driver.core().clone().spawn_stats_collector(shutdown.clone()),
        spawn_heartbeat(
            reporter,
            Heartbeat {
                host: settings.host.clone(),
                address: advertise,
            },
            Duration::from_secs(cli.report_interval),
            shutdown.clone(),
        ),
    ];

    let state = AppState::new();
    let processor = Arc::new(CastProcessor::new(store, network, Arc::new(driver)));
    workers.push(spawn_processor(state.clone(), processor, shutdown.clone()));

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(addr = %cli.bind, "Agent worker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Agent worker stopped");
    Ok(())
}
