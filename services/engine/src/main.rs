//! LBaaS engine
//!
//! Builds the enabled provider drivers, starts their completion workers and
//! serves the status-event and agent callback endpoints.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lbaas_engine::agent::rpc::HttpAgentRpc;
use lbaas_engine::agent::scheduler::{scheduler_for, AgentRegistry, Rescheduler};
use lbaas_engine::agent::{AgentCore, AgentDriver};
use lbaas_engine::api::{self, ApiState};
use lbaas_engine::auth::ServiceAuth;
use lbaas_engine::certificates::{BarbicanClient, CertManager, LocalCertManager, SecretStoreCertManager};
use lbaas_engine::completion::{topic, EventHandler};
use lbaas_engine::config::{CertManagerType, Settings};
use lbaas_engine::driver::noop::LoggingNoopDriver;
use lbaas_engine::haproxy::executor::HostExecutor;
use lbaas_engine::haproxy::{HaproxyCore, HaproxyDriver};
use lbaas_engine::network::{InMemoryNetwork, NetworkApi};
use lbaas_engine::orchestrator::client::OctaviaClient;
use lbaas_engine::orchestrator::OrchestratorDriver;
use lbaas_engine::rest::client::RestClient;
use lbaas_engine::rest::{WorkflowCore, WorkflowDriver};
use lbaas_engine::store::{InMemoryStore, ObjectStore};
use lbaas_engine::{DriverRegistry, Finalizer, StoreFinalizer};

const EVENT_TOPIC_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// INI configuration file
    #[arg(long, env = "LBAAS_CONFIG_FILE", default_value = "/etc/neutron/neutron_lbaas.conf")]
    config_file: PathBuf,

    /// Address the callback endpoints listen on
    #[arg(long, env = "LBAAS_BIND", default_value = "0.0.0.0:9877")]
    bind: SocketAddr,
}

struct Engine {
    registry: DriverRegistry,
    agents: Option<Arc<AgentRegistry>>,
    workers: Vec<JoinHandle<()>>,
}

fn cert_manager(settings: &Settings, auth: Option<&Arc<ServiceAuth>>) -> Result<Arc<dyn CertManager>> {
    Ok(match settings.certificates.manager {
        CertManagerType::Local => Arc::new(LocalCertManager::new(&settings.certificates.storage_path)),
        CertManagerType::Barbican => {
            let auth = auth.context("barbican certificates need [service_auth] auth_url")?;
            Arc::new(SecretStoreCertManager::new(Arc::new(BarbicanClient::new(auth.clone()))))
        }
    })
}

async fn build_engine(
    settings: &Settings,
    store: Arc<dyn ObjectStore>,
    network: Arc<dyn NetworkApi>,
    finalizer: Arc<dyn Finalizer>,
    shutdown: &CancellationToken,
) -> Result<Engine> {
    let auth = match &settings.service_auth.auth_url {
        Some(_) => Some(Arc::new(
            ServiceAuth::new(settings.service_auth.clone()).context("service auth")?,
        )),
        None => None,
    };
    let certs = cert_manager(settings, auth.as_ref())?;

    let mut registry = DriverRegistry::new();
    let mut agents = None;
    let mut workers = Vec::new();

    for provider in &settings.enabled_providers {
        match provider.as_str() {
            lbaas_engine::haproxy::DRIVER_NAME => {
                let executor = Arc::new(HostExecutor::new(settings.haproxy.command_timeout()));
                let core = HaproxyCore::new(
                    settings.haproxy.clone(),
                    settings.host.clone(),
                    store.clone(),
                    network.clone(),
                    finalizer.clone(),
                    executor,
                )
                .with_cert_manager(certs.clone());
                let driver = HaproxyDriver::new(core);
                if let Err(e) = driver.core().recover().await {
                    error!(error = %e, "Instance recovery failed");
                }
                workers.push(driver.core().clone().spawn_stats_collector(shutdown.clone()));
                registry.register(Arc::new(driver));
            }
            lbaas_engine::rest::DRIVER_NAME => {
                let client = RestClient::new(&settings.radware).context("workflow controller client")?;
                let driver = WorkflowDriver::new(WorkflowCore::new(
                    settings.radware.clone(),
                    client,
                    store.clone(),
                    network.clone(),
                    finalizer.clone(),
                ));
                let core = driver.core().clone();
                workers.push(core.spawn_operation_worker(shutdown.clone()));
                workers.push(Arc::new(core.sweeper()).spawn(core.sweep_interval(), shutdown.clone()));
                registry.register(Arc::new(driver));
            }
            lbaas_engine::orchestrator::DRIVER_NAME => {
                let client = OctaviaClient::new(&settings.octavia, auth.clone()).context("orchestrator client")?;
                let (driver, poller) = OrchestratorDriver::with_poller(
                    settings.octavia.clone(),
                    Arc::new(client),
                    store.clone(),
                    finalizer.clone(),
                );
                workers.push(poller.spawn(shutdown.clone()));
                registry.register(Arc::new(driver));
            }
            lbaas_engine::agent::DRIVER_NAME => {
                let agent_settings = &settings.agent;
                let agent_registry = Arc::new(AgentRegistry::new(Duration::from_secs(agent_settings.agent_down_time)));
                let rpc = Arc::new(
                    HttpAgentRpc::new(Duration::from_secs(agent_settings.cast_timeout)).context("agent RPC client")?,
                );
                let scheduler = scheduler_for(agent_settings.scheduler);
                let driver = AgentDriver::new(AgentCore::new(
                    agent_registry.clone(),
                    scheduler.clone(),
                    rpc.clone(),
                    store.clone(),
                    network.clone(),
                    finalizer.clone(),
                ));
                let rescheduler = Arc::new(Rescheduler::new(
                    agent_registry.clone(),
                    scheduler,
                    store.clone(),
                    network.clone(),
                    rpc,
                    finalizer.clone(),
                ));
                workers.push(rescheduler.spawn(
                    Duration::from_secs(agent_settings.reschedule_interval),
                    shutdown.clone(),
                ));
                agents = Some(agent_registry);
                registry.register(Arc::new(driver));
            }
            "noop" => registry.register(Arc::new(LoggingNoopDriver::new(finalizer.clone()))),
            other => {
                warn!(provider = %other, "Unknown provider; skipping");
                continue;
            }
        }
        info!(provider = %provider, "Provider enabled");
    }

    if let Err(e) = registry.set_default(&settings.default_provider) {
        warn!(provider = %settings.default_provider, error = %e, "Default provider is not enabled");
    }

    Ok(Engine {
        registry,
        agents,
        workers,
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
    info!(
        config = %cli.config_file.display(),
        providers = ?settings.enabled_providers,
        "Starting LBaaS engine"
    );

    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
    let network: Arc<dyn NetworkApi> = Arc::new(InMemoryNetwork::new());
    let finalizer: Arc<dyn Finalizer> =
        Arc::new(StoreFinalizer::new(store.clone()).with_network(network.clone()));

    let shutdown = CancellationToken::new();
    let engine = build_engine(&settings, store.clone(), network, finalizer.clone(), &shutdown).await?;

    let events = Arc::new(EventHandler::new(store, finalizer));
    let (publisher, consumer) = topic(&settings.event_topic, EVENT_TOPIC_CAPACITY, events.clone());
    let mut workers = engine.workers;
    workers.push(consumer.spawn(shutdown.clone()));

    let app = api::router(ApiState {
        publisher,
        events,
        agents: engine.agents,
        providers: engine.registry.names(),
    })
    .layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    info!(addr = %cli.bind, topic = %settings.event_topic, "Engine listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Engine stopped");
    Ok(())
}
