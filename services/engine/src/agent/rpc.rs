//! Wire format and transport for agent casts

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::completion::events::StatusPayload;
use crate::error::{LbaasError, RestFailure, Result};
use crate::model::{Entity, EntityKind, LoadBalancer};
use crate::network::{Port, Subnet};

pub const CASTS_PATH: &str = "/v1/casts";
pub const REPORT_STATE_PATH: &str = "/v1/agents/report_state";
pub const UPDATE_STATUS_PATH: &str = "/v1/agents/update_status";

pub const REFRESH_METHOD: &str = "refresh_loadbalancer";

/// One operation cast to an agent.
///
/// `loadbalancer` is the graph as stored when the cast was issued, so the
/// agent can realize the whole LB without reading the engine's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cast {
    pub method: String,
    pub entity: Entity,
    pub loadbalancer: LoadBalancer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_port: Option<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_subnet: Option<Subnet>,
}

impl Cast {
    pub fn new(op: &str, entity: Entity, loadbalancer: LoadBalancer) -> Self {
        Self {
            method: format!("{}_{}", op, entity.kind()),
            entity,
            loadbalancer,
            vip_port: None,
            vip_subnet: None,
        }
    }

    pub fn refresh(loadbalancer: LoadBalancer) -> Self {
        let entity = loadbalancer.clone().into();
        Self {
            method: REFRESH_METHOD.to_string(),
            ..Self::new("refresh", entity, loadbalancer)
        }
    }

    /// Attach the VIP port and subnet the agent has to plug
    pub fn with_network(mut self, vip_port: Option<Port>, vip_subnet: Option<Subnet>) -> Self {
        self.vip_port = vip_port;
        self.vip_subnet = vip_subnet;
        self
    }

    /// Operation half of the method name (`create`, `update`, ...)
    pub fn operation(&self) -> &str {
        self.method
            .split_once('_')
            .map(|(op, _)| op)
            .unwrap_or(&self.method)
    }
}

/// Status callback an agent posts once it has realized a cast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub kind: EntityKind,
    pub id: String,
    #[serde(flatten)]
    pub status: StatusPayload,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentCast: Send + Sync {
    /// Deliver `cast` to the agent listening on `address`
    async fn cast(&self, address: &str, cast: &Cast) -> Result<()>;
}

pub struct HttpAgentRpc {
    http: Client,
}

impl HttpAgentRpc {
    pub fn new(cast_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(cast_timeout)
            .build()
            .map_err(|e| LbaasError::Unknown(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AgentCast for HttpAgentRpc {
    async fn cast(&self, address: &str, cast: &Cast) -> Result<()> {
        let url = format!("http://{}{}", address, CASTS_PATH);
        debug!(address = %address, method = %cast.method, "Casting to agent");
        let response = self
            .http
            .post(&url)
            .json(cast)
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
}
