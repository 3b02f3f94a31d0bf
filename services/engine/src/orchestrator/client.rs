//! Orchestrator REST client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::auth::ServiceAuth;
use crate::completion::{LoadBalancerProbe, ProbeReport};
use crate::config::OctaviaSettings;
use crate::error::{LbaasError, RestFailure, Result};
use crate::model::ProvisioningStatus;

const TOKEN_HEADER: &str = "X-Auth-Token";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct OctaviaClient {
    http: Client,
    base_url: String,
    auth: Option<Arc<ServiceAuth>>,
}

impl OctaviaClient {
    pub fn new(settings: &OctaviaSettings, auth: Option<Arc<ServiceAuth>>) -> Result<Self> {
        let http = match &auth {
            Some(auth) => auth.client().clone(),
            None => Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .map_err(|e| LbaasError::Unknown(format!("failed to build HTTP client: {}", e)))?,
        };
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    async fn send(&self, method: &Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path));
        if let Some(auth) = &self.auth {
            request = request.header(TOKEN_HEADER, auth.token().await?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| LbaasError::from(RestFailure::connect(e.to_string())))
    }

    /// Issue a request; the decoded body when there is one
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let mut response = self.send(&method, path, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(auth) = &self.auth {
                debug!(path = %path, "Orchestrator rejected token; re-authenticating");
                auth.invalidate().await;
                response = self.send(&method, path, body).await?;
            }
        }
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RestFailure::connect(e.to_string()))?;
        if !status.is_success() {
            return Err(RestFailure::new(
                status.as_u16() as i32,
                status.canonical_reason().unwrap_or("error"),
                text,
            )
            .into());
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<()> {
        self.request(Method::POST, path, Some(body)).await.map(|_| ())
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.request(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::DELETE, path, None).await.map(|_| ())
    }

    /// The LB document, `None` when the orchestrator does not know it
    pub async fn get_loadbalancer(&self, lb_id: &str) -> Result<Option<Value>> {
        match self
            .request(Method::GET, &format!("/v1/loadbalancers/{}", lb_id), None)
            .await
        {
            Ok(body) => Ok(body),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Read provisioning status and VIP from an LB document
pub fn probe_report(body: &Value) -> Result<ProbeReport> {
    let status = body
        .get("provisioning_status")
        .and_then(Value::as_str)
        .ok_or_else(|| LbaasError::Unknown("load balancer document has no provisioning_status".into()))?;
    let provisioning_status = ProvisioningStatus::parse(status)
        .ok_or_else(|| LbaasError::Unknown(format!("unknown provisioning status {}", status)))?;
    let vip = body.get("vip");
    let field = |name: &str| {
        vip.and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Ok(ProbeReport {
        provisioning_status,
        vip_address: field("ip_address"),
        vip_port_id: field("port_id"),
    })
}

#[async_trait]
impl LoadBalancerProbe for OctaviaClient {
    async fn probe(&self, lb_id: &str) -> Result<ProbeReport> {
        match self.get_loadbalancer(lb_id).await? {
            Some(body) => probe_report(&body),
            None => Ok(ProbeReport::status(ProvisioningStatus::Deleted)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{serve, Orchestrator};
    use super::*;
    use serde_json::json;

    #[test]
    fn test_probe_report_reads_vip() {
        let report = probe_report(&json!({
            "provisioning_status": "ACTIVE",
            "vip": {"ip_address": "10.1.1.1", "port_id": "vip-port"}
        }))
        .unwrap();
        assert_eq!(report.provisioning_status, ProvisioningStatus::Active);
        assert_eq!(report.vip_address.as_deref(), Some("10.1.1.1"));
        assert_eq!(report.vip_port_id.as_deref(), Some("vip-port"));
        assert!(probe_report(&json!({"vip": {}})).is_err());
    }

    #[tokio::test]
    async fn test_unknown_lb_probes_as_deleted() {
        let orchestrator = Arc::new(Orchestrator::default());
        let settings = OctaviaSettings {
            base_url: serve(orchestrator).await,
            ..OctaviaSettings::default()
        };
        let client = OctaviaClient::new(&settings, None).unwrap();
        let report = client.probe("missing").await.unwrap();
        assert_eq!(report.provisioning_status, ProvisioningStatus::Deleted);
    }

    #[tokio::test]
    async fn test_mutations_reach_orchestrator() {
        let orchestrator = Arc::new(Orchestrator::default());
        let settings = OctaviaSettings {
            base_url: serve(orchestrator.clone()).await,
            ..OctaviaSettings::default()
        };
        let client = OctaviaClient::new(&settings, None).unwrap();
        client.post("/v1/loadbalancers", &json!({"id": "lb"})).await.unwrap();
        client.delete("/v1/loadbalancers/lb/delete_cascade").await.unwrap();
        let calls = orchestrator.calls();
        assert_eq!(calls[0].0, "POST");
        assert_eq!(calls[0].2["id"], "lb");
        assert_eq!(calls[1], ("DELETE".to_string(), "/v1/loadbalancers/lb/delete_cascade".to_string(), Value::Null));
    }
}
