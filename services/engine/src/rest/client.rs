//! Workflow controller REST client
//!
//! Session-token authentication with lazy login, one re-login on 401, and a
//! single primary/secondary flip when the controller cannot be reached.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RadwareSettings;
use crate::error::{LbaasError, RestFailure, Result, CONNECT_FAILURE};

const TOKEN_HEADER: &str = "X-Auth-Token";
const SESSION_PATH: &str = "/api/session";

/// Decoded controller reply
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    /// URI of an accepted asynchronous operation
    pub fn operation_uri(&self) -> Option<&str> {
        if self.status == StatusCode::ACCEPTED.as_u16() {
            self.body.get("uri").and_then(Value::as_str)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    primary: String,
    secondary: Option<String>,
}

#[derive(Deserialize)]
struct SessionBody {
    token: String,
}

pub struct RestClient {
    http: Client,
    endpoints: RwLock<Endpoints>,
    user: String,
    password: String,
    token: RwLock<Option<String>>,
}

fn base_url(address: &str, port: u16, ssl: bool) -> String {
    let scheme = if ssl { "https" } else { "http" };
    format!("{}://{}:{}", scheme, address, port)
}

impl RestClient {
    pub fn new(settings: &RadwareSettings) -> Result<Self> {
        let primary = settings.vdirect_address.as_deref().ok_or_else(|| {
            LbaasError::BadRequest("radwarev2.vdirect_address is not configured".into())
        })?;
        Self::with_endpoints(
            base_url(primary, settings.port, settings.ssl),
            settings
                .ha_secondary_address
                .as_deref()
                .map(|a| base_url(a, settings.port, settings.ssl)),
            settings.vdirect_user.clone(),
            settings.vdirect_password.clone(),
            Duration::from_secs(settings.timeout),
        )
    }

    pub fn with_endpoints(
        primary: impl Into<String>,
        secondary: Option<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        // Controllers commonly run with self-signed certificates
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| LbaasError::Unknown(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoints: RwLock::new(Endpoints {
                primary: primary.into(),
                secondary,
            }),
            user: user.into(),
            password: password.into(),
            token: RwLock::new(None),
        })
    }

    pub async fn primary(&self) -> String {
        self.endpoints.read().await.primary.clone()
    }

    async fn login(&self, base: &str) -> std::result::Result<String, RestFailure> {
        let response = self
            .http
            .post(format!("{}{}", base, SESSION_PATH))
            .json(&json!({"username": self.user, "password": self.password}))
            .send()
            .await
            .map_err(|e| RestFailure::connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RestFailure::new(
                status.as_u16() as i32,
                status.canonical_reason().unwrap_or("login failed"),
                text,
            ));
        }
        let body: SessionBody = response
            .json()
            .await
            .map_err(|e| RestFailure::new(status.as_u16() as i32, "invalid session reply", e.to_string()))?;
        info!(endpoint = %base, "Controller session established");
        Ok(body.token)
    }

    async fn token_for(&self, base: &str) -> std::result::Result<String, RestFailure> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        // one login at a time; late arrivals reuse the fresh session
        let mut slot = self.token.write().await;
        if let Some(token) = slot.clone() {
            return Ok(token);
        }
        let token = self.login(base).await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn send(
        &self,
        base: &str,
        token: &str,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, RestFailure> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", base, path))
            .header(TOKEN_HEADER, token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| RestFailure::connect(e.to_string()))
    }

    async fn call_once(
        &self,
        base: &str,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<RestResponse, RestFailure> {
        let token = self.token_for(base).await?;
        let mut response = self.send(base, &token, method, path, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path = %path, "Session rejected; logging in again");
            {
                let mut slot = self.token.write().await;
                if slot.as_deref() == Some(token.as_str()) {
                    *slot = None;
                }
            }
            let token = self.token_for(base).await?;
            response = self.send(base, &token, method, path, body).await?;
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RestFailure::connect(e.to_string()))?;
        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_client_error() || status.is_server_error() {
            let description = body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(RestFailure::new(
                status.as_u16() as i32,
                status.canonical_reason().unwrap_or("error"),
                description,
            ));
        }
        Ok(RestResponse {
            status: status.as_u16(),
            body,
        })
    }

    /// Fail over away from `failed`; `false` without a secondary.
    /// A no-op when a concurrent call already moved off `failed`.
    async fn flip(&self, failed: &str) -> bool {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.primary != failed {
            return true;
        }
        let Some(secondary) = endpoints.secondary.take() else {
            return false;
        };
        let old = std::mem::replace(&mut endpoints.primary, secondary);
        warn!(from = %old, to = %endpoints.primary, "Controller unreachable; failing over");
        endpoints.secondary = Some(old);
        // sessions belong to the old endpoint; cleared before anyone reads the new primary
        *self.token.write().await = None;
        true
    }

    pub async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<RestResponse> {
        let base = self.primary().await;
        match self.call_once(&base, &method, path, body).await {
            Err(failure) if failure.status == CONNECT_FAILURE => {
                if !self.flip(&base).await {
                    return Err(failure.into());
                }
                let base = self.primary().await;
                Ok(self.call_once(&base, &method, path, body).await?)
            }
            other => Ok(other?),
        }
    }

    pub async fn get(&self, path: &str) -> Result<RestResponse> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<RestResponse> {
        self.call(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestResponse> {
        self.call(Method::DELETE, path, None).await
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{closed_endpoint, serve, Controller};
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn client(primary: String, secondary: Option<String>) -> RestClient {
        RestClient::with_endpoints(primary, secondary, "vDirect", "radware", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_lazy_login_and_relogin_on_401() {
        let controller = Arc::new(Controller::default());
        controller.workflows.lock().unwrap().push("LB_1".into());
        let client = client(serve(controller.clone()).await, None);
        assert_eq!(controller.logins.load(Ordering::SeqCst), 0);

        let reply = client.get("/api/workflow/LB_1").await.unwrap();
        assert_eq!(reply.status, 200);
        client.get("/api/workflow/LB_1").await.unwrap();
        assert_eq!(controller.logins.load(Ordering::SeqCst), 1);

        controller.expire_sessions();
        client.get("/api/workflow/LB_1").await.unwrap();
        assert_eq!(controller.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_payload_is_structured() {
        let controller = Arc::new(Controller::default());
        let client = client(serve(controller).await, None);
        let err = client.get("/api/workflow/LB_missing").await.unwrap_err();
        match &err {
            LbaasError::Rest(failure) => {
                assert_eq!(failure.status, 404);
                assert_eq!(failure.reason, "Not Found");
                assert_eq!(failure.description, "no workflow LB_missing");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_connect_failure_flips_to_secondary_once() {
        let controller = Arc::new(Controller::default());
        controller.workflows.lock().unwrap().push("LB_1".into());
        let live = serve(controller.clone()).await;
        let dead = closed_endpoint().await;
        let client = client(dead.clone(), Some(live.clone()));

        let reply = client.get("/api/workflow/LB_1").await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(client.primary().await, live);

        // both down: one flip, then the failure surfaces
        let client = client_pair_down().await;
        let before = client.primary().await;
        let err = client.get("/api/workflow/LB_1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_ne!(client.primary().await, before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_fail_over_together() {
        let controller = Arc::new(Controller::default());
        controller.workflows.lock().unwrap().push("LB_1".into());
        let live = serve(controller.clone()).await;
        let client = Arc::new(client(closed_endpoint().await, Some(live.clone())));

        let calls = (0..8).map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("/api/workflow/LB_1").await })
        });
        for reply in futures::future::join_all(calls).await {
            assert_eq!(reply.unwrap().unwrap().status, 200);
        }
        assert_eq!(client.primary().await, live);
        assert_eq!(controller.logins.load(Ordering::SeqCst), 1);
    }

    async fn client_pair_down() -> RestClient {
        client(closed_endpoint().await, Some(closed_endpoint().await))
    }

    #[tokio::test]
    async fn test_connect_failure_without_secondary_is_unavailable() {
        let dead = closed_endpoint().await;
        let client = client(dead.clone(), None);
        let err = client.get("/api/workflow/LB_1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(client.primary().await, dead);
    }

    #[test]
    fn test_operation_uri_only_on_accepted() {
        let accepted = RestResponse {
            status: 202,
            body: json!({"uri": "/api/runnable/7"}),
        };
        assert_eq!(accepted.operation_uri(), Some("/api/runnable/7"));
        let ok = RestResponse {
            status: 200,
            body: json!({"uri": "/api/runnable/7"}),
        };
        assert_eq!(ok.operation_uri(), None);
    }
}
