//! Service authentication
//!
//! Password-scoped Keystone v3 session shared by every component that talks
//! to other cloud services. The token is fetched lazily, cached until shortly
//! before expiry, and dropped on demand after a 401.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ServiceAuthSettings;
use crate::error::{LbaasError, RestFailure, Result};

const TOKEN_HEADER: &str = "X-Subject-Token";
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenDetails,
}

#[derive(Debug, Deserialize)]
struct TokenDetails {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
    catalog: Vec<CatalogEntry>,
}

pub struct ServiceAuth {
    client: Client,
    settings: ServiceAuthSettings,
    cached: RwLock<Option<CachedToken>>,
}

/// HTTP client honouring the service_auth TLS options
pub fn build_client(settings: &ServiceAuthSettings) -> Result<Client> {
    let mut builder = Client::builder().timeout(Duration::from_secs(settings.timeout));
    if settings.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(cafile) = &settings.cafile {
        let pem = std::fs::read(cafile)?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| LbaasError::BadRequest(format!("invalid cafile: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(certfile), Some(keyfile)) = (&settings.certfile, &settings.keyfile) {
        let mut pem = std::fs::read(certfile)?;
        pem.extend(std::fs::read(keyfile)?);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| LbaasError::BadRequest(format!("invalid client certificate: {}", e)))?;
        builder = builder.identity(identity);
    }
    builder
        .build()
        .map_err(|e| LbaasError::Unknown(format!("failed to build http client: {}", e)))
}

impl ServiceAuth {
    pub fn new(settings: ServiceAuthSettings) -> Result<Self> {
        let client = build_client(&settings)?;
        Ok(Self {
            client,
            settings,
            cached: RwLock::new(None),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current token, logging in when none is cached or it is about to expire
    pub async fn token(&self) -> Result<String> {
        Ok(self.session().await?.token)
    }

    /// Forget the cached token so the next call logs in again
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// Public URL of a catalog service, filtered by region and interface
    pub async fn endpoint(&self, service_type: &str) -> Result<String> {
        let session = self.session().await?;
        let interface = self.settings.endpoint_type.trim_end_matches("URL");
        session
            .catalog
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == interface
                    && match (&self.settings.region, &ep.region) {
                        (Some(wanted), Some(region)) => wanted == region,
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| LbaasError::not_found("endpoint", service_type))
    }

    async fn session(&self) -> Result<CachedToken> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.expires_at - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now() {
                return Ok(cached.clone());
            }
        }
        let fresh = self.login().await?;
        *self.cached.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn login(&self) -> Result<CachedToken> {
        let auth_url = self
            .settings
            .auth_url
            .as_deref()
            .ok_or_else(|| LbaasError::NotAuthorized("service_auth.auth_url is not set".into()))?;
        let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %self.settings.admin_user, "Requesting service token");

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.settings.admin_user,
                            "domain": {"name": self.settings.admin_user_domain},
                            "password": self.settings.admin_password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.settings.admin_tenant_name,
                        "domain": {"name": self.settings.admin_project_domain},
                    }
                }
            }
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LbaasError::from(RestFailure::connect(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let failure = RestFailure::new(
                status.as_u16() as i32,
                status.canonical_reason().unwrap_or(""),
                text,
            );
            return Err(match status.as_u16() {
                401 | 403 => LbaasError::NotAuthorized(failure.to_string()),
                _ => failure.into(),
            });
        }

        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| LbaasError::NotAuthorized("token response without X-Subject-Token".into()))?;
        let details: TokenBody = response
            .json()
            .await
            .map_err(|e| LbaasError::Unknown(format!("invalid token response: {}", e)))?;

        info!(expires_at = %details.token.expires_at, "Obtained service token");
        Ok(CachedToken {
            token,
            expires_at: details.token.expires_at,
            catalog: details.token.catalog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn keystone(logins: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/v3/auth/tokens",
            post(move |Json(body): Json<serde_json::Value>| {
                let logins = logins.clone();
                async move {
                    logins.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(body["auth"]["identity"]["password"]["user"]["name"], "lbaas");
                    let mut headers = HeaderMap::new();
                    headers.insert(TOKEN_HEADER, "tok-123".parse().unwrap());
                    let expires = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
                    (
                        headers,
                        Json(json!({
                            "token": {
                                "expires_at": expires,
                                "catalog": [{
                                    "type": "key-manager",
                                    "endpoints": [
                                        {"interface": "internal", "region": "RegionOne", "url": "http://internal:9311"},
                                        {"interface": "public", "region": "RegionOne", "url": "http://barbican:9311/"}
                                    ]
                                }]
                            }
                        })),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v3", addr)
    }

    fn settings(auth_url: String) -> ServiceAuthSettings {
        ServiceAuthSettings {
            auth_url: Some(auth_url),
            admin_user: "lbaas".into(),
            region: Some("RegionOne".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_token_is_cached_until_invalidated() {
        let logins = Arc::new(AtomicUsize::new(0));
        let auth = ServiceAuth::new(settings(keystone(logins.clone()).await)).unwrap();

        assert_eq!(auth.token().await.unwrap(), "tok-123");
        assert_eq!(auth.token().await.unwrap(), "tok-123");
        assert_eq!(logins.load(Ordering::SeqCst), 1);

        auth.invalidate().await;
        auth.token().await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_endpoint_lookup_by_interface_and_region() {
        let logins = Arc::new(AtomicUsize::new(0));
        let auth = ServiceAuth::new(settings(keystone(logins).await)).unwrap();
        assert_eq!(auth.endpoint("key-manager").await.unwrap(), "http://barbican:9311");
        assert!(auth.endpoint("compute").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_auth_url() {
        let auth = ServiceAuth::new(ServiceAuthSettings::default()).unwrap();
        assert!(matches!(auth.token().await, Err(LbaasError::NotAuthorized(_))));
    }
}
