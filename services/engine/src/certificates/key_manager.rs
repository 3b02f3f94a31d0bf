//! Key-manager backed certificate storage
//!
//! Each bundle field becomes one secret; the secrets are grouped into a
//! `certificate` container. Load balancers register as consumers of the
//! containers they use so the key manager can refuse premature deletion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{CertManager, Certificate};
use crate::auth::ServiceAuth;
use crate::error::{LbaasError, RestFailure, Result};

const CERTIFICATE: &str = "certificate";
const PRIVATE_KEY: &str = "private_key";
const INTERMEDIATES: &str = "intermediates";
const PASSPHRASE: &str = "private_key_passphrase";

/// Secret references of a container, keyed by role name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRecord {
    pub container_ref: String,
    pub secret_refs: HashMap<String, String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn create_secret(
        &self,
        project_id: &str,
        name: &str,
        payload: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<String>;

    async fn delete_secret(&self, secret_ref: &str) -> Result<()>;

    async fn create_container(
        &self,
        project_id: &str,
        name: &str,
        secret_refs: Vec<(String, String)>,
    ) -> Result<String>;

    async fn get_container(&self, container_ref: &str) -> Result<ContainerRecord>;

    async fn get_secret_payload(&self, secret_ref: &str) -> Result<String>;

    async fn register_consumer(
        &self,
        container_ref: &str,
        service_name: &str,
        resource_ref: &str,
    ) -> Result<()>;

    async fn remove_consumer(
        &self,
        container_ref: &str,
        service_name: &str,
        resource_ref: &str,
    ) -> Result<()>;
}

pub struct SecretStoreCertManager {
    store: Arc<dyn SecretStore>,
}

impl SecretStoreCertManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    async fn rollback(&self, created: &[String]) {
        for secret_ref in created {
            if let Err(e) = self.store.delete_secret(secret_ref).await {
                warn!(secret_ref = %secret_ref, error = %e, "Failed to roll back secret");
            }
        }
    }

    async fn payload(&self, record: &ContainerRecord, role: &str) -> Result<Option<String>> {
        match record.secret_refs.get(role) {
            Some(secret_ref) => Ok(Some(self.store.get_secret_payload(secret_ref).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CertManager for SecretStoreCertManager {
    async fn store_cert(
        &self,
        project_id: &str,
        cert: &Certificate,
        expiration: Option<DateTime<Utc>>,
        name: &str,
    ) -> Result<String> {
        let mut fields = vec![
            (CERTIFICATE, cert.certificate.as_str()),
            (PRIVATE_KEY, cert.private_key.as_str()),
        ];
        if let Some(intermediates) = &cert.intermediates {
            fields.push((INTERMEDIATES, intermediates.as_str()));
        }
        if let Some(passphrase) = &cert.private_key_passphrase {
            fields.push((PASSPHRASE, passphrase.as_str()));
        }

        let mut created: Vec<String> = Vec::new();
        let mut refs: Vec<(String, String)> = Vec::new();
        for (role, payload) in fields {
            let secret_name = format!("{} {}", name, role);
            match self
                .store
                .create_secret(project_id, &secret_name, payload, expiration)
                .await
            {
                Ok(secret_ref) => {
                    created.push(secret_ref.clone());
                    refs.push((role.to_string(), secret_ref));
                }
                Err(e) => {
                    error!(name = %name, role = %role, error = %e, "Secret creation failed");
                    self.rollback(&created).await;
                    return Err(LbaasError::CertificateStorage(e.to_string()));
                }
            }
        }

        match self.store.create_container(project_id, name, refs).await {
            Ok(container_ref) => {
                info!(container_ref = %container_ref, "Stored certificate container");
                Ok(container_ref)
            }
            Err(e) => {
                error!(name = %name, error = %e, "Container creation failed, rolling back secrets");
                self.rollback(&created).await;
                Err(LbaasError::CertificateStorage(e.to_string()))
            }
        }
    }

    async fn get_cert(
        &self,
        _project_id: &str,
        container_ref: &str,
        resource_ref: &str,
        check_only: bool,
        service_name: &str,
    ) -> Result<Certificate> {
        let record = self
            .store
            .get_container(container_ref)
            .await
            .map_err(|e| LbaasError::CertificateStorage(e.to_string()))?;
        if !check_only {
            self.store
                .register_consumer(container_ref, service_name, resource_ref)
                .await
                .map_err(|e| LbaasError::CertificateStorage(e.to_string()))?;
        }

        let certificate = self.payload(&record, CERTIFICATE).await?;
        let private_key = self.payload(&record, PRIVATE_KEY).await?;
        match (certificate, private_key) {
            (Some(certificate), Some(private_key)) => Ok(Certificate {
                certificate,
                private_key,
                intermediates: self.payload(&record, INTERMEDIATES).await?,
                private_key_passphrase: self.payload(&record, PASSPHRASE).await?,
            }),
            _ => Err(LbaasError::CertificateStorage(format!(
                "container {} lacks a certificate or private key",
                container_ref
            ))),
        }
    }

    async fn delete_cert(
        &self,
        _project_id: &str,
        container_ref: &str,
        resource_ref: &str,
        service_name: &str,
    ) -> Result<()> {
        self.store
            .remove_consumer(container_ref, service_name, resource_ref)
            .await
            .map_err(|e| LbaasError::CertificateStorage(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct SecretCreated {
    secret_ref: String,
}

#[derive(Debug, Deserialize)]
struct ContainerCreated {
    container_ref: String,
}

#[derive(Debug, Deserialize)]
struct ContainerBody {
    #[serde(default)]
    secret_refs: Vec<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
    secret_ref: String,
}

/// Barbican v1 REST client authenticated through the service session
pub struct BarbicanClient {
    auth: Arc<ServiceAuth>,
    endpoint: Option<String>,
}

impl BarbicanClient {
    /// Client resolving the key-manager endpoint from the service catalog
    pub fn new(auth: Arc<ServiceAuth>) -> Self {
        Self {
            auth,
            endpoint: None,
        }
    }

    pub fn with_endpoint(auth: Arc<ServiceAuth>, endpoint: impl Into<String>) -> Self {
        Self {
            auth,
            endpoint: Some(endpoint.into()),
        }
    }

    async fn base(&self) -> Result<String> {
        match &self.endpoint {
            Some(endpoint) => Ok(endpoint.trim_end_matches('/').to_string()),
            None => self.auth.endpoint("key-manager").await,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.auth.token().await?;
        let response = request
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(|e| LbaasError::from(RestFailure::connect(e.to_string())))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 401 {
            self.auth.invalidate().await;
        }
        let text = response.text().await.unwrap_or_default();
        Err(RestFailure::new(
            status.as_u16() as i32,
            status.canonical_reason().unwrap_or(""),
            text,
        )
        .into())
    }
}

#[async_trait]
impl SecretStore for BarbicanClient {
    async fn create_secret(
        &self,
        _project_id: &str,
        name: &str,
        payload: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let url = format!("{}/v1/secrets", self.base().await?);
        let mut body = json!({
            "name": name,
            "payload": payload,
            "payload_content_type": "text/plain",
        });
        if let Some(expiration) = expiration {
            body["expiration"] = json!(expiration.to_rfc3339());
        }
        let response = self.send(self.auth.client().post(&url).json(&body)).await?;
        let created: SecretCreated = response.json().await.map_err(|e| {
            LbaasError::CertificateStorage(format!("invalid secret response: {}", e))
        })?;
        debug!(secret_ref = %created.secret_ref, "Created secret");
        Ok(created.secret_ref)
    }

    async fn delete_secret(&self, secret_ref: &str) -> Result<()> {
        self.send(self.auth.client().delete(secret_ref)).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        _project_id: &str,
        name: &str,
        secret_refs: Vec<(String, String)>,
    ) -> Result<String> {
        let url = format!("{}/v1/containers", self.base().await?);
        let refs: Vec<serde_json::Value> = secret_refs
            .iter()
            .map(|(name, secret_ref)| json!({"name": name, "secret_ref": secret_ref}))
            .collect();
        let body = json!({"name": name, "type": "certificate", "secret_refs": refs});
        let response = self.send(self.auth.client().post(&url).json(&body)).await?;
        let created: ContainerCreated = response.json().await.map_err(|e| {
            LbaasError::CertificateStorage(format!("invalid container response: {}", e))
        })?;
        Ok(created.container_ref)
    }

    async fn get_container(&self, container_ref: &str) -> Result<ContainerRecord> {
        let response = self.send(self.auth.client().get(container_ref)).await?;
        let body: ContainerBody = response.json().await.map_err(|e| {
            LbaasError::CertificateStorage(format!("invalid container body: {}", e))
        })?;
        Ok(ContainerRecord {
            container_ref: container_ref.to_string(),
            secret_refs: body
                .secret_refs
                .into_iter()
                .map(|r| (r.name, r.secret_ref))
                .collect(),
        })
    }

    async fn get_secret_payload(&self, secret_ref: &str) -> Result<String> {
        let url = format!("{}/payload", secret_ref.trim_end_matches('/'));
        let response = self
            .send(self.auth.client().get(&url).header("Accept", "text/plain"))
            .await?;
        response
            .text()
            .await
            .map_err(|e| LbaasError::CertificateStorage(e.to_string()))
    }

    async fn register_consumer(
        &self,
        container_ref: &str,
        service_name: &str,
        resource_ref: &str,
    ) -> Result<()> {
        let url = format!("{}/consumers", container_ref.trim_end_matches('/'));
        let body = json!({"name": service_name, "URL": resource_ref});
        self.send(self.auth.client().post(&url).json(&body)).await?;
        Ok(())
    }

    async fn remove_consumer(
        &self,
        container_ref: &str,
        service_name: &str,
        resource_ref: &str,
    ) -> Result<()> {
        let url = format!("{}/consumers", container_ref.trim_end_matches('/'));
        let body = json!({"name": service_name, "URL": resource_ref});
        self.send(self.auth.client().delete(&url).json(&body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_container_failure_rolls_back_every_secret() {
        let mut store = MockSecretStore::new();
        let mut counter = 0;
        store.expect_create_secret().times(3).returning(move |_, _, _, _| {
            counter += 1;
            Ok(format!("secret-{}", counter))
        });
        store
            .expect_create_container()
            .times(1)
            .returning(|_, _, _| Err(LbaasError::ServiceUnavailable("down".into())));
        store.expect_delete_secret().with(eq("secret-1")).times(1).returning(|_| Ok(()));
        store.expect_delete_secret().with(eq("secret-2")).times(1).returning(|_| Ok(()));
        store.expect_delete_secret().with(eq("secret-3")).times(1).returning(|_| Ok(()));

        let manager = SecretStoreCertManager::new(Arc::new(store));
        let mut cert = Certificate::new("C", "K");
        cert.intermediates = Some("I".into());
        let err = manager.store_cert("p", &cert, None, "web").await.unwrap_err();
        assert!(matches!(err, LbaasError::CertificateStorage(_)));
    }

    #[tokio::test]
    async fn test_get_registers_consumer_unless_check_only() {
        let mut store = MockSecretStore::new();
        store.expect_get_container().returning(|container_ref| {
            Ok(ContainerRecord {
                container_ref: container_ref.to_string(),
                secret_refs: HashMap::from([
                    (CERTIFICATE.to_string(), "s-cert".to_string()),
                    (PRIVATE_KEY.to_string(), "s-key".to_string()),
                ]),
            })
        });
        store
            .expect_get_secret_payload()
            .returning(|secret_ref| Ok(format!("payload of {}", secret_ref)));
        store
            .expect_register_consumer()
            .with(eq("c-1"), eq("lbaas"), eq("lbaas://loadbalancers/lb"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = SecretStoreCertManager::new(Arc::new(store));
        let cert = manager
            .get_cert("p", "c-1", "lbaas://loadbalancers/lb", false, "lbaas")
            .await
            .unwrap();
        assert_eq!(cert.certificate, "payload of s-cert");
        assert_eq!(cert.private_key, "payload of s-key");
        assert!(cert.intermediates.is_none());

        // check_only does not register again (times(1) above)
        manager
            .get_cert("p", "c-1", "lbaas://loadbalancers/lb", true, "lbaas")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_deregisters_consumer() {
        let mut store = MockSecretStore::new();
        store
            .expect_remove_consumer()
            .with(eq("c-1"), eq("lbaas"), eq("res"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let manager = SecretStoreCertManager::new(Arc::new(store));
        manager.delete_cert("p", "c-1", "res", "lbaas").await.unwrap();
    }
}
