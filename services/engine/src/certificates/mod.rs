//! TLS certificate manager
//!
//! Certificates are immutable bundles referenced by an opaque container
//! reference. Two backends: files on local disk, and a key-manager service
//! grouping secrets into a certificate container.

mod key_manager;
mod local;

pub use key_manager::{BarbicanClient, ContainerRecord, SecretStore, SecretStoreCertManager};
pub use local::LocalCertManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Consumer name registered on containers used by load balancers
pub const SERVICE_NAME: &str = "lbaas";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub intermediates: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
}

impl Certificate {
    pub fn new(certificate: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
            intermediates: None,
            private_key_passphrase: None,
        }
    }
}

/// Resource reference recorded as the consumer of a container
pub fn service_url(loadbalancer_id: &str) -> String {
    format!("lbaas://loadbalancers/{}", loadbalancer_id)
}

#[async_trait]
pub trait CertManager: Send + Sync {
    /// Store the bundle and return its container reference
    async fn store_cert(
        &self,
        project_id: &str,
        cert: &Certificate,
        expiration: Option<DateTime<Utc>>,
        name: &str,
    ) -> Result<String>;

    /// Fetch a bundle; unless `check_only`, register `resource_ref` as a consumer
    async fn get_cert(
        &self,
        project_id: &str,
        container_ref: &str,
        resource_ref: &str,
        check_only: bool,
        service_name: &str,
    ) -> Result<Certificate>;

    /// Deregister `resource_ref` as a consumer of the container
    async fn delete_cert(
        &self,
        project_id: &str,
        container_ref: &str,
        resource_ref: &str,
        service_name: &str,
    ) -> Result<()>;
}
