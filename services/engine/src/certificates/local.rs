//! Local filesystem certificate manager
//!
//! Each field of a bundle is one file: `<storage>/<uuid>.{crt,key,int,pass}`.
//! Meant for single-node deployments and testing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CertManager, Certificate};
use crate::error::{LbaasError, Result};

pub struct LocalCertManager {
    storage_path: PathBuf,
}

impl LocalCertManager {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    fn base_path(&self, container_ref: &str) -> Result<PathBuf> {
        let valid = !container_ref.is_empty()
            && container_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(LbaasError::CertificateStorage(format!(
                "invalid container reference {:?}",
                container_ref
            )));
        }
        Ok(self.storage_path.join(container_ref))
    }
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

async fn read_required(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        LbaasError::CertificateStorage(format!("failed to read {}: {}", path.display(), e))
    })
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LbaasError::CertificateStorage(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl CertManager for LocalCertManager {
    async fn store_cert(
        &self,
        project_id: &str,
        cert: &Certificate,
        _expiration: Option<DateTime<Utc>>,
        name: &str,
    ) -> Result<String> {
        let container_ref = Uuid::new_v4().to_string();
        let base = self.base_path(&container_ref)?;
        info!(project_id = %project_id, name = %name, container_ref = %container_ref, "Storing certificate locally");

        tokio::fs::create_dir_all(&self.storage_path)
            .await
            .map_err(|e| LbaasError::CertificateStorage(e.to_string()))?;

        let mut files = vec![
            (with_ext(&base, "crt"), cert.certificate.as_str()),
            (with_ext(&base, "key"), cert.private_key.as_str()),
        ];
        if let Some(intermediates) = &cert.intermediates {
            files.push((with_ext(&base, "int"), intermediates.as_str()));
        }
        if let Some(passphrase) = &cert.private_key_passphrase {
            files.push((with_ext(&base, "pass"), passphrase.as_str()));
        }

        let mut written: Vec<PathBuf> = Vec::new();
        for (path, content) in files {
            if let Err(e) = tokio::fs::write(&path, content).await {
                for done in &written {
                    let _ = tokio::fs::remove_file(done).await;
                }
                return Err(LbaasError::CertificateStorage(format!(
                    "failed to write {}: {}",
                    path.display(),
                    e
                )));
            }
            written.push(path);
        }
        Ok(container_ref)
    }

    async fn get_cert(
        &self,
        _project_id: &str,
        container_ref: &str,
        _resource_ref: &str,
        _check_only: bool,
        _service_name: &str,
    ) -> Result<Certificate> {
        let base = self.base_path(container_ref)?;
        debug!(container_ref = %container_ref, "Loading certificate from local storage");
        Ok(Certificate {
            certificate: read_required(&with_ext(&base, "crt")).await?,
            private_key: read_required(&with_ext(&base, "key")).await?,
            intermediates: read_optional(&with_ext(&base, "int")).await?,
            private_key_passphrase: read_optional(&with_ext(&base, "pass")).await?,
        })
    }

    async fn delete_cert(
        &self,
        _project_id: &str,
        container_ref: &str,
        _resource_ref: &str,
        _service_name: &str,
    ) -> Result<()> {
        let base = self.base_path(container_ref)?;
        for ext in ["crt", "key", "int", "pass"] {
            let path = with_ext(&base, ext);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove certificate file"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_get_without_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCertManager::new(dir.path());
        let cert = Certificate::new("CERT PEM", "KEY PEM");

        let container_ref = manager.store_cert("project", &cert, None, "web").await.unwrap();
        assert!(dir.path().join(format!("{}.crt", container_ref)).exists());
        assert!(!dir.path().join(format!("{}.int", container_ref)).exists());

        let loaded = manager
            .get_cert("project", &container_ref, "lbaas://loadbalancers/x", false, "lbaas")
            .await
            .unwrap();
        assert_eq!(loaded, cert);
    }

    #[tokio::test]
    async fn test_store_with_chain_and_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCertManager::new(dir.path());
        let mut cert = Certificate::new("CERT", "KEY");
        cert.intermediates = Some("CHAIN".into());
        cert.private_key_passphrase = Some("secret".into());

        let container_ref = manager.store_cert("project", &cert, None, "web").await.unwrap();
        let loaded = manager
            .get_cert("project", &container_ref, "r", true, "lbaas")
            .await
            .unwrap();
        assert_eq!(loaded.intermediates.as_deref(), Some("CHAIN"));
        assert_eq!(loaded.private_key_passphrase.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_delete_removes_files_and_get_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCertManager::new(dir.path());
        let container_ref = manager
            .store_cert("project", &Certificate::new("C", "K"), None, "web")
            .await
            .unwrap();

        manager.delete_cert("project", &container_ref, "r", "lbaas").await.unwrap();
        let err = manager
            .get_cert("project", &container_ref, "r", true, "lbaas")
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::CertificateStorage(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_like_references() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCertManager::new(dir.path());
        let err = manager
            .get_cert("project", "../etc/passwd", "r", true, "lbaas")
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::CertificateStorage(_)));
    }
}
