//! TLS material for TERMINATED_HTTPS listeners
//!
//! Each container referenced by a listener is written as one PEM bundle,
//! certificate then intermediates then key, under the listener's directory.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::debug;

use super::render::pem_path;
use crate::certificates::{service_url, CertManager, Certificate, SERVICE_NAME};
use crate::error::{LbaasError, Result};
use crate::model::{LoadBalancer, ProvisioningStatus, Protocol};

fn bundle(cert: &Certificate) -> String {
    let mut pem = String::new();
    for part in [
        Some(cert.certificate.as_str()),
        cert.intermediates.as_deref(),
        Some(cert.private_key.as_str()),
    ]
    .into_iter()
    .flatten()
    {
        pem.push_str(part.trim_end());
        pem.push('\n');
    }
    pem
}

/// Write the PEM bundles every live TLS listener of `lb` needs
pub async fn materialize(certs: &dyn CertManager, lb: &LoadBalancer, lb_dir: &Path) -> Result<()> {
    let listeners = lb.listeners.iter().filter(|l| {
        l.protocol == Protocol::TerminatedHttps
            && l.admin_state_up
            && l.provisioning_status != ProvisioningStatus::PendingDelete
    });
    for listener in listeners {
        let dir = lb_dir.join(&listener.id);
        tokio::fs::create_dir_all(&dir).await?;
        for container in listener.tls_container_ids() {
            let cert = certs
                .get_cert(&lb.project_id, &container, &service_url(&lb.id), true, SERVICE_NAME)
                .await?;
            if cert.private_key_passphrase.is_some() {
                return Err(LbaasError::BadRequest(format!(
                    "container {} holds an encrypted private key",
                    container
                )));
            }
            let path = pem_path(lb_dir, &listener.id, &container);
            tokio::fs::write(&path, bundle(&cert)).await?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
            debug!(listener_id = %listener.id, path = %path.display(), "TLS bundle written");
        }
    }
    Ok(())
}
