//! Proxy port placement for members outside the VIP subnet
//!
//! The controller reaches members on a foreign subnet through a second
//! port plugged into that subnet. Its address is handed over as the PIP,
//! together with static-route hints for every foreign subnet.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LbaasError, Result};
use crate::model::{LoadBalancer, ProvisioningStatus};
use crate::network::{NetworkApi, PortRequest};

pub const PROXY_DEVICE_OWNER: &str = "neutron:LOADBALANCERV2_PROXY";

pub fn proxy_port_name(lb_id: &str) -> String {
    format!("proxy_{}", lb_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticRoute {
    pub destination: String,
    pub netmask: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPlan {
    pub pip_address: String,
    pub proxy_port_id: Option<String>,
    pub static_routes: Vec<StaticRoute>,
}

/// Member subnets other than the VIP subnet, in first-seen order
pub fn foreign_subnets(lb: &LoadBalancer) -> Vec<String> {
    let mut subnets: Vec<String> = Vec::new();
    let members = lb
        .members()
        .filter(|m| m.provisioning_status != ProvisioningStatus::PendingDelete);
    for member in members {
        let Some(subnet) = member.subnet_id.as_deref() else {
            continue;
        };
        if subnet != lb.vip_subnet_id && !subnets.iter().any(|s| s == subnet) {
            subnets.push(subnet.to_string());
        }
    }
    subnets
}

/// Ensure the proxy port exists when members live off the VIP subnet
pub async fn plan(network: &dyn NetworkApi, lb: &LoadBalancer) -> Result<ProxyPlan> {
    let vip = lb.vip_address.clone().ok_or_else(|| {
        LbaasError::BadRequest(format!("load balancer {} has no VIP address", lb.id))
    })?;
    let subnets = foreign_subnets(lb);
    let Some(first) = subnets.first() else {
        return Ok(ProxyPlan {
            pip_address: vip,
            proxy_port_id: None,
            static_routes: Vec::new(),
        });
    };
    if subnets.len() > 1 {
        warn!(
            lb_id = %lb.id,
            subnets = ?subnets,
            "Members span several foreign subnets; only {} gets a proxy port",
            first
        );
    }

    let name = proxy_port_name(&lb.id);
    let port = match network.find_port_by_name(&name).await? {
        Some(port) => port,
        None => {
            let port = network
                .create_port(PortRequest {
                    name: name.clone(),
                    subnet_id: first.clone(),
                    ip_address: None,
                    device_owner: PROXY_DEVICE_OWNER.to_string(),
                    device_id: lb.id.clone(),
                    project_id: lb.project_id.clone(),
                })
                .await?;
            info!(lb_id = %lb.id, port_id = %port.id, subnet_id = %first, "Proxy port created");
            port
        }
    };
    let pip = port
        .first_ip()
        .map(|ip| ip.ip_address.clone())
        .ok_or_else(|| LbaasError::Unknown(format!("proxy port {} has no address", port.id)))?;

    let mut routes = Vec::new();
    for subnet_id in &subnets {
        let subnet = network.get_subnet(subnet_id).await?;
        let Some(gateway) = subnet.gateway_ip.clone() else {
            debug!(subnet_id = %subnet_id, "Subnet has no gateway; no route hint");
            continue;
        };
        let (destination, netmask) = subnet.network_and_mask()?;
        routes.push(StaticRoute {
            destination,
            netmask,
            gateway,
        });
    }

    Ok(ProxyPlan {
        pip_address: pip,
        proxy_port_id: Some(port.id),
        static_routes: routes,
    })
}

/// Delete the proxy port if there is one; failures are only logged
pub async fn release(network: &dyn NetworkApi, lb_id: &str) {
    let name = proxy_port_name(lb_id);
    match network.find_port_by_name(&name).await {
        Ok(Some(port)) => match network.delete_port(&port.id).await {
            Ok(()) => info!(lb_id = %lb_id, port_id = %port.id, "Proxy port deleted"),
            Err(e) => warn!(lb_id = %lb_id, port_id = %port.id, error = %e, "Failed to delete proxy port"),
        },
        Ok(None) => {}
        Err(e) => warn!(lb_id = %lb_id, error = %e, "Failed to look up proxy port"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::network::{InMemoryNetwork, Subnet};

    async fn network() -> InMemoryNetwork {
        let network = InMemoryNetwork::new();
        for (id, cidr, gw) in [
            (fixtures::SUBNET_ID, "10.0.0.0/24", Some("10.0.0.1")),
            ("member_subnet_a", "192.168.10.0/24", Some("192.168.10.1")),
            ("member_subnet_b", "172.16.0.0/16", Some("172.16.0.1")),
        ] {
            network
                .add_subnet(Subnet {
                    id: id.into(),
                    network_id: format!("net-{}", id),
                    cidr: cidr.into(),
                    gateway_ip: gw.map(str::to_string),
                })
                .await;
        }
        network
    }

    #[tokio::test]
    async fn test_same_subnet_uses_vip_as_pip() {
        let network = network().await;
        let plan = plan(&network, &fixtures::loadbalancer()).await.unwrap();
        assert_eq!(plan.pip_address, "10.0.0.2");
        assert!(plan.proxy_port_id.is_none());
        assert!(plan.static_routes.is_empty());
        assert!(network.ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_subnets_get_port_and_routes() {
        let network = network().await;
        let mut lb = fixtures::loadbalancer();
        lb.pools[0].members[0].subnet_id = Some("member_subnet_a".into());
        lb.pools[0].members[1].subnet_id = Some("member_subnet_b".into());

        let first = plan(&network, &lb).await.unwrap();
        assert_eq!(first.pip_address, "192.168.10.2");
        assert_eq!(
            first.static_routes,
            vec![
                StaticRoute {
                    destination: "192.168.10.0".into(),
                    netmask: "255.255.255.0".into(),
                    gateway: "192.168.10.1".into(),
                },
                StaticRoute {
                    destination: "172.16.0.0".into(),
                    netmask: "255.255.0.0".into(),
                    gateway: "172.16.0.1".into(),
                },
            ]
        );

        // planning again reuses the port
        let second = plan(&network, &lb).await.unwrap();
        assert_eq!(second.proxy_port_id, first.proxy_port_id);
        let ports = network.ports().await;
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name, "proxy_sample_loadbalancer_id_1");
        assert_eq!(ports[0].device_owner, PROXY_DEVICE_OWNER);

        release(&network, &lb.id).await;
        assert!(network.ports().await.is_empty());
        // nothing left to release
        release(&network, &lb.id).await;
    }

    #[tokio::test]
    async fn test_missing_vip_is_rejected() {
        let network = network().await;
        let mut lb = fixtures::loadbalancer();
        lb.vip_address = None;
        assert!(matches!(plan(&network, &lb).await, Err(LbaasError::BadRequest(_))));
    }
}
