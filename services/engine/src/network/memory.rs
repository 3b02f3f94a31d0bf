//! In-memory network plugin with sequential address allocation

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{parse_cidr, prefix_mask, FixedIp, NetworkApi, Port, PortRequest, Subnet};
use crate::error::{LbaasError, Result};

#[derive(Default)]
struct NetworkState {
    subnets: HashMap<String, Subnet>,
    ports: HashMap<String, Port>,
    allocated: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryNetwork {
    state: RwLock<NetworkState>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_subnet(&self, subnet: Subnet) {
        let mut state = self.state.write().await;
        if let Some(gateway) = &subnet.gateway_ip {
            state.allocated.insert(gateway.clone());
        }
        state.subnets.insert(subnet.id.clone(), subnet);
    }

    /// Record a port allocated elsewhere
    pub async fn add_port(&self, port: Port) {
        let mut state = self.state.write().await;
        for ip in &port.fixed_ips {
            state.allocated.insert(ip.ip_address.clone());
        }
        state.ports.insert(port.id.clone(), port);
    }

    pub async fn ports(&self) -> Vec<Port> {
        self.state.read().await.ports.values().cloned().collect()
    }
}

fn next_free_address(subnet: &Subnet, allocated: &HashSet<String>) -> Result<String> {
    let (addr, len) = parse_cidr(&subnet.cidr)?;
    let mask = prefix_mask(len);
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    (network + 1..broadcast)
        .map(|raw| Ipv4Addr::from(raw).to_string())
        .find(|ip| !allocated.contains(ip))
        .ok_or_else(|| LbaasError::Conflict(format!("subnet {} has no free addresses", subnet.id)))
}

fn mac_for(id: &Uuid) -> String {
    let b = id.as_bytes();
    format!("fa:16:3e:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2])
}

#[async_trait]
impl NetworkApi for InMemoryNetwork {
    async fn get_port(&self, port_id: &str) -> Result<Port> {
        self.state
            .read()
            .await
            .ports
            .get(port_id)
            .cloned()
            .ok_or_else(|| LbaasError::not_found("port", port_id))
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet> {
        self.state
            .read()
            .await
            .subnets
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| LbaasError::not_found("subnet", subnet_id))
    }

    async fn create_port(&self, request: PortRequest) -> Result<Port> {
        let mut state = self.state.write().await;
        let subnet = state
            .subnets
            .get(&request.subnet_id)
            .cloned()
            .ok_or_else(|| LbaasError::not_found("subnet", &request.subnet_id))?;

        let ip_address = match request.ip_address {
            Some(ip) if state.allocated.contains(&ip) => {
                return Err(LbaasError::Conflict(format!("address {} already in use", ip)));
            }
            Some(ip) => ip,
            None => next_free_address(&subnet, &state.allocated)?,
        };

        let id = Uuid::new_v4();
        let port = Port {
            id: id.to_string(),
            name: request.name,
            network_id: subnet.network_id.clone(),
            mac_address: mac_for(&id),
            fixed_ips: vec![FixedIp {
                subnet_id: subnet.id.clone(),
                ip_address: ip_address.clone(),
            }],
            device_owner: request.device_owner,
            device_id: request.device_id,
            host: None,
        };
        state.allocated.insert(ip_address);
        state.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    async fn delete_port(&self, port_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let port = state
            .ports
            .remove(port_id)
            .ok_or_else(|| LbaasError::not_found("port", port_id))?;
        for ip in port.fixed_ips {
            state.allocated.remove(&ip.ip_address);
        }
        Ok(())
    }

    async fn find_port_by_name(&self, name: &str) -> Result<Option<Port>> {
        Ok(self
            .state
            .read()
            .await
            .ports
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn plug_vip_port(&self, port_id: &str, host: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let port = state
            .ports
            .get_mut(port_id)
            .ok_or_else(|| LbaasError::not_found("port", port_id))?;
        port.host = Some(host.to_string());
        Ok(())
    }

    async fn unplug_vip_port(&self, port_id: &str, _host: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let port = state
            .ports
            .get_mut(port_id)
            .ok_or_else(|| LbaasError::not_found("port", port_id))?;
        port.host = None;
        Ok(())
    }
}
