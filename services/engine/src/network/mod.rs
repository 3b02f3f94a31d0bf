//! Core network plugin contract
//!
//! Ports and subnets are owned by the networking service. The engine needs
//! VIP port allocation, proxy ports for the REST driver, and binding a VIP
//! port to the host that realizes it.

mod memory;

pub use memory::InMemoryNetwork;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::error::{LbaasError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub mac_address: String,
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub host: Option<String>,
}

impl Port {
    pub fn first_ip(&self) -> Option<&FixedIp> {
        self.fixed_ips.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway_ip: Option<String>,
}

impl Subnet {
    /// Prefix length of the subnet CIDR
    pub fn prefix_len(&self) -> Result<u8> {
        parse_cidr(&self.cidr).map(|(_, len)| len)
    }

    /// Dotted network address and netmask, as used in static-route hints
    pub fn network_and_mask(&self) -> Result<(String, String)> {
        let (addr, len) = parse_cidr(&self.cidr)?;
        let mask = prefix_mask(len);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        Ok((network.to_string(), Ipv4Addr::from(mask).to_string()))
    }
}

/// Request for a new port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub name: String,
    pub subnet_id: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub project_id: String,
}

pub(crate) fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| LbaasError::BadRequest(format!("invalid cidr {}", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| LbaasError::BadRequest(format!("invalid cidr {}", cidr)))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| LbaasError::BadRequest(format!("invalid cidr {}", cidr)))?;
    Ok((addr, len))
}

pub(crate) fn prefix_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len as u32)
    }
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn get_port(&self, port_id: &str) -> Result<Port>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet>;

    async fn create_port(&self, request: PortRequest) -> Result<Port>;

    async fn delete_port(&self, port_id: &str) -> Result<()>;

    async fn find_port_by_name(&self, name: &str) -> Result<Option<Port>>;

    /// Bind the port to `host` and mark it up
    async fn plug_vip_port(&self, port_id: &str, host: &str) -> Result<()>;

    /// Clear the host binding and mark the port down
    async fn unplug_vip_port(&self, port_id: &str, host: &str) -> Result<()>;
}
