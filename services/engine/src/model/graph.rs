//! Load balancer object graph
//!
//! Parents own their children. Back-references are ids resolved through the
//! owning [`LoadBalancer`], never owning pointers, so a graph can be cloned
//! and serialized as a frozen snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{LbaasError, Result};

use super::entity::{Entity, EntityKind};
use super::types::{
    L7Action, L7CompareType, L7RuleType, LbAlgorithm, MonitorType, OperatingStatus,
    PersistenceType, Protocol, ProvisioningStatus,
};

fn default_true() -> bool {
    true
}

fn default_connection_limit() -> i32 {
    -1
}

fn default_weight() -> u16 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vip_address: Option<String>,
    pub vip_subnet_id: String,
    #[serde(default)]
    pub vip_port_id: Option<String>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub flavor_id: Option<String>,
    /// Provider name selecting the driver; the configured default when absent
    #[serde(default)]
    pub provider: Option<String>,
}

impl LoadBalancer {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, vip_subnet_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: String::new(),
            description: String::new(),
            vip_address: None,
            vip_subnet_id: vip_subnet_id.into(),
            vip_port_id: None,
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
            listeners: Vec::new(),
            pools: Vec::new(),
            flavor_id: None,
            provider: None,
        }
    }

    pub fn listener(&self, id: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.id == id)
    }

    pub fn listener_mut(&mut self, id: &str) -> Option<&mut Listener> {
        self.listeners.iter_mut().find(|l| l.id == id)
    }

    pub fn pool(&self, id: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.id == id)
    }

    pub fn pool_mut(&mut self, id: &str) -> Option<&mut Pool> {
        self.pools.iter_mut().find(|p| p.id == id)
    }

    /// Default pool of a listener, resolved through the LB's pool set
    pub fn default_pool(&self, listener: &Listener) -> Option<&Pool> {
        listener.default_pool_id.as_deref().and_then(|id| self.pool(id))
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.pools.iter().flat_map(|p| p.members.iter())
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members().find(|m| m.id == id)
    }

    pub fn l7_policy(&self, id: &str) -> Option<&L7Policy> {
        self.listeners
            .iter()
            .flat_map(|l| l.l7_policies.iter())
            .find(|p| p.id == id)
    }

    /// An LB is deployable when it is admin-up, not being deleted, and has at
    /// least one admin-up listener that is not being deleted.
    pub fn is_deployable(&self) -> bool {
        self.admin_state_up
            && self.provisioning_status != ProvisioningStatus::PendingDelete
            && self.listeners.iter().any(|l| {
                l.admin_state_up && l.provisioning_status != ProvisioningStatus::PendingDelete
            })
    }

    /// Look up any node of the graph, the root included
    pub fn find(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        match kind {
            EntityKind::LoadBalancer => (self.id == id).then(|| Entity::LoadBalancer(self.clone())),
            EntityKind::Listener => self.listener(id).cloned().map(Entity::Listener),
            EntityKind::Pool => self.pool(id).cloned().map(Entity::Pool),
            EntityKind::Member => self.member(id).cloned().map(Entity::Member),
            EntityKind::HealthMonitor => self
                .pools
                .iter()
                .filter_map(|p| p.healthmonitor.as_ref())
                .find(|hm| hm.id == id)
                .cloned()
                .map(Entity::HealthMonitor),
            EntityKind::L7Policy => self.l7_policy(id).cloned().map(Entity::L7Policy),
            EntityKind::L7Rule => self
                .listeners
                .iter()
                .flat_map(|l| l.l7_policies.iter())
                .flat_map(|p| p.rules.iter())
                .find(|r| r.id == id)
                .cloned()
                .map(Entity::L7Rule),
        }
    }

    /// Every node below the root with its provisioning status, leaves first
    pub fn descendants(&self) -> Vec<(EntityKind, &str, ProvisioningStatus)> {
        let mut out = Vec::new();
        for listener in &self.listeners {
            for policy in &listener.l7_policies {
                for rule in &policy.rules {
                    out.push((EntityKind::L7Rule, rule.id.as_str(), rule.provisioning_status));
                }
                out.push((EntityKind::L7Policy, policy.id.as_str(), policy.provisioning_status));
            }
        }
        for pool in &self.pools {
            for member in &pool.members {
                out.push((EntityKind::Member, member.id.as_str(), member.provisioning_status));
            }
            if let Some(hm) = &pool.healthmonitor {
                out.push((EntityKind::HealthMonitor, hm.id.as_str(), hm.provisioning_status));
            }
        }
        for pool in &self.pools {
            out.push((EntityKind::Pool, pool.id.as_str(), pool.provisioning_status));
        }
        for listener in &self.listeners {
            out.push((EntityKind::Listener, listener.id.as_str(), listener.provisioning_status));
        }
        out
    }

    /// Container ids referenced by TLS listeners
    pub fn tls_container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for listener in &self.listeners {
            for id in listener.tls_container_ids() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniContainer {
    pub tls_container_id: String,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub loadbalancer_id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub protocol_port: u16,
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i32,
    #[serde(default)]
    pub default_pool_id: Option<String>,
    #[serde(default)]
    pub default_tls_container_id: Option<String>,
    #[serde(default)]
    pub sni_containers: Vec<SniContainer>,
    #[serde(default)]
    pub l7_policies: Vec<L7Policy>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl Listener {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        protocol: Protocol,
        protocol_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            name: String::new(),
            protocol,
            protocol_port,
            connection_limit: -1,
            default_pool_id: None,
            default_tls_container_id: None,
            sni_containers: Vec::new(),
            l7_policies: Vec::new(),
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }

    /// Default container first, then SNI containers in position order
    pub fn tls_container_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(id) = &self.default_tls_container_id {
            ids.push(id.clone());
        }
        let mut sni: Vec<&SniContainer> = self.sni_containers.iter().collect();
        sni.sort_by_key(|s| s.position);
        ids.extend(sni.into_iter().map(|s| s.tls_container_id.clone()));
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPersistence {
    #[serde(rename = "type")]
    pub persistence_type: PersistenceType,
    #[serde(default)]
    pub cookie_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub loadbalancer_id: String,
    /// Listener this pool is the default pool of; `None` when attached to the LB directly
    #[serde(default)]
    pub listener_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub lb_algorithm: LbAlgorithm,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub healthmonitor: Option<HealthMonitor>,
    #[serde(default)]
    pub session_persistence: Option<SessionPersistence>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl Pool {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        protocol: Protocol,
        lb_algorithm: LbAlgorithm,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            listener_id: None,
            name: String::new(),
            protocol,
            lb_algorithm,
            members: Vec::new(),
            healthmonitor: None,
            session_persistence: None,
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub loadbalancer_id: String,
    pub pool_id: String,
    pub address: String,
    pub protocol_port: u16,
    #[serde(default = "default_weight")]
    pub weight: u16,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl Member {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        pool_id: impl Into<String>,
        address: impl Into<String>,
        protocol_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            pool_id: pool_id.into(),
            address: address.into(),
            protocol_port,
            weight: 1,
            subnet_id: None,
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitor {
    pub id: String,
    pub loadbalancer_id: String,
    pub pool_id: String,
    #[serde(rename = "type")]
    pub monitor_type: MonitorType,
    pub delay: u32,
    pub timeout: u32,
    /// Rise threshold
    pub max_retries: u32,
    /// Fall threshold; only honoured by drivers declaring threshold support
    #[serde(default)]
    pub max_retries_down: Option<u32>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub url_path: Option<String>,
    #[serde(default)]
    pub expected_codes: Option<String>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl HealthMonitor {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        pool_id: impl Into<String>,
        monitor_type: MonitorType,
        delay: u32,
        timeout: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            pool_id: pool_id.into(),
            monitor_type,
            delay,
            timeout,
            max_retries,
            max_retries_down: None,
            http_method: None,
            url_path: None,
            expected_codes: None,
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L7Policy {
    pub id: String,
    pub loadbalancer_id: String,
    pub listener_id: String,
    #[serde(default)]
    pub name: String,
    pub action: L7Action,
    /// 1-based, compact within the listener
    pub position: u32,
    #[serde(default)]
    pub redirect_pool_id: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub rules: Vec<L7Rule>,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl L7Policy {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        listener_id: impl Into<String>,
        action: L7Action,
        position: u32,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            listener_id: listener_id.into(),
            name: String::new(),
            action,
            position,
            redirect_pool_id: None,
            redirect_url: None,
            rules: Vec::new(),
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L7Rule {
    pub id: String,
    pub loadbalancer_id: String,
    pub listener_id: String,
    pub l7policy_id: String,
    #[serde(rename = "type")]
    pub rule_type: L7RuleType,
    pub compare_type: L7CompareType,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub operating_status: OperatingStatus,
}

impl L7Rule {
    pub fn new(
        id: impl Into<String>,
        loadbalancer_id: impl Into<String>,
        listener_id: impl Into<String>,
        l7policy_id: impl Into<String>,
        rule_type: L7RuleType,
        compare_type: L7CompareType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            loadbalancer_id: loadbalancer_id.into(),
            listener_id: listener_id.into(),
            l7policy_id: l7policy_id.into(),
            rule_type,
            compare_type,
            invert: false,
            key: None,
            value: value.into(),
            admin_state_up: true,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

/// Aggregated traffic counters for one load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub total_connections: u64,
    #[serde(default)]
    pub max_connections: u64,
    #[serde(default)]
    pub connection_errors: u64,
    #[serde(default)]
    pub response_errors: u64,
}

/// Expand an expected-codes expression into individual codes.
///
/// Accepts `200`, `200-204`, `200,202` and `405|404|500`. Order is kept and
/// duplicates are dropped.
pub fn expand_expected_codes(expression: &str) -> Result<Vec<u16>> {
    let mut codes: Vec<u16> = Vec::new();
    let parse = |s: &str| -> Result<u16> {
        s.trim()
            .parse::<u16>()
            .ok()
            .filter(|c| (100..=599).contains(c))
            .ok_or_else(|| LbaasError::BadRequest(format!("invalid expected code {:?}", s)))
    };
    for part in expression.split(|c| c == ',' || c == '|') {
        let expanded: Vec<u16> = match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(LbaasError::BadRequest(format!(
                        "invalid expected code range {}",
                        part
                    )));
                }
                (start..=end).collect()
            }
            None => vec![parse(part)?],
        };
        for code in expanded {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    Ok(codes)
}
