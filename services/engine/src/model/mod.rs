//! Load balancer data model

pub mod entity;
pub mod graph;
pub mod types;

pub use entity::{Entity, EntityKind, ManagedEntity};
pub use graph::{
    expand_expected_codes, HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer,
    LoadBalancerStats, Member, Pool, SessionPersistence, SniContainer,
};
pub use types::{
    L7Action, L7CompareType, L7RuleType, LbAlgorithm, MonitorType, OperatingStatus,
    PersistenceType, Protocol, ProvisioningStatus,
};

/// Sample graphs shared by unit tests across the crate
#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub const LB_ID: &str = "sample_loadbalancer_id_1";
    pub const LISTENER_ID: &str = "sample_listener_id_1";
    pub const POOL_ID: &str = "sample_pool_id_1";
    pub const PROJECT_ID: &str = "sample_project_id";
    pub const SUBNET_ID: &str = "sample_subnet_id_1";

    pub fn member(id: &str, address: &str) -> Member {
        let mut member = Member::new(id, LB_ID, POOL_ID, address, 82);
        member.weight = 13;
        member.subnet_id = Some(SUBNET_ID.to_string());
        member.provisioning_status = ProvisioningStatus::Active;
        member
    }

    pub fn health_monitor() -> HealthMonitor {
        let mut hm = HealthMonitor::new(
            "sample_health_monitor_id_1",
            LB_ID,
            POOL_ID,
            MonitorType::Http,
            30,
            31,
            3,
        );
        hm.http_method = Some("GET".to_string());
        hm.url_path = Some("/index.html".to_string());
        hm.expected_codes = Some("405|404|500".to_string());
        hm.provisioning_status = ProvisioningStatus::Active;
        hm
    }

    pub fn pool() -> Pool {
        let mut pool = Pool::new(POOL_ID, LB_ID, Protocol::Http, LbAlgorithm::RoundRobin);
        pool.listener_id = Some(LISTENER_ID.to_string());
        pool.session_persistence = Some(SessionPersistence {
            persistence_type: PersistenceType::HttpCookie,
            cookie_name: None,
        });
        pool.members = vec![
            member("sample_member_id_1", "10.0.0.99"),
            member("sample_member_id_2", "10.0.0.98"),
        ];
        pool.healthmonitor = Some(health_monitor());
        pool.provisioning_status = ProvisioningStatus::Active;
        pool
    }

    pub fn listener() -> Listener {
        let mut listener = Listener::new(LISTENER_ID, LB_ID, Protocol::Http, 80);
        listener.connection_limit = 98;
        listener.default_pool_id = Some(POOL_ID.to_string());
        listener.provisioning_status = ProvisioningStatus::Active;
        listener
    }

    /// LB without children
    pub fn bare_loadbalancer() -> LoadBalancer {
        let mut lb = LoadBalancer::new(LB_ID, PROJECT_ID, SUBNET_ID);
        lb.name = "test-lb".to_string();
        lb.vip_address = Some("10.0.0.2".to_string());
        lb.vip_port_id = Some("sample_vip_port_id".to_string());
        lb
    }

    /// Minimal deployable LB: one HTTP listener with a monitored cookie pool
    pub fn loadbalancer() -> LoadBalancer {
        let mut lb = bare_loadbalancer();
        lb.provisioning_status = ProvisioningStatus::Active;
        lb.listeners.push(listener());
        lb.pools.push(pool());
        lb
    }
}
