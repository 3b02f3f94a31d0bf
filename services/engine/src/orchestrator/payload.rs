//! Orchestrator resource paths and bodies
//!
//! Every resource lives under its load balancer. Create bodies carry the
//! full entity; update bodies carry only the fields the orchestrator lets
//! change after creation.

use serde_json::{json, Value};

use crate::model::{
    HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, ManagedEntity, Member, Pool,
    ProvisioningStatus,
};

pub fn loadbalancer_path(lb_id: &str) -> String {
    format!("/v1/loadbalancers/{}", lb_id)
}

/// Entity kinds the orchestrator manages below a load balancer
pub trait Resource: ManagedEntity {
    /// Collection the entity is created in
    fn collection_path(&self, lb: &LoadBalancer) -> String;

    /// Path of the entity itself
    fn item_path(&self, lb: &LoadBalancer) -> String {
        format!("{}/{}", self.collection_path(lb), self.id())
    }

    fn create_body(&self) -> Value;

    fn update_body(&self) -> Value;
}

fn live(status: ProvisioningStatus) -> bool {
    status != ProvisioningStatus::PendingDelete
}

/// Fall threshold: `max_retries_down` when set, else the rise threshold
fn fall_threshold(hm: &HealthMonitor) -> u32 {
    hm.max_retries_down.unwrap_or(hm.max_retries)
}

impl Resource for Listener {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!("{}/listeners", loadbalancer_path(&lb.id))
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["id"] = json!(self.id);
        body["protocol"] = json!(self.protocol.as_str());
        body["protocol_port"] = json!(self.protocol_port);
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "name": self.name,
            "enabled": self.admin_state_up,
            "connection_limit": self.connection_limit,
            "default_pool_id": self.default_pool_id,
            "tls_certificate_id": self.default_tls_container_id,
            "sni_containers": self
                .sni_containers
                .iter()
                .map(|s| s.tls_container_id.clone())
                .collect::<Vec<_>>(),
        })
    }
}

impl Resource for Pool {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!("{}/pools", loadbalancer_path(&lb.id))
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["id"] = json!(self.id);
        body["protocol"] = json!(self.protocol.as_str());
        if let Some(listener_id) = &self.listener_id {
            body["listener_id"] = json!(listener_id);
        }
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "name": self.name,
            "enabled": self.admin_state_up,
            "lb_algorithm": self.lb_algorithm.as_str(),
            "session_persistence": self.session_persistence.as_ref().map(|sp| json!({
                "type": sp.persistence_type.as_str(),
                "cookie_name": sp.cookie_name,
            })),
        })
    }
}

impl Resource for Member {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!("{}/pools/{}/members", loadbalancer_path(&lb.id), self.pool_id)
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["id"] = json!(self.id);
        body["ip_address"] = json!(self.address);
        body["protocol_port"] = json!(self.protocol_port);
        body["subnet_id"] = json!(self.subnet_id);
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "enabled": self.admin_state_up,
            "weight": self.weight,
        })
    }
}

impl Resource for HealthMonitor {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!("{}/pools/{}/healthmonitor", loadbalancer_path(&lb.id), self.pool_id)
    }

    // one monitor per pool, addressed by the pool
    fn item_path(&self, lb: &LoadBalancer) -> String {
        self.collection_path(lb)
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["type"] = json!(self.monitor_type.as_str());
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "enabled": self.admin_state_up,
            "delay": self.delay,
            "timeout": self.timeout,
            "rise_threshold": self.max_retries,
            "fall_threshold": fall_threshold(self),
            "http_method": self.http_method,
            "url_path": self.url_path,
            "expected_codes": self.expected_codes,
        })
    }
}

impl Resource for L7Policy {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!(
            "{}/listeners/{}/l7policies",
            loadbalancer_path(&lb.id),
            self.listener_id
        )
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["id"] = json!(self.id);
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "enabled": self.admin_state_up,
            "action": self.action.as_str(),
            "position": self.position,
            "redirect_pool_id": self.redirect_pool_id,
            "redirect_url": self.redirect_url,
        })
    }
}

impl Resource for L7Rule {
    fn collection_path(&self, lb: &LoadBalancer) -> String {
        format!(
            "{}/listeners/{}/l7policies/{}/l7rules",
            loadbalancer_path(&lb.id),
            self.listener_id,
            self.l7policy_id
        )
    }

    fn create_body(&self) -> Value {
        let mut body = self.update_body();
        body["id"] = json!(self.id);
        body
    }

    fn update_body(&self) -> Value {
        json!({
            "type": self.rule_type.as_str(),
            "compare_type": self.compare_type.as_str(),
            "key": self.key,
            "value": self.value,
            "invert": self.invert,
        })
    }
}

fn graph_pool(pool: &Pool) -> Value {
    let mut body = pool.create_body();
    body["members"] = Value::Array(
        pool.members
            .iter()
            .filter(|m| live(m.provisioning_status))
            .map(Resource::create_body)
            .collect(),
    );
    if let Some(hm) = &pool.healthmonitor {
        body["healthmonitor"] = hm.create_body();
    }
    body
}

fn graph_listener(lb: &LoadBalancer, listener: &Listener) -> Value {
    let mut body = listener.create_body();
    if let Some(pool) = lb.default_pool(listener) {
        body["default_pool"] = graph_pool(pool);
    }
    let mut policies: Vec<&L7Policy> = listener.l7_policies.iter().collect();
    policies.sort_by_key(|p| p.position);
    body["l7policies"] = Value::Array(
        policies
            .into_iter()
            .map(|p| {
                let mut policy = p.create_body();
                policy["l7rules"] = Value::Array(p.rules.iter().map(Resource::create_body).collect());
                policy
            })
            .collect(),
    );
    body
}

/// Create body for a load balancer; with `graph` its listeners come nested
pub fn loadbalancer_create_body(lb: &LoadBalancer, graph: bool) -> Value {
    let mut vip = json!({ "subnet_id": lb.vip_subnet_id });
    if let Some(address) = &lb.vip_address {
        vip["ip_address"] = json!(address);
    }
    if let Some(port_id) = &lb.vip_port_id {
        vip["port_id"] = json!(port_id);
    }
    let mut body = json!({
        "id": lb.id,
        "name": lb.name,
        "description": lb.description,
        "project_id": lb.project_id,
        "enabled": lb.admin_state_up,
        "vip": vip,
    });
    if graph && !lb.listeners.is_empty() {
        body["listeners"] = Value::Array(
            lb.listeners
                .iter()
                .map(|l| graph_listener(lb, l))
                .collect(),
        );
    }
    body
}

pub fn loadbalancer_update_body(lb: &LoadBalancer) -> Value {
    json!({
        "name": lb.name,
        "description": lb.description,
        "enabled": lb.admin_state_up,
    })
}
