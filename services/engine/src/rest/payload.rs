//! Workflow parameters
//!
//! The controller's workflow takes the whole live graph on every apply.
//! Children are nested under their parents and entities being deleted are
//! left out, so each apply describes the target state.

use serde_json::{json, Map, Value};

use super::proxy_port::ProxyPlan;
use crate::config::RadwareSettings;
use crate::model::{
    HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, Member, Pool, ProvisioningStatus,
};

pub fn workflow_name(lb_id: &str) -> String {
    format!("LB_{}", lb_id)
}

fn live(status: ProvisioningStatus) -> bool {
    status != ProvisioningStatus::PendingDelete
}

fn member(member: &Member) -> Value {
    json!({
        "id": member.id,
        "address": member.address,
        "protocol_port": member.protocol_port,
        "weight": member.weight,
        "admin_state_up": member.admin_state_up,
        "subnet": member.subnet_id,
    })
}

fn health_monitor(hm: &HealthMonitor) -> Value {
    json!({
        "id": hm.id,
        "type": hm.monitor_type.as_str(),
        "delay": hm.delay,
        "timeout": hm.timeout,
        "max_retries": hm.max_retries,
        "http_method": hm.http_method,
        "url_path": hm.url_path,
        "expected_codes": hm.expected_codes,
        "admin_state_up": hm.admin_state_up,
    })
}

fn pool(pool: &Pool) -> Value {
    let mut body = json!({
        "id": pool.id,
        "protocol": pool.protocol.as_str(),
        "lb_algorithm": pool.lb_algorithm.as_str(),
        "admin_state_up": pool.admin_state_up,
        "members": pool
            .members
            .iter()
            .filter(|m| live(m.provisioning_status))
            .map(member)
            .collect::<Vec<_>>(),
    });
    if let Some(hm) = pool.healthmonitor.as_ref().filter(|hm| live(hm.provisioning_status)) {
        body["healthmonitor"] = health_monitor(hm);
    }
    if let Some(sp) = &pool.session_persistence {
        body["sessionpersistence"] = json!({
            "type": sp.persistence_type.as_str(),
            "cookie_name": sp.cookie_name,
        });
    }
    body
}

fn rule(rule: &L7Rule) -> Value {
    json!({
        "id": rule.id,
        "type": rule.rule_type.as_str(),
        "compare_type": rule.compare_type.as_str(),
        "invert": rule.invert,
        "key": rule.key,
        "value": rule.value,
        "admin_state_up": rule.admin_state_up,
    })
}

fn policy(policy: &L7Policy) -> Value {
    json!({
        "id": policy.id,
        "action": policy.action.as_str(),
        "position": policy.position,
        "redirect_pool_id": policy.redirect_pool_id,
        "redirect_url": policy.redirect_url,
        "admin_state_up": policy.admin_state_up,
        "rules": policy
            .rules
            .iter()
            .filter(|r| live(r.provisioning_status))
            .map(rule)
            .collect::<Vec<_>>(),
    })
}

fn listener(lb: &LoadBalancer, listener: &Listener) -> Value {
    let mut body = json!({
        "id": listener.id,
        "protocol": listener.protocol.as_str(),
        "protocol_port": listener.protocol_port,
        "connection_limit": listener.connection_limit,
        "admin_state_up": listener.admin_state_up,
        "default_tls_container_ref": listener.default_tls_container_id,
        "sni_container_refs": listener
            .sni_containers
            .iter()
            .map(|s| s.tls_container_id.clone())
            .collect::<Vec<_>>(),
    });
    if let Some(default_pool) = lb.default_pool(listener).filter(|p| live(p.provisioning_status)) {
        body["default_pool"] = pool(default_pool);
    }
    let mut policies: Vec<&L7Policy> = listener
        .l7_policies
        .iter()
        .filter(|p| live(p.provisioning_status))
        .collect();
    policies.sort_by_key(|p| p.position);
    body["l7_policies"] = Value::Array(policies.into_iter().map(policy).collect());
    body
}

/// Parameters for one workflow apply
pub fn apply_parameters(lb: &LoadBalancer, plan: &ProxyPlan) -> Value {
    let listeners: Vec<Value> = lb
        .listeners
        .iter()
        .filter(|l| live(l.provisioning_status))
        .map(|l| listener(lb, l))
        .collect();
    // pools reachable only through L7 redirects still need a definition
    let referenced: Vec<&str> = lb
        .listeners
        .iter()
        .filter_map(|l| l.default_pool_id.as_deref())
        .collect();
    let redirect_pools: Vec<Value> = lb
        .pools
        .iter()
        .filter(|p| live(p.provisioning_status) && !referenced.contains(&p.id.as_str()))
        .map(pool)
        .collect();

    json!({
        "loadbalancer": {
            "id": lb.id,
            "name": lb.name,
            "admin_state_up": lb.admin_state_up,
            "vip_address": lb.vip_address,
            "pip_address": plan.pip_address,
            "listeners": listeners,
            "pools": redirect_pools,
        },
        "static_routes": plan.static_routes,
    })
}

/// Parameters for instantiating the workflow template
pub fn create_parameters(settings: &RadwareSettings, lb: &LoadBalancer) -> Value {
    let mut service = Map::new();
    service.insert("ha_pair".into(), json!(settings.service_ha_pair));
    service.insert("throughput".into(), json!(settings.service_throughput));
    service.insert("adc_type".into(), json!(settings.service_adc_type));
    if !settings.service_adc_version.is_empty() {
        service.insert("adc_version".into(), json!(settings.service_adc_version));
    }
    json!({
        "parameters": {
            "loadbalancer_id": lb.id,
            "vip_subnet_id": lb.vip_subnet_id,
            "service_params": Value::Object(service),
            "provision_service": settings.provision_service,
            "configure_l3": settings.configure_l3,
            "configure_l4": settings.configure_l4,
            "child_workflows": settings.child_workflow_template_names,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fixtures, L7Action, L7CompareType, L7RuleType};
    use crate::rest::proxy_port::StaticRoute;

    fn direct_plan() -> ProxyPlan {
        ProxyPlan {
            pip_address: "10.0.0.2".into(),
            proxy_port_id: None,
            static_routes: Vec::new(),
        }
    }

    #[test]
    fn test_graph_nests_default_pool() {
        let params = apply_parameters(&fixtures::loadbalancer(), &direct_plan());
        let lb = &params["loadbalancer"];
        assert_eq!(lb["pip_address"], "10.0.0.2");
        let listener = &lb["listeners"][0];
        assert_eq!(listener["protocol_port"], 80);
        assert_eq!(listener["default_pool"]["lb_algorithm"], "ROUND_ROBIN");
        assert_eq!(listener["default_pool"]["members"].as_array().unwrap().len(), 2);
        assert_eq!(listener["default_pool"]["healthmonitor"]["type"], "HTTP");
        assert_eq!(listener["default_pool"]["sessionpersistence"]["type"], "HTTP_COOKIE");
        assert!(lb["pools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_pending_delete_entities_are_left_out() {
        let mut lb = fixtures::loadbalancer();
        lb.pools[0].members[1].provisioning_status = ProvisioningStatus::PendingDelete;
        lb.pools[0].healthmonitor.as_mut().unwrap().provisioning_status =
            ProvisioningStatus::PendingDelete;
        let params = apply_parameters(&lb, &direct_plan());
        let pool = &params["loadbalancer"]["listeners"][0]["default_pool"];
        assert_eq!(pool["members"].as_array().unwrap().len(), 1);
        assert!(pool.get("healthmonitor").is_none());
    }

    #[test]
    fn test_l7_policies_and_redirect_pools() {
        let mut lb = fixtures::loadbalancer();
        let mut redirect = fixtures::pool();
        redirect.id = "redirect_pool".into();
        redirect.listener_id = None;
        redirect.members.clear();
        lb.pools.push(redirect);
        let mut second = L7Policy::new("p2", fixtures::LB_ID, fixtures::LISTENER_ID, L7Action::Reject, 2);
        second.rules.push(L7Rule::new(
            "r1",
            fixtures::LB_ID,
            fixtures::LISTENER_ID,
            "p2",
            L7RuleType::Path,
            L7CompareType::StartsWith,
            "/admin",
        ));
        let mut first = L7Policy::new(
            "p1",
            fixtures::LB_ID,
            fixtures::LISTENER_ID,
            L7Action::RedirectToPool,
            1,
        );
        first.redirect_pool_id = Some("redirect_pool".into());
        lb.listeners[0].l7_policies = vec![second, first];

        let plan = ProxyPlan {
            pip_address: "192.168.10.2".into(),
            proxy_port_id: Some("port".into()),
            static_routes: vec![StaticRoute {
                destination: "192.168.10.0".into(),
                netmask: "255.255.255.0".into(),
                gateway: "192.168.10.1".into(),
            }],
        };
        let params = apply_parameters(&lb, &plan);
        let policies = params["loadbalancer"]["listeners"][0]["l7_policies"].as_array().unwrap();
        assert_eq!(policies[0]["id"], "p1");
        assert_eq!(policies[1]["rules"][0]["value"], "/admin");
        assert_eq!(params["loadbalancer"]["pools"][0]["id"], "redirect_pool");
        assert_eq!(params["static_routes"][0]["gateway"], "192.168.10.1");
    }

    #[test]
    fn test_create_parameters_carry_service_spec() {
        let settings = RadwareSettings::default();
        let params = create_parameters(&settings, &fixtures::loadbalancer());
        assert_eq!(params["parameters"]["service_params"]["adc_type"], "VA");
        assert!(params["parameters"]["service_params"].get("adc_version").is_none());
        assert_eq!(params["parameters"]["child_workflows"][0], "manage_l3");
    }
}
