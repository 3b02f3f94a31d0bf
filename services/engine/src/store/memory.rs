//! In-memory object store
//!
//! Holds every load balancer graph behind one lock and enforces the
//! uniqueness and ownership rules a relational store would enforce with
//! constraints.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::ObjectStore;
use crate::error::{LbaasError, Result};
use crate::model::{
    Entity, EntityKind, HealthMonitor, L7Action, L7Policy, L7Rule, Listener, LoadBalancer,
    LoadBalancerStats, Member, OperatingStatus, Pool, ProvisioningStatus,
};

#[derive(Default)]
pub struct InMemoryStore {
    loadbalancers: RwLock<BTreeMap<String, LoadBalancer>>,
    stats: RwLock<HashMap<String, LoadBalancerStats>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owner_of(lbs: &BTreeMap<String, LoadBalancer>, kind: EntityKind, id: &str) -> Option<String> {
    if kind == EntityKind::LoadBalancer {
        return lbs.contains_key(id).then(|| id.to_string());
    }
    lbs.values()
        .find(|lb| lb.find(kind, id).is_some())
        .map(|lb| lb.id.clone())
}

fn owning_lb<'a>(
    lbs: &'a mut BTreeMap<String, LoadBalancer>,
    kind: EntityKind,
    id: &str,
) -> Result<&'a mut LoadBalancer> {
    let lb_id = owner_of(lbs, kind, id).ok_or_else(|| LbaasError::not_found(kind.as_str(), id))?;
    lbs.get_mut(&lb_id)
        .ok_or_else(|| LbaasError::not_found(kind.as_str(), id))
}

fn parent_lb<'a>(
    lbs: &'a mut BTreeMap<String, LoadBalancer>,
    lb_id: &str,
) -> Result<&'a mut LoadBalancer> {
    lbs.get_mut(lb_id)
        .ok_or_else(|| LbaasError::BadRequest(format!("load balancer {} does not exist", lb_id)))
}

macro_rules! set_statuses {
    ($target:expr, $prov:expr, $op:expr) => {{
        let target = $target;
        if let Some(p) = $prov {
            target.provisioning_status = p;
        }
        if let Some(o) = $op {
            target.operating_status = o;
        }
        true
    }};
}

fn set_status(
    lb: &mut LoadBalancer,
    kind: EntityKind,
    id: &str,
    prov: Option<ProvisioningStatus>,
    op: Option<OperatingStatus>,
) -> bool {
    match kind {
        EntityKind::LoadBalancer => lb.id == id && set_statuses!(&mut *lb, prov, op),
        EntityKind::Listener => lb
            .listener_mut(id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
        EntityKind::Pool => lb
            .pool_mut(id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
        EntityKind::Member => lb
            .pools
            .iter_mut()
            .flat_map(|p| p.members.iter_mut())
            .find(|m| m.id == id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
        EntityKind::HealthMonitor => lb
            .pools
            .iter_mut()
            .filter_map(|p| p.healthmonitor.as_mut())
            .find(|hm| hm.id == id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
        EntityKind::L7Policy => lb
            .listeners
            .iter_mut()
            .flat_map(|l| l.l7_policies.iter_mut())
            .find(|p| p.id == id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
        EntityKind::L7Rule => lb
            .listeners
            .iter_mut()
            .flat_map(|l| l.l7_policies.iter_mut())
            .flat_map(|p| p.rules.iter_mut())
            .find(|r| r.id == id)
            .map(|e| set_statuses!(e, prov, op))
            .unwrap_or(false),
    }
}

fn check_listener_port(lb: &LoadBalancer, listener: &Listener) -> Result<()> {
    let clash = lb
        .listeners
        .iter()
        .any(|l| l.id != listener.id && l.protocol_port == listener.protocol_port);
    if clash {
        return Err(LbaasError::Conflict(format!(
            "load balancer {} already has a listener on port {}",
            lb.id, listener.protocol_port
        )));
    }
    Ok(())
}

fn check_member_unique(pool: &Pool, member: &Member) -> Result<()> {
    let clash = pool.members.iter().any(|m| {
        m.id != member.id && m.address == member.address && m.protocol_port == member.protocol_port
    });
    if clash {
        return Err(LbaasError::Conflict(format!(
            "pool {} already has a member at {}:{}",
            pool.id, member.address, member.protocol_port
        )));
    }
    Ok(())
}

fn renumber(policies: &mut [L7Policy]) {
    for (index, policy) in policies.iter_mut().enumerate() {
        policy.position = index as u32 + 1;
    }
}

fn upsert_loadbalancer(lbs: &mut BTreeMap<String, LoadBalancer>, lb: LoadBalancer) -> Result<()> {
    if let Some(existing) = lbs.get_mut(&lb.id) {
        existing.name = lb.name;
        existing.description = lb.description;
        existing.admin_state_up = lb.admin_state_up;
        existing.provisioning_status = lb.provisioning_status;
        existing.operating_status = lb.operating_status;
        existing.vip_address = lb.vip_address;
        existing.vip_port_id = lb.vip_port_id;
        existing.flavor_id = lb.flavor_id;
        existing.provider = lb.provider;
        return Ok(());
    }

    // Graph create: the whole tree arrives at once
    for (index, listener) in lb.listeners.iter().enumerate() {
        if lb.listeners[..index]
            .iter()
            .any(|l| l.protocol_port == listener.protocol_port)
        {
            return Err(LbaasError::Conflict(format!(
                "duplicate listener port {} in load balancer {}",
                listener.protocol_port, lb.id
            )));
        }
    }
    for pool in &lb.pools {
        for member in &pool.members {
            check_member_unique(pool, member)?;
        }
    }
    let mut lb = lb;
    for listener in lb.listeners.iter_mut() {
        listener.l7_policies.sort_by_key(|p| p.position);
        renumber(&mut listener.l7_policies);
    }
    debug!(lb_id = %lb.id, "Inserted load balancer graph");
    lbs.insert(lb.id.clone(), lb);
    Ok(())
}

fn upsert_listener(lb: &mut LoadBalancer, listener: Listener) -> Result<()> {
    check_listener_port(lb, &listener)?;
    if let Some(pool_id) = &listener.default_pool_id {
        if lb.pool(pool_id).is_none() {
            return Err(LbaasError::BadRequest(format!("pool {} does not exist", pool_id)));
        }
    }
    match lb.listener_mut(&listener.id) {
        Some(existing) => {
            let policies = std::mem::take(&mut existing.l7_policies);
            *existing = listener;
            existing.l7_policies = policies;
        }
        None => lb.listeners.push(listener),
    }
    Ok(())
}

fn upsert_pool(lb: &mut LoadBalancer, pool: Pool) -> Result<()> {
    if let Some(listener_id) = pool.listener_id.clone() {
        let listener = lb.listener_mut(&listener_id).ok_or_else(|| {
            LbaasError::BadRequest(format!("listener {} does not exist", listener_id))
        })?;
        match &listener.default_pool_id {
            Some(current) if current != &pool.id => {
                return Err(LbaasError::Conflict(format!(
                    "listener {} already has default pool {}",
                    listener_id, current
                )));
            }
            _ => listener.default_pool_id = Some(pool.id.clone()),
        }
    }
    match lb.pool_mut(&pool.id) {
        Some(existing) => {
            let members = std::mem::take(&mut existing.members);
            let healthmonitor = existing.healthmonitor.take();
            *existing = pool;
            existing.members = members;
            existing.healthmonitor = healthmonitor;
        }
        None => {
            for member in &pool.members {
                check_member_unique(&pool, member)?;
            }
            lb.pools.push(pool);
        }
    }
    Ok(())
}

fn upsert_member(lb: &mut LoadBalancer, member: Member) -> Result<()> {
    let pool = lb.pool_mut(&member.pool_id).ok_or_else(|| {
        LbaasError::BadRequest(format!("pool {} does not exist", member.pool_id))
    })?;
    check_member_unique(pool, &member)?;
    match pool.members.iter_mut().find(|m| m.id == member.id) {
        Some(existing) => *existing = member,
        None => pool.members.push(member),
    }
    Ok(())
}

fn upsert_healthmonitor(lb: &mut LoadBalancer, hm: HealthMonitor) -> Result<()> {
    let pool = lb
        .pool_mut(&hm.pool_id)
        .ok_or_else(|| LbaasError::BadRequest(format!("pool {} does not exist", hm.pool_id)))?;
    if let Some(existing) = &pool.healthmonitor {
        if existing.id != hm.id {
            return Err(LbaasError::Conflict(format!(
                "pool {} already has health monitor {}",
                pool.id, existing.id
            )));
        }
    }
    pool.healthmonitor = Some(hm);
    Ok(())
}

fn upsert_l7policy(lb: &mut LoadBalancer, policy: L7Policy) -> Result<()> {
    if let Some(pool_id) = &policy.redirect_pool_id {
        if lb.pool(pool_id).is_none() {
            return Err(LbaasError::BadRequest(format!("pool {} does not exist", pool_id)));
        }
    }
    let listener = lb.listener_mut(&policy.listener_id).ok_or_else(|| {
        LbaasError::BadRequest(format!("listener {} does not exist", policy.listener_id))
    })?;

    let mut policy = policy;
    if let Some(index) = listener.l7_policies.iter().position(|p| p.id == policy.id) {
        let previous = listener.l7_policies.remove(index);
        policy.rules = previous.rules;
    }
    let len = listener.l7_policies.len();
    let index = match policy.position {
        0 => len,
        p => (p as usize - 1).min(len),
    };
    listener.l7_policies.insert(index, policy);
    renumber(&mut listener.l7_policies);
    Ok(())
}

fn upsert_l7rule(lb: &mut LoadBalancer, rule: L7Rule) -> Result<()> {
    let policy = lb
        .listeners
        .iter_mut()
        .flat_map(|l| l.l7_policies.iter_mut())
        .find(|p| p.id == rule.l7policy_id)
        .ok_or_else(|| {
            LbaasError::BadRequest(format!("l7 policy {} does not exist", rule.l7policy_id))
        })?;
    match policy.rules.iter_mut().find(|r| r.id == rule.id) {
        Some(existing) => *existing = rule,
        None => policy.rules.push(rule),
    }
    Ok(())
}

fn remove_child(lb: &mut LoadBalancer, kind: EntityKind, id: &str) -> Result<()> {
    match kind {
        EntityKind::LoadBalancer => {}
        EntityKind::Listener => {
            lb.listeners.retain(|l| l.id != id);
            for pool in lb.pools.iter_mut() {
                if pool.listener_id.as_deref() == Some(id) {
                    pool.listener_id = None;
                }
            }
        }
        EntityKind::Pool => {
            let redirected = lb
                .listeners
                .iter()
                .flat_map(|l| l.l7_policies.iter())
                .any(|p| {
                    p.action == L7Action::RedirectToPool
                        && p.redirect_pool_id.as_deref() == Some(id)
                });
            if redirected {
                return Err(LbaasError::Conflict(format!(
                    "pool {} is the target of an l7 policy",
                    id
                )));
            }
            lb.pools.retain(|p| p.id != id);
            for listener in lb.listeners.iter_mut() {
                if listener.default_pool_id.as_deref() == Some(id) {
                    listener.default_pool_id = None;
                }
            }
        }
        EntityKind::Member => {
            for pool in lb.pools.iter_mut() {
                pool.members.retain(|m| m.id != id);
            }
        }
        EntityKind::HealthMonitor => {
            for pool in lb.pools.iter_mut() {
                if pool.healthmonitor.as_ref().map(|hm| hm.id.as_str()) == Some(id) {
                    pool.healthmonitor = None;
                }
            }
        }
        EntityKind::L7Policy => {
            for listener in lb.listeners.iter_mut() {
                let before = listener.l7_policies.len();
                listener.l7_policies.retain(|p| p.id != id);
                if listener.l7_policies.len() != before {
                    renumber(&mut listener.l7_policies);
                }
            }
        }
        EntityKind::L7Rule => {
            for policy in lb
                .listeners
                .iter_mut()
                .flat_map(|l| l.l7_policies.iter_mut())
            {
                policy.rules.retain(|r| r.id != id);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_loadbalancer(&self, id: &str) -> Result<LoadBalancer> {
        self.loadbalancers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LbaasError::not_found("loadbalancer", id))
    }

    async fn list_loadbalancer_ids(&self) -> Result<Vec<String>> {
        Ok(self.loadbalancers.read().await.keys().cloned().collect())
    }

    async fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Entity> {
        let lbs = self.loadbalancers.read().await;
        lbs.values()
            .find_map(|lb| lb.find(kind, id))
            .ok_or_else(|| LbaasError::not_found(kind.as_str(), id))
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        let mut lbs = self.loadbalancers.write().await;
        let lb_id = entity.loadbalancer_id().to_string();
        match entity {
            Entity::LoadBalancer(lb) => upsert_loadbalancer(&mut lbs, lb),
            Entity::Listener(e) => upsert_listener(parent_lb(&mut lbs, &lb_id)?, e),
            Entity::Pool(e) => upsert_pool(parent_lb(&mut lbs, &lb_id)?, e),
            Entity::Member(e) => upsert_member(parent_lb(&mut lbs, &lb_id)?, e),
            Entity::HealthMonitor(e) => upsert_healthmonitor(parent_lb(&mut lbs, &lb_id)?, e),
            Entity::L7Policy(e) => upsert_l7policy(parent_lb(&mut lbs, &lb_id)?, e),
            Entity::L7Rule(e) => upsert_l7rule(parent_lb(&mut lbs, &lb_id)?, e),
        }
    }

    async fn update_status(
        &self,
        kind: EntityKind,
        id: &str,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Result<()> {
        let mut lbs = self.loadbalancers.write().await;
        let lb = owning_lb(&mut lbs, kind, id)?;
        if set_status(lb, kind, id, provisioning, operating) {
            Ok(())
        } else {
            Err(LbaasError::not_found(kind.as_str(), id))
        }
    }

    async fn update_loadbalancer_vip(
        &self,
        id: &str,
        vip_address: &str,
        vip_port_id: Option<&str>,
    ) -> Result<()> {
        let mut lbs = self.loadbalancers.write().await;
        let lb = lbs
            .get_mut(id)
            .ok_or_else(|| LbaasError::not_found("loadbalancer", id))?;
        lb.vip_address = Some(vip_address.to_string());
        if let Some(port_id) = vip_port_id {
            lb.vip_port_id = Some(port_id.to_string());
        }
        Ok(())
    }

    async fn update_loadbalancer_stats(&self, id: &str, stats: LoadBalancerStats) -> Result<()> {
        if !self.loadbalancers.read().await.contains_key(id) {
            return Err(LbaasError::not_found("loadbalancer", id));
        }
        self.stats.write().await.insert(id.to_string(), stats);
        Ok(())
    }

    async fn get_loadbalancer_stats(&self, id: &str) -> Result<LoadBalancerStats> {
        if !self.loadbalancers.read().await.contains_key(id) {
            return Err(LbaasError::not_found("loadbalancer", id));
        }
        Ok(self.stats.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()> {
        let mut lbs = self.loadbalancers.write().await;
        if kind == EntityKind::LoadBalancer {
            lbs.remove(id)
                .ok_or_else(|| LbaasError::not_found("loadbalancer", id))?;
            drop(lbs);
            self.stats.write().await.remove(id);
            return Ok(());
        }
        let lb = owning_lb(&mut lbs, kind, id)?;
        remove_child(lb, kind, id)?;
        debug!(kind = %kind, id = %id, "Removed entity");
        Ok(())
    }
}
