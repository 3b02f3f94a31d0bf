//! Kind-erased entity wrapper used by finalizers, the store and RPC payloads

use serde::{Deserialize, Serialize};

use super::graph::{HealthMonitor, L7Policy, L7Rule, Listener, LoadBalancer, Member, Pool};
use super::types::{OperatingStatus, ProvisioningStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    LoadBalancer,
    Listener,
    Pool,
    Member,
    HealthMonitor,
    L7Policy,
    L7Rule,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::LoadBalancer => "loadbalancer",
            EntityKind::Listener => "listener",
            EntityKind::Pool => "pool",
            EntityKind::Member => "member",
            EntityKind::HealthMonitor => "healthmonitor",
            EntityKind::L7Policy => "l7policy",
            EntityKind::L7Rule => "l7rule",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "loadbalancer" => Some(EntityKind::LoadBalancer),
            "listener" => Some(EntityKind::Listener),
            "pool" => Some(EntityKind::Pool),
            "member" => Some(EntityKind::Member),
            "healthmonitor" => Some(EntityKind::HealthMonitor),
            "l7policy" => Some(EntityKind::L7Policy),
            "l7rule" => Some(EntityKind::L7Rule),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Entity {
    LoadBalancer(LoadBalancer),
    Listener(Listener),
    Pool(Pool),
    Member(Member),
    HealthMonitor(HealthMonitor),
    L7Policy(L7Policy),
    L7Rule(L7Rule),
}

macro_rules! each_entity {
    ($value:expr, $bind:ident => $body:expr) => {
        match $value {
            Entity::LoadBalancer($bind) => $body,
            Entity::Listener($bind) => $body,
            Entity::Pool($bind) => $body,
            Entity::Member($bind) => $body,
            Entity::HealthMonitor($bind) => $body,
            Entity::L7Policy($bind) => $body,
            Entity::L7Rule($bind) => $body,
        }
    };
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::LoadBalancer(_) => EntityKind::LoadBalancer,
            Entity::Listener(_) => EntityKind::Listener,
            Entity::Pool(_) => EntityKind::Pool,
            Entity::Member(_) => EntityKind::Member,
            Entity::HealthMonitor(_) => EntityKind::HealthMonitor,
            Entity::L7Policy(_) => EntityKind::L7Policy,
            Entity::L7Rule(_) => EntityKind::L7Rule,
        }
    }

    pub fn id(&self) -> &str {
        each_entity!(self, e => &e.id)
    }

    pub fn loadbalancer_id(&self) -> &str {
        match self {
            Entity::LoadBalancer(lb) => &lb.id,
            Entity::Listener(e) => &e.loadbalancer_id,
            Entity::Pool(e) => &e.loadbalancer_id,
            Entity::Member(e) => &e.loadbalancer_id,
            Entity::HealthMonitor(e) => &e.loadbalancer_id,
            Entity::L7Policy(e) => &e.loadbalancer_id,
            Entity::L7Rule(e) => &e.loadbalancer_id,
        }
    }

    pub fn provisioning_status(&self) -> ProvisioningStatus {
        each_entity!(self, e => e.provisioning_status)
    }

    pub fn operating_status(&self) -> OperatingStatus {
        each_entity!(self, e => e.operating_status)
    }

    pub fn set_provisioning_status(&mut self, status: ProvisioningStatus) {
        each_entity!(self, e => e.provisioning_status = status)
    }

    pub fn set_operating_status(&mut self, status: OperatingStatus) {
        each_entity!(self, e => e.operating_status = status)
    }

    pub fn as_loadbalancer(&self) -> Option<&LoadBalancer> {
        match self {
            Entity::LoadBalancer(lb) => Some(lb),
            _ => None,
        }
    }
}

/// Typed access to an entity kind; implemented by every graph node
pub trait ManagedEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn loadbalancer_id(&self) -> &str;
    fn provisioning_status(&self) -> ProvisioningStatus;
    fn set_provisioning_status(&mut self, status: ProvisioningStatus);
    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;
}

macro_rules! managed_entity {
    ($ty:ident, $kind:ident, |$s:ident| $lb:expr) => {
        impl ManagedEntity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn loadbalancer_id(&self) -> &str {
                let $s = self;
                $lb
            }

            fn provisioning_status(&self) -> ProvisioningStatus {
                self.provisioning_status
            }

            fn set_provisioning_status(&mut self, status: ProvisioningStatus) {
                self.provisioning_status = status;
            }

            fn into_entity(self) -> Entity {
                Entity::$kind(self)
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$kind(e) => Some(e),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Entity {
            fn from(value: $ty) -> Self {
                Entity::$kind(value)
            }
        }
    };
}

managed_entity!(LoadBalancer, LoadBalancer, |s| &s.id);
managed_entity!(Listener, Listener, |s| &s.loadbalancer_id);
managed_entity!(Pool, Pool, |s| &s.loadbalancer_id);
managed_entity!(Member, Member, |s| &s.loadbalancer_id);
managed_entity!(HealthMonitor, HealthMonitor, |s| &s.loadbalancer_id);
managed_entity!(L7Policy, L7Policy, |s| &s.loadbalancer_id);
managed_entity!(L7Rule, L7Rule, |s| &s.loadbalancer_id);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::Protocol;

    #[test]
    fn test_entity_serializes_with_kind_tag() {
        let listener = Listener::new("l1", "lb1", Protocol::Tcp, 22);
        let value = serde_json::to_value(Entity::from(listener)).unwrap();
        assert_eq!(value["kind"], "listener");
        assert_eq!(value["body"]["protocol_port"], 22);

        let back: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), EntityKind::Listener);
        assert_eq!(back.loadbalancer_id(), "lb1");
    }

    #[test]
    fn test_status_setters() {
        let mut entity = Entity::from(LoadBalancer::new("lb1", "p", "s"));
        entity.set_provisioning_status(ProvisioningStatus::Error);
        entity.set_operating_status(OperatingStatus::Error);
        assert_eq!(entity.provisioning_status(), ProvisioningStatus::Error);
        assert_eq!(entity.operating_status(), OperatingStatus::Error);
        assert_eq!(entity.loadbalancer_id(), "lb1");
    }

    #[test]
    fn test_kind_parse() {
        for kind in [
            EntityKind::LoadBalancer,
            EntityKind::Listener,
            EntityKind::Pool,
            EntityKind::Member,
            EntityKind::HealthMonitor,
            EntityKind::L7Policy,
            EntityKind::L7Rule,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("listener_stats"), None);
    }
}
