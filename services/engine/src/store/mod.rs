//! Object store contract
//!
//! The persistent store is owned by the API layer. The engine only needs
//! frozen graph reads, status writes and row removal, captured here as the
//! [`ObjectStore`] trait.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Entity, EntityKind, LoadBalancer, LoadBalancerStats, OperatingStatus, ProvisioningStatus,
};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Frozen snapshot of a whole load balancer graph
    async fn get_loadbalancer(&self, id: &str) -> Result<LoadBalancer>;

    async fn list_loadbalancer_ids(&self) -> Result<Vec<String>>;

    async fn get_entity(&self, kind: EntityKind, id: &str) -> Result<Entity>;

    /// Insert or replace one entity. Children of an existing entity are kept.
    async fn upsert_entity(&self, entity: Entity) -> Result<()>;

    async fn update_status(
        &self,
        kind: EntityKind,
        id: &str,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Result<()>;

    async fn update_loadbalancer_vip(
        &self,
        id: &str,
        vip_address: &str,
        vip_port_id: Option<&str>,
    ) -> Result<()>;

    async fn update_loadbalancer_stats(&self, id: &str, stats: LoadBalancerStats) -> Result<()>;

    async fn get_loadbalancer_stats(&self, id: &str) -> Result<LoadBalancerStats>;

    /// Remove an entity and everything it owns
    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()>;
}
