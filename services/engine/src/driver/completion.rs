//! Status finalization
//!
//! Every driver operation ends in exactly one call to
//! [`Finalizer::successful_completion`] or [`Finalizer::failed_completion`].
//! Synchronous drivers get that from [`finalize_sync`]; asynchronous drivers
//! hold a [`CompletionGuard`] until they either resolve it or hand it off.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{error, warn};

use crate::context::RequestContext;
use crate::error::Result;
use crate::model::{Entity, EntityKind, LoadBalancerStats, OperatingStatus, ProvisioningStatus};

/// What kind of operation a successful completion closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub delete: bool,
    pub lb_create: bool,
}

impl Completion {
    pub fn delete() -> Self {
        Self {
            delete: true,
            lb_create: false,
        }
    }

    pub fn lb_create() -> Self {
        Self {
            delete: false,
            lb_create: true,
        }
    }
}

/// Writes final statuses back to the object store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// On delete, remove the row. Otherwise mark ACTIVE/ONLINE; on LB create,
    /// persist the VIP carried by `entity`.
    async fn successful_completion(
        &self,
        ctx: &RequestContext,
        entity: &Entity,
        completion: Completion,
    ) -> Result<()>;

    /// Mark the entity and its root load balancer ERROR
    async fn failed_completion(&self, ctx: &RequestContext, entity: &Entity) -> Result<()>;

    /// Raw status write used by status streams and stats collectors
    async fn update_status(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        id: &str,
        provisioning: Option<ProvisioningStatus>,
        operating: Option<OperatingStatus>,
    ) -> Result<()>;

    async fn update_loadbalancer_stats(
        &self,
        ctx: &RequestContext,
        lb_id: &str,
        stats: LoadBalancerStats,
    ) -> Result<()>;
}

/// Pending finalization for one operation.
///
/// Dropping an unresolved guard finalizes the entity as failed.
pub struct CompletionGuard {
    finalizer: Arc<dyn Finalizer>,
    ctx: RequestContext,
    entity: Entity,
    completion: Completion,
    armed: bool,
}

impl CompletionGuard {
    pub fn new(
        finalizer: Arc<dyn Finalizer>,
        ctx: &RequestContext,
        entity: Entity,
        completion: Completion,
    ) -> Self {
        Self {
            finalizer,
            ctx: ctx.clone(),
            entity,
            completion,
            armed: true,
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    /// Replace the entity carried to the finalizer, e.g. with driver-allocated VIP data
    pub fn set_entity(&mut self, entity: Entity) {
        self.entity = entity;
    }

    pub async fn succeed(mut self) {
        self.armed = false;
        if let Err(e) = self
            .finalizer
            .successful_completion(&self.ctx, &self.entity, self.completion)
            .await
        {
            error!(
                kind = %self.entity.kind(),
                id = %self.entity.id(),
                error = %e,
                "Successful completion could not be recorded"
            );
        }
    }

    pub async fn fail(mut self) {
        self.armed = false;
        if let Err(e) = self.finalizer.failed_completion(&self.ctx, &self.entity).await {
            error!(
                kind = %self.entity.kind(),
                id = %self.entity.id(),
                error = %e,
                "Failed completion could not be recorded"
            );
        }
    }

    /// Hand the completion to an asynchronous engine that will finalize later
    pub fn defer(mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            kind = %self.entity.kind(),
            id = %self.entity.id(),
            "Operation ended without finalizing; marking failed"
        );
        let finalizer = self.finalizer.clone();
        let ctx = self.ctx.clone();
        let entity = self.entity.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = finalizer.failed_completion(&ctx, &entity).await {
                        error!(id = %entity.id(), error = %e, "Failed completion could not be recorded");
                    }
                });
            }
            Err(_) => error!(id = %self.entity.id(), "No runtime available to finalize entity"),
        }
    }
}

/// Run a synchronous driver operation and finalize its outcome.
///
/// Success finalizes as successful; any error finalizes as failed and is
/// returned unchanged.
pub async fn finalize_sync<F>(
    finalizer: Arc<dyn Finalizer>,
    ctx: &RequestContext,
    entity: Entity,
    completion: Completion,
    operation: F,
) -> Result<()>
where
    F: Future<Output = Result<()>> + Send,
{
    let guard = CompletionGuard::new(finalizer, ctx, entity, completion);
    match operation.await {
        Ok(()) => {
            guard.succeed().await;
            Ok(())
        }
        Err(e) => {
            guard.fail().await;
            Err(e)
        }
    }
}
