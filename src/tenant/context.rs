//! Request-scoped tenant binding.
//!
//! The binding is a tokio task-local: it exists exactly while the future passed
//! to [`TenantContext::scope`] is being polled, so it is gone on every exit path
//! (return, `?`, panic, or the future being dropped on cancellation). It is not
//! inherited by `tokio::spawn`; use [`TenantContext::propagate`] when handing
//! work to another task.

use crate::tenant::{ActorId, TenantId};
use std::future::Future;

tokio::task_local! {
    static CURRENT: TenantContext;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContext {
    tenant: Option<TenantId>,
    actor: Option<ActorId>,
}

impl TenantContext {
    pub fn new(tenant: TenantId, actor: Option<ActorId>) -> Self {
        Self {
            tenant: Some(tenant),
            actor,
        }
    }

    /// Context for platform/admin work against the shared namespace.
    pub fn platform(actor: Option<ActorId>) -> Self {
        Self {
            tenant: None,
            actor,
        }
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    /// Runs `future` with this context bound as the current one.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }

    pub fn current() -> Option<TenantContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    pub fn current_tenant() -> Option<TenantId> {
        CURRENT.try_with(|ctx| ctx.tenant.clone()).ok().flatten()
    }

    pub fn current_actor() -> Option<ActorId> {
        CURRENT.try_with(|ctx| ctx.actor.clone()).ok().flatten()
    }

    /// Captures the caller's binding (if any) and re-establishes it around
    /// `future`, for use before `tokio::spawn`.
    pub fn propagate<F>(future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let captured = Self::current();
        async move {
            match captured {
                Some(ctx) => CURRENT.scope(ctx, future).await,
                None => future.await,
            }
        }
    }
}
