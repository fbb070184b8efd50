use crate::error::StoreError;
use crate::tuple::Policies;
use crate::types::TenantId;
use async_trait::async_trait;
use std::time::Instant;

/// Durable source of truth for permission and grouping tuples.
///
/// Every call receives the caller's deadline. Backends may use it to bound
/// their own I/O; the engine enforces it regardless and reports expiry as
/// [`StoreError::DeadlineExceeded`].
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Loads every tuple of every tenant.
    async fn load_all(&self, deadline: Instant) -> std::result::Result<Policies, StoreError>;

    /// Loads the tuples of one tenant.
    ///
    /// Must return exactly what filtering [`PolicyStore::load_all`] by
    /// `tenant` returns. The default does precisely that.
    async fn load_for_tenant(
        &self,
        tenant: &TenantId,
        deadline: Instant,
    ) -> std::result::Result<Policies, StoreError> {
        let all = self.load_all(deadline).await?;
        Ok(all.for_tenant(tenant))
    }

    /// Replaces the whole persisted state atomically.
    async fn save_all(
        &self,
        policies: &Policies,
        deadline: Instant,
    ) -> std::result::Result<(), StoreError>;

    /// Replaces the tuples of one tenant, leaving other tenants untouched.
    ///
    /// The default reads the full state, splices the tenant in and writes the
    /// full state back. It is not safe against a concurrent writer of another
    /// tenant; backends that can scope a write to one tenant should override it.
    async fn save_for_tenant(
        &self,
        tenant: &TenantId,
        policies: &Policies,
        deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        let mut all = self.load_all(deadline).await?;
        all.replace_tenant(tenant, policies);
        self.save_all(&all, deadline).await
    }
}
