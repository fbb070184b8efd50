use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{self, MutationKind};
use crate::cache::{PolicyCache, TenantEntry};
use crate::config::EngineConfig;
use crate::error::{Error, Result, StoreError};
use crate::policy_set::TenantPolicySet;
use crate::store::PolicyStore;
use crate::types::{ActionId, ObjectId, SubjectId, TenantId};

/// Deadline used when the configured timeout overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Policy enforcement engine: answers checks from the cache and persists
/// mutations to the store before they become visible.
///
/// One instance is meant to be shared (e.g. in an `Arc`) by every caller in
/// the process. Writes made through this instance are visible to its next
/// check; writes made through another instance only after invalidation or
/// the configured invalidation interval.
#[derive(Debug)]
pub struct PolicyEngine<S> {
    store: S,
    cache: PolicyCache,
    filtered_load: bool,
    store_timeout: Duration,
}

/// Builder for [`PolicyEngine`].
#[derive(Debug)]
pub struct EngineBuilder<S> {
    store: S,
    config: EngineConfig,
}

impl<S> EngineBuilder<S> {
    /// Creates a new builder with default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads single tenants (`true`) or the full store filtered locally (`false`).
    pub fn filtered_load(mut self, on: bool) -> Self {
        self.config.filtered_load = on;
        self
    }

    /// Sets the default budget for each store call.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    /// Sets the maximum number of resident tenants; zero means unbounded.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Reloads tenants whose cached copy is older than `interval`.
    pub fn invalidation_interval(mut self, interval: Duration) -> Self {
        self.config.invalidation_interval = Some(interval);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> PolicyEngine<S> {
        let mut cache = PolicyCache::new(self.config.cache_capacity);
        if let Some(interval) = self.config.invalidation_interval {
            cache = cache.with_invalidation_interval(interval);
        }
        PolicyEngine {
            store: self.store,
            cache,
            filtered_load: self.config.filtered_load,
            store_timeout: self.config.store_timeout,
        }
    }
}

#[derive(Debug, Clone)]
enum Change<'a> {
    Grant(&'a SubjectId, &'a ObjectId, &'a ActionId),
    Revoke(&'a SubjectId, &'a ObjectId, &'a ActionId),
    GrantRole(&'a SubjectId, &'a SubjectId),
    RevokeRole(&'a SubjectId, &'a SubjectId),
}

impl Change<'_> {
    fn kind(&self) -> MutationKind {
        match self {
            Self::Grant(..) => MutationKind::Grant,
            Self::Revoke(..) => MutationKind::Revoke,
            Self::GrantRole(..) => MutationKind::GrantRole,
            Self::RevokeRole(..) => MutationKind::RevokeRole,
        }
    }

    fn subject(&self) -> &SubjectId {
        match self {
            Self::Grant(subject, ..)
            | Self::Revoke(subject, ..)
            | Self::GrantRole(subject, _)
            | Self::RevokeRole(subject, _) => subject,
        }
    }

    fn resource(&self) -> String {
        match self {
            Self::Grant(_, object, action) | Self::Revoke(_, object, action) => {
                format!("{object}#{action}")
            }
            Self::GrantRole(_, role) | Self::RevokeRole(_, role) => role.to_string(),
        }
    }

    /// Applies the change, returning whether the set was modified.
    fn apply(&self, set: &mut TenantPolicySet) -> bool {
        match *self {
            Self::Grant(subject, object, action) => {
                set.add_permission(subject.clone(), object.clone(), action.clone())
            }
            Self::Revoke(subject, object, action) => {
                set.remove_permission(subject, object, action)
            }
            Self::GrantRole(subject, role) => set.add_grouping(subject.clone(), role.clone()),
            Self::RevokeRole(subject, role) => set.remove_grouping(subject, role),
        }
    }
}

impl<S> PolicyEngine<S>
where
    S: PolicyStore,
{
    /// Returns whether `subject` may perform `action` on `object` in `tenant`.
    ///
    /// Any error means the decision could not be verified and must be
    /// treated as a denial by the caller.
    pub async fn check(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
    ) -> Result<bool> {
        self.check_until(tenant, subject, object, action, self.default_deadline())
            .await
    }

    /// [`PolicyEngine::check`] with a caller-supplied deadline for store I/O.
    pub async fn check_until(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
        deadline: Instant,
    ) -> Result<bool> {
        let entry = match self.entry(tenant, deadline).await {
            Ok(entry) => entry,
            Err(err) => {
                audit::audit_check_unavailable(tenant, subject, object, action, &err);
                return Err(err);
            }
        };
        let allowed = entry.read().check(subject, object, action);
        tracing::trace!(
            tenant = %tenant,
            subject = %subject,
            object = %object,
            action = %action,
            allowed,
            "policy check"
        );
        Ok(allowed)
    }

    /// Grants `action` on `object` to `subject`. Returns whether the grant is new.
    pub async fn grant(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
    ) -> Result<bool> {
        self.grant_until(tenant, subject, object, action, self.default_deadline())
            .await
    }

    /// [`PolicyEngine::grant`] with a caller-supplied deadline.
    pub async fn grant_until(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
        deadline: Instant,
    ) -> Result<bool> {
        self.mutate(tenant, Change::Grant(subject, object, action), deadline)
            .await
    }

    /// Revokes a direct grant. Returns whether it existed.
    pub async fn revoke(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
    ) -> Result<bool> {
        self.revoke_until(tenant, subject, object, action, self.default_deadline())
            .await
    }

    /// [`PolicyEngine::revoke`] with a caller-supplied deadline.
    pub async fn revoke_until(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        object: &ObjectId,
        action: &ActionId,
        deadline: Instant,
    ) -> Result<bool> {
        self.mutate(tenant, Change::Revoke(subject, object, action), deadline)
            .await
    }

    /// Makes `subject` a member of `role`. Returns whether the membership is new.
    pub async fn grant_role(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        role: &SubjectId,
    ) -> Result<bool> {
        self.grant_role_until(tenant, subject, role, self.default_deadline())
            .await
    }

    /// [`PolicyEngine::grant_role`] with a caller-supplied deadline.
    pub async fn grant_role_until(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        role: &SubjectId,
        deadline: Instant,
    ) -> Result<bool> {
        self.mutate(tenant, Change::GrantRole(subject, role), deadline)
            .await
    }

    /// Removes `subject` from `role`. Returns whether the membership existed.
    pub async fn revoke_role(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        role: &SubjectId,
    ) -> Result<bool> {
        self.revoke_role_until(tenant, subject, role, self.default_deadline())
            .await
    }

    /// [`PolicyEngine::revoke_role`] with a caller-supplied deadline.
    pub async fn revoke_role_until(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        role: &SubjectId,
        deadline: Instant,
    ) -> Result<bool> {
        self.mutate(tenant, Change::RevokeRole(subject, role), deadline)
            .await
    }

    /// Every role `subject` belongs to, directly or transitively.
    pub async fn roles_for(&self, tenant: &TenantId, subject: &SubjectId) -> Result<Vec<SubjectId>> {
        let entry = self.entry(tenant, self.default_deadline()).await?;
        let roles = entry.read().implicit_roles(subject);
        Ok(roles)
    }

    /// Every `(object, action)` pair `subject` holds, directly or through roles.
    pub async fn permissions_for(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
    ) -> Result<Vec<(ObjectId, ActionId)>> {
        let entry = self.entry(tenant, self.default_deadline()).await?;
        let permissions = entry.read().implicit_permissions(subject);
        Ok(permissions)
    }

    /// Drops the cached policy of `tenant`; the next access reloads it.
    ///
    /// Use after another engine instance changed the tenant.
    pub fn invalidate(&self, tenant: &TenantId) -> bool {
        self.cache.invalidate(tenant)
    }

    /// Drops every cached tenant policy.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Returns whether the tenant's policy is currently loaded.
    pub fn is_loaded(&self, tenant: &TenantId) -> bool {
        self.cache.is_loaded(tenant)
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// `now + store_timeout`, saturating for timeouts too large to represent.
    fn default_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.store_timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }

    /// Resident entry of `tenant`, loading it if needed.
    ///
    /// The deadline also bounds time spent waiting on another caller's load.
    async fn entry(&self, tenant: &TenantId, deadline: Instant) -> Result<Arc<TenantEntry>> {
        let entry = self
            .cache
            .get_or_load(tenant, || async move {
                let policies = if self.filtered_load {
                    self.call_store(deadline, self.store.load_for_tenant(tenant, deadline))
                        .await?
                } else {
                    self.call_store(deadline, self.store.load_all(deadline))
                        .await?
                        .for_tenant(tenant)
                };
                Ok::<_, Error>(TenantPolicySet::from_policies(tenant.clone(), policies))
            });
        self.within(deadline, entry).await?
    }

    /// Persists the change, then publishes it to the cached set.
    ///
    /// Writers of one tenant are serialized by its write gate. The change is
    /// computed on a copy and only swapped in after the store accepted it, so
    /// readers never see a change the store rejected.
    async fn mutate(&self, tenant: &TenantId, change: Change<'_>, deadline: Instant) -> Result<bool> {
        let result = self.try_mutate(tenant, &change, deadline).await;
        match &result {
            Ok(changed) => {
                audit::audit_mutation(
                    change.kind(),
                    tenant,
                    change.subject(),
                    &change.resource(),
                    *changed,
                );
            }
            Err(err) => audit::audit_mutation_failed(change.kind(), tenant, change.subject(), err),
        }
        result
    }

    async fn try_mutate(&self, tenant: &TenantId, change: &Change<'_>, deadline: Instant) -> Result<bool> {
        let gate = self.cache.write_gate(tenant);
        let _writer = self.within(deadline, gate.lock()).await?;

        let entry = self.entry(tenant, deadline).await?;
        let next = {
            let mut next = entry.read().clone();
            if !change.apply(&mut next) {
                return Ok(false);
            }
            next
        };

        let policies = next.to_policies();
        self.call_store(deadline, self.store.save_for_tenant(tenant, &policies, deadline))
            .await?;

        *entry.write() = next;
        if entry.is_detached() {
            // A reload may have raced the save; make the next access read the
            // store again.
            self.cache.invalidate(tenant);
        }
        Ok(true)
    }

    async fn call_store<T, F>(&self, deadline: Instant, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match self.within(deadline, call).await? {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(error = %err, "policy store call failed");
                Err(Error::from(err))
            }
        }
    }

    async fn within<T, F>(&self, deadline: Instant, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let budget = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
            .await
            .map_err(|_| {
                tracing::warn!(budget = ?budget, "policy store deadline exceeded");
                Error::from(StoreError::DeadlineExceeded(budget))
            })
    }
}
