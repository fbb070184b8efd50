use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::PolicyStore;
use crate::tuple::{GroupingTuple, PermissionTuple, Policies};
use crate::types::TenantId;

/// In-memory store implementation for tests and demos.
///
/// Clones share state, so one instance can back several engines to model
/// replicas of the same service. Failures can be queued with
/// [`MemoryStore::fail_next`] to exercise error paths.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    policies: Mutex<Policies>,
    faults: Mutex<VecDeque<Fault>>,
    calls: Mutex<CallCounts>,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    kind: FaultKind,
}

#[derive(Debug, Clone, Copy)]
enum FaultKind {
    Unavailable,
    WriteConflict,
}

/// Store operation selector used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Any load, full or filtered.
    Load,
    /// Any save, full or per tenant.
    Save,
}

/// Number of calls the store has served, per operation kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub load_all: usize,
    pub load_for_tenant: usize,
    pub save_all: usize,
    pub save_for_tenant: usize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `policies`.
    pub fn with_policies(policies: Policies) -> Self {
        let store = Self::new();
        *store.lock_policies() = policies;
        store
    }

    /// Inserts a permission tuple directly, bypassing any engine.
    pub fn insert_permission(&self, tuple: PermissionTuple) {
        self.lock_policies().permissions.insert(tuple);
    }

    /// Inserts a grouping tuple directly, bypassing any engine.
    pub fn insert_grouping(&self, tuple: GroupingTuple) {
        self.lock_policies().groupings.insert(tuple);
    }

    /// Returns a copy of everything persisted.
    pub fn snapshot(&self) -> Policies {
        self.lock_policies().clone()
    }

    /// Makes the next call of kind `op` fail as unreachable.
    pub fn fail_next(&self, op: StoreOp) {
        self.push_fault(op, FaultKind::Unavailable);
    }

    /// Makes the next save fail with a write conflict.
    pub fn conflict_next_save(&self) {
        self.push_fault(StoreOp::Save, FaultKind::WriteConflict);
    }

    /// Returns how many calls have been served so far.
    pub fn calls(&self) -> CallCounts {
        *self
            .inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push_fault(&self, op: StoreOp, kind: FaultKind) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Fault { op, kind });
    }

    fn take_fault(&self, op: StoreOp) -> std::result::Result<(), StoreError> {
        let mut faults = self
            .inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(index) = faults.iter().position(|fault| fault.op == op) else {
            return Ok(());
        };
        let fault = faults.remove(index);
        match fault.map(|fault| fault.kind) {
            Some(FaultKind::Unavailable) => {
                Err(StoreError::unavailable("injected memory store outage"))
            }
            Some(FaultKind::WriteConflict) => Err(StoreError::WriteConflict(
                "injected concurrent write".to_string(),
            )),
            None => Ok(()),
        }
    }

    fn count(&self, bump: impl FnOnce(&mut CallCounts)) {
        bump(
            &mut self
                .inner
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn lock_policies(&self) -> std::sync::MutexGuard<'_, Policies> {
        self.inner
            .policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn load_all(&self, _deadline: Instant) -> std::result::Result<Policies, StoreError> {
        self.count(|calls| calls.load_all += 1);
        self.take_fault(StoreOp::Load)?;
        Ok(self.snapshot())
    }

    async fn load_for_tenant(
        &self,
        tenant: &TenantId,
        _deadline: Instant,
    ) -> std::result::Result<Policies, StoreError> {
        self.count(|calls| calls.load_for_tenant += 1);
        self.take_fault(StoreOp::Load)?;
        Ok(self.lock_policies().for_tenant(tenant))
    }

    async fn save_all(
        &self,
        policies: &Policies,
        _deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        self.count(|calls| calls.save_all += 1);
        self.take_fault(StoreOp::Save)?;
        *self.lock_policies() = policies.clone();
        Ok(())
    }

    async fn save_for_tenant(
        &self,
        tenant: &TenantId,
        policies: &Policies,
        _deadline: Instant,
    ) -> std::result::Result<(), StoreError> {
        self.count(|calls| calls.save_for_tenant += 1);
        self.take_fault(StoreOp::Save)?;
        self.lock_policies().replace_tenant(tenant, policies);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_permission(PermissionTuple::parse("t1", "alice", "doc1", "read").unwrap());
        store.insert_permission(PermissionTuple::parse("t2", "bob", "doc2", "write").unwrap());
        store.insert_grouping(GroupingTuple::parse("t1", "alice", "admin").unwrap());
        store.insert_grouping(GroupingTuple::parse("t2", "bob", "admin").unwrap());
        store
    }

    #[test]
    fn load_for_tenant_should_match_filtered_load_all() {
        let store = seeded();
        let deadline = Instant::now();

        for tenant in ["t1", "t2", "t3"] {
            let tenant = TenantId::new(tenant).unwrap();
            let filtered = block_on(store.load_for_tenant(&tenant, deadline)).unwrap();
            let all = block_on(store.load_all(deadline)).unwrap();
            assert_eq!(filtered, all.for_tenant(&tenant));
        }
    }

    #[test]
    fn save_for_tenant_should_not_touch_other_tenants() {
        let store = seeded();
        let tenant = TenantId::new("t1").unwrap();

        block_on(store.save_for_tenant(&tenant, &Policies::new(), Instant::now())).unwrap();

        let all = store.snapshot();
        assert!(all.for_tenant(&tenant).is_empty());
        assert_eq!(all.for_tenant(&TenantId::new("t2").unwrap()).len(), 2);
    }

    #[test]
    fn save_all_should_replace_everything() {
        let store = seeded();
        let mut next = Policies::new();
        next.permissions
            .insert(PermissionTuple::parse("t9", "carol", "doc", "read").unwrap());

        block_on(store.save_all(&next, Instant::now())).unwrap();

        assert_eq!(store.snapshot(), next);
    }

    #[test]
    fn injected_faults_should_fire_once_and_leave_state_unchanged() {
        let store = seeded();
        let before = store.snapshot();
        store.fail_next(StoreOp::Load);
        store.fail_next(StoreOp::Save);
        store.conflict_next_save();

        let first = block_on(store.save_all(&Policies::new(), Instant::now()));
        let second = block_on(store.save_all(&Policies::new(), Instant::now()));

        assert!(matches!(first, Err(StoreError::Unavailable(_))));
        assert!(matches!(second, Err(StoreError::WriteConflict(_))));
        assert_eq!(store.snapshot(), before);
        // Saves do not consume the queued load fault.
        assert!(block_on(store.load_all(Instant::now())).is_err());
        assert!(block_on(store.load_all(Instant::now())).is_ok());
        assert_eq!(store.calls().save_all, 2);
        assert_eq!(store.calls().load_all, 2);
    }
}
