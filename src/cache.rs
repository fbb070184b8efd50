use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::policy_set::TenantPolicySet;
use crate::types::TenantId;

/// Process-local map from tenant to its loaded [`TenantPolicySet`].
///
/// Loads are lazy and all-or-nothing: concurrent first accesses to the same
/// tenant share one load, and a failed load leaves nothing behind. The map is
/// guarded by its own short-lived mutex; each tenant's policy content sits
/// behind a separate reader/writer lock so unrelated tenants never contend.
///
/// Entries leave the cache through explicit invalidation, LRU eviction once
/// `capacity` tenants are resident, or when older than the optional
/// invalidation interval. The interval bounds how long changes made by
/// another process stay invisible here.
#[derive(Debug)]
pub struct PolicyCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Option<Duration>,
}

#[derive(Debug, Default)]
struct CacheState {
    slots: HashMap<TenantId, Arc<Slot>>,
    order: VecDeque<TenantId>,
    gates: HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>,
}

/// One tenant's place in the map. The detached flag is shared with the
/// entry the slot is initialized with, so an entry learns that its slot was
/// dropped even if the drop happened while it was still loading.
#[derive(Debug, Default)]
struct Slot {
    cell: OnceCell<Arc<TenantEntry>>,
    detached: Arc<AtomicBool>,
}

impl Slot {
    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

/// A loaded tenant: its policy set plus bookkeeping.
#[derive(Debug)]
pub(crate) struct TenantEntry {
    policy: RwLock<TenantPolicySet>,
    loaded_at: Instant,
    detached: Arc<AtomicBool>,
}

impl TenantEntry {
    fn new(policy: TenantPolicySet, detached: Arc<AtomicBool>) -> Self {
        Self {
            policy: RwLock::new(policy),
            loaded_at: Instant::now(),
            detached,
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TenantPolicySet> {
        self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TenantPolicySet> {
        self.policy.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the entry's slot left the map, through invalidation, eviction
    /// or expiry, at any point since the slot was created.
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.loaded_at) > ttl
    }
}

impl PolicyCache {
    /// Creates a cache holding at most `capacity` tenants.
    ///
    /// A capacity of zero means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            ttl: None,
        }
    }

    /// Drops entries older than `interval` on their next access.
    pub fn with_invalidation_interval(mut self, interval: Duration) -> Self {
        self.ttl = Some(interval);
        self
    }

    /// Returns the tenant's entry, running `load` if it is not resident.
    ///
    /// Concurrent callers for the same unloaded tenant wait for a single
    /// `load` and all observe its result. If `load` fails the error goes to
    /// the caller that ran it and the tenant stays unloaded.
    pub(crate) async fn get_or_load<F, Fut>(
        &self,
        tenant: &TenantId,
        load: F,
    ) -> Result<Arc<TenantEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TenantPolicySet>>,
    {
        let slot = self.slot(tenant);
        if let Some(entry) = slot.cell.get() {
            tracing::trace!(tenant = %tenant, "policy cache hit");
            return Ok(Arc::clone(entry));
        }

        let loaded = slot
            .cell
            .get_or_try_init(|| async {
                let policy = load().await?;
                tracing::debug!(
                    tenant = %tenant,
                    permissions = policy.permission_count(),
                    groupings = policy.grouping_count(),
                    "loaded tenant policy"
                );
                Ok::<_, Error>(Arc::new(TenantEntry::new(
                    policy,
                    Arc::clone(&slot.detached),
                )))
            })
            .await;

        match loaded {
            Ok(entry) => {
                let entry = Arc::clone(entry);
                self.evict_if_needed();
                Ok(entry)
            }
            Err(err) => {
                self.discard_empty_slot(tenant, &slot);
                Err(err)
            }
        }
    }

    /// Mutex serializing writers of one tenant. Survives invalidation so
    /// writers racing a reload still queue behind each other.
    pub(crate) fn write_gate(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut state = self.lock_state();
        Arc::clone(state.gates.entry(tenant.clone()).or_default())
    }

    /// Drops the tenant's entry; the next access reloads it from the store.
    ///
    /// Returns whether a loaded entry was dropped.
    pub fn invalidate(&self, tenant: &TenantId) -> bool {
        let mut state = self.lock_state();
        let dropped = Self::remove_slot(&mut state, tenant);
        if dropped {
            tracing::debug!(tenant = %tenant, "invalidated tenant policy");
        }
        dropped
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        let mut state = self.lock_state();
        for slot in state.slots.values() {
            slot.detach();
        }
        state.slots.clear();
        state.order.clear();
        state.gates.retain(|_, gate| Arc::strong_count(gate) > 1);
        tracing::debug!("invalidated all tenant policies");
    }

    /// Returns whether the tenant is currently loaded.
    pub fn is_loaded(&self, tenant: &TenantId) -> bool {
        let state = self.lock_state();
        state
            .slots
            .get(tenant)
            .is_some_and(|slot| slot.cell.initialized())
    }

    /// Number of loaded tenants.
    pub fn len(&self) -> usize {
        let state = self.lock_state();
        state
            .slots
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    /// Returns whether no tenant is loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, tenant: &TenantId) -> Arc<Slot> {
        let mut state = self.lock_state();

        if let Some(ttl) = self.ttl {
            let expired = state
                .slots
                .get(tenant)
                .and_then(|slot| slot.cell.get())
                .is_some_and(|entry| entry.is_expired(ttl, Instant::now()));
            if expired {
                Self::remove_slot(&mut state, tenant);
                tracing::debug!(tenant = %tenant, "tenant policy expired");
            }
        }

        let slot = match state.slots.get(tenant) {
            Some(slot) => Arc::clone(slot),
            None => {
                let slot = Arc::new(Slot::default());
                state.slots.insert(tenant.clone(), Arc::clone(&slot));
                slot
            }
        };
        if self.capacity > 0 {
            Self::touch(&mut state, tenant);
        }
        slot
    }

    /// Drops a slot whose load failed, unless other callers still wait on it.
    /// A waiter takes over the load inside the same slot, so the slot must
    /// stay reachable for later callers to join it.
    fn discard_empty_slot(&self, tenant: &TenantId, slot: &Arc<Slot>) {
        let mut state = self.lock_state();
        let same = state
            .slots
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        // One reference from the map, one from the failed caller.
        let unshared = Arc::strong_count(slot) == 2;
        if same && unshared && !slot.cell.initialized() {
            Self::remove_slot(&mut state, tenant);
        }
    }

    fn evict_if_needed(&self) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.lock_state();
        while state.slots.len() > self.capacity {
            let Some(tenant) = state.order.pop_front() else {
                break;
            };
            if Self::remove_slot(&mut state, &tenant) {
                tracing::debug!(tenant = %tenant, "evicted tenant policy");
            }
        }
    }

    fn touch(state: &mut CacheState, tenant: &TenantId) {
        state.order.retain(|existing| existing != tenant);
        state.order.push_back(tenant.clone());
    }

    fn remove_slot(state: &mut CacheState, tenant: &TenantId) -> bool {
        state.order.retain(|existing| existing != tenant);
        if state
            .gates
            .get(tenant)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            state.gates.remove(tenant);
        }
        let Some(slot) = state.slots.remove(tenant) else {
            return false;
        };
        slot.detach();
        slot.cell.initialized()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new(0)
    }
}
