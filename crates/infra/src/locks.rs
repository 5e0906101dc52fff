//! Per-material write serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use stockledger_core::TenantId;
use stockledger_inventory::MaterialId;

/// Floor for the prune watermark.
const PRUNE_THRESHOLD: usize = 1024;

type LockKey = (TenantId, MaterialId);

#[derive(Debug)]
struct LockTable {
    locks: HashMap<LockKey, Arc<Mutex<()>>>,
    /// Size at which the next prune runs. Doubles past the live set so a
    /// table full of held locks is not rescanned on every call.
    prune_at: usize,
}

impl Default for LockTable {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }
}

impl LockTable {
    fn prune(&mut self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.prune_at = PRUNE_THRESHOLD.max(self.locks.len() * 2);
    }
}

/// Keyed mutexes: one writer per `(tenant, material)` at a time.
///
/// Holds no data; the guard only orders read-modify-write cycles. Different
/// materials never contend.
#[derive(Debug, Default)]
pub struct MaterialLocks {
    inner: Mutex<LockTable>,
}

impl MaterialLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one material, created on first use.
    pub fn lock_for(&self, tenant_id: TenantId, material_id: MaterialId) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if table.locks.len() >= table.prune_at {
            table.prune();
        }
        table.locks.entry((tenant_id, material_id)).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|t| t.locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acquire a material lock. The mutex guards `()`, so a poisoned lock is safe to reuse.
pub fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}
