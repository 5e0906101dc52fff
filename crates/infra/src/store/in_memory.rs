use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use stockledger_core::{AggregateRoot, ExpectedVersion, TenantId};
use stockledger_inventory::{HistoryEntry, MaterialId, MaterialStock, StockMovement};

use super::r#trait::{
    ConsumptionWrite, ReceiptWrite, StockStore, StoreError, ensure_tenant,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct MaterialKey {
    tenant_id: TenantId,
    material_id: MaterialId,
}

#[derive(Debug, Default)]
struct State {
    materials: HashMap<MaterialKey, MaterialStock>,
    movements: Vec<StockMovement>,
    history: Vec<HistoryEntry>,
}

/// In-memory stock store.
///
/// Intended for tests/dev. A single lock guards all three tables, which is
/// what makes each `commit_*` atomic.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    state: RwLock<State>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    /// Validate a conditional update without mutating anything.
    fn check_update(
        state: &State,
        tenant_id: TenantId,
        material: &MaterialStock,
        expected_version: ExpectedVersion,
    ) -> Result<MaterialKey, StoreError> {
        ensure_tenant(tenant_id, material)?;

        let key = MaterialKey {
            tenant_id,
            material_id: material.id_typed(),
        };
        let current = state.materials.get(&key).ok_or_else(|| {
            StoreError::Storage(format!("material {} vanished before update", key.material_id))
        })?;

        if !expected_version.matches(current.version()) {
            return Err(StoreError::Concurrency(format!(
                "expected {expected_version:?}, found {}",
                current.version()
            )));
        }
        if material.version() <= current.version() {
            return Err(StoreError::Storage(format!(
                "update must advance version (stored {}, new {})",
                current.version(),
                material.version()
            )));
        }

        Ok(key)
    }

    fn check_history(
        state: &State,
        tenant_id: TenantId,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        if entry.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation(
                "history entry tenant_id does not match".to_string(),
            ));
        }
        if state.history.iter().any(|h| h.id == entry.id) {
            return Err(StoreError::AlreadyExists(format!("history entry {}", entry.id)));
        }
        Ok(())
    }
}

impl StockStore for InMemoryStockStore {
    fn insert_material(
        &self,
        tenant_id: TenantId,
        material: &MaterialStock,
        history: Option<&HistoryEntry>,
    ) -> Result<(), StoreError> {
        ensure_tenant(tenant_id, material)?;

        let mut state = self.write()?;
        let key = MaterialKey {
            tenant_id,
            material_id: material.id_typed(),
        };
        if state.materials.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("material {}", key.material_id)));
        }
        if let Some(entry) = history {
            Self::check_history(&state, tenant_id, entry)?;
        }

        state.materials.insert(key, material.clone());
        if let Some(entry) = history {
            state.history.push(entry.clone());
        }
        Ok(())
    }

    fn get_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<MaterialStock>, StoreError> {
        let state = self.read()?;
        Ok(state
            .materials
            .get(&MaterialKey {
                tenant_id,
                material_id,
            })
            .cloned())
    }

    fn list_materials(&self, tenant_id: TenantId) -> Result<Vec<MaterialStock>, StoreError> {
        let state = self.read()?;
        let mut materials: Vec<MaterialStock> = state
            .materials
            .iter()
            .filter(|(k, _)| k.tenant_id == tenant_id)
            .map(|(_, m)| m.clone())
            .collect();
        materials.sort_by(|a, b| a.name().cmp(b.name()).then(a.id_typed().cmp(&b.id_typed())));
        Ok(materials)
    }

    fn commit_receipt(
        &self,
        tenant_id: TenantId,
        write: ReceiptWrite,
    ) -> Result<StockMovement, StoreError> {
        let mut state = self.write()?;

        // Validate everything first; mutate only once nothing can fail.
        let key = Self::check_update(&state, tenant_id, &write.material, write.expected_version)?;
        if write.movement.tenant_id != tenant_id || write.movement.material_id != key.material_id {
            return Err(StoreError::TenantIsolation(
                "movement does not belong to the updated material".to_string(),
            ));
        }
        if state.movements.iter().any(|m| m.id == write.movement.id) {
            return Err(StoreError::AlreadyExists(format!("movement {}", write.movement.id)));
        }
        if let Some(entry) = &write.history {
            Self::check_history(&state, tenant_id, entry)?;
        }

        state.materials.insert(key, write.material);
        state.movements.push(write.movement.clone());
        if let Some(entry) = write.history {
            state.history.push(entry);
        }
        Ok(write.movement)
    }

    fn commit_consumption(
        &self,
        tenant_id: TenantId,
        write: ConsumptionWrite,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;

        let key = Self::check_update(&state, tenant_id, &write.material, write.expected_version)?;
        if let Some(entry) = &write.history {
            Self::check_history(&state, tenant_id, entry)?;
        }

        state.materials.insert(key, write.material);
        if let Some(entry) = write.history {
            state.history.push(entry);
        }
        Ok(())
    }

    fn append_history(&self, tenant_id: TenantId, entry: &HistoryEntry) -> Result<(), StoreError> {
        let mut state = self.write()?;
        Self::check_history(&state, tenant_id, entry)?;
        state.history.push(entry.clone());
        Ok(())
    }

    fn list_movements(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.material_id == material_id)
            .cloned()
            .collect())
    }

    fn list_history(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.read()?;
        Ok(state
            .history
            .iter()
            .filter(|h| h.tenant_id == tenant_id && h.material_id == material_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stockledger_core::{MovementId, UserId};

    fn material(tenant_id: TenantId, version: u64) -> MaterialStock {
        MaterialStock::restore(
            MaterialId::generate(),
            tenant_id,
            "Copper wire".to_string(),
            "m".to_string(),
            dec!(0),
            dec!(0),
            dec!(10),
            version,
        )
    }

    fn movement(tenant_id: TenantId, material_id: MaterialId) -> StockMovement {
        StockMovement {
            id: MovementId::new(),
            tenant_id,
            material_id,
            quantity_received: dec!(5),
            total_cost: dec!(50),
            incoming_unit_cost: dec!(10),
            supplier: None,
            invoice_reference: None,
            recorded_by: UserId::new(),
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
        }
    }

    fn advanced(m: &MaterialStock, qty: rust_decimal::Decimal, cost: rust_decimal::Decimal) -> MaterialStock {
        MaterialStock::restore(
            m.id_typed(),
            m.tenant_id().unwrap(),
            m.name().to_string(),
            m.unit().to_string(),
            qty,
            cost,
            m.safety_minimum(),
            m.version() + 1,
        )
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let store = InMemoryStockStore::new();
        let tenant_id = TenantId::new();
        let m = material(tenant_id, 1);

        store.insert_material(tenant_id, &m, None).unwrap();
        let err = store.insert_material(tenant_id, &m, None).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn stale_version_writes_nothing() {
        let store = InMemoryStockStore::new();
        let tenant_id = TenantId::new();
        let m = material(tenant_id, 1);
        store.insert_material(tenant_id, &m, None).unwrap();

        let err = store
            .commit_receipt(
                tenant_id,
                ReceiptWrite {
                    material: advanced(&m, dec!(5), dec!(10)),
                    expected_version: ExpectedVersion::Exact(7),
                    movement: movement(tenant_id, m.id_typed()),
                    history: None,
                },
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::Concurrency(_)));
        assert_eq!(store.get_material(tenant_id, m.id_typed()).unwrap(), Some(m.clone()));
        assert!(store.list_movements(tenant_id, m.id_typed()).unwrap().is_empty());
    }

    #[test]
    fn receipt_commits_update_and_movement_together() {
        let store = InMemoryStockStore::new();
        let tenant_id = TenantId::new();
        let m = material(tenant_id, 1);
        store.insert_material(tenant_id, &m, None).unwrap();

        let mv = movement(tenant_id, m.id_typed());
        let stored = store
            .commit_receipt(
                tenant_id,
                ReceiptWrite {
                    material: advanced(&m, dec!(5), dec!(10)),
                    expected_version: ExpectedVersion::Exact(1),
                    movement: mv.clone(),
                    history: None,
                },
            )
            .unwrap();

        assert_eq!(stored, mv);
        let current = store.get_material(tenant_id, m.id_typed()).unwrap().unwrap();
        assert_eq!(current.quantity_on_hand(), dec!(5));
        assert_eq!(current.version(), 2);
        assert_eq!(store.list_movements(tenant_id, m.id_typed()).unwrap(), vec![mv]);
    }

    #[test]
    fn tenants_do_not_see_each_other() {
        let store = InMemoryStockStore::new();
        let a = TenantId::new();
        let b = TenantId::new();
        let m = material(a, 1);
        store.insert_material(a, &m, None).unwrap();

        assert_eq!(store.get_material(b, m.id_typed()).unwrap(), None);
        assert!(store.list_materials(b).unwrap().is_empty());
        assert!(matches!(
            store.insert_material(b, &m, None),
            Err(StoreError::TenantIsolation(_))
        ));
    }
}
