use std::sync::Arc;

use thiserror::Error;

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_inventory::{HistoryEntry, MaterialId, MaterialStock, StockMovement};

/// Everything a receipt persists, committed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptWrite {
    /// State after the receipt (already carries its new version).
    pub material: MaterialStock,
    /// Version the stored row must still be at.
    pub expected_version: ExpectedVersion,
    pub movement: StockMovement,
    /// Included only when history is written inside the transaction.
    pub history: Option<HistoryEntry>,
}

/// Everything a consumption persists, committed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionWrite {
    pub material: MaterialStock,
    pub expected_version: ExpectedVersion,
    pub history: Option<HistoryEntry>,
}

/// Storage operation error.
///
/// Infrastructure failures, as opposed to domain errors (validation, invariants).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The stored row moved on since it was read (lost update prevented).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Anything else the backend reports (connection, constraint, IO).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Tenant-scoped persistence port for the stock ledger.
///
/// `commit_*` calls are all-or-nothing: the material update, the movement row
/// and (when supplied) the history row land together or not at all. Updates
/// are conditional on `expected_version`; a mismatch is `StoreError::Concurrency`.
pub trait StockStore: Send + Sync {
    /// Insert a newly registered material. Fails with `AlreadyExists` on a duplicate id.
    fn insert_material(
        &self,
        tenant_id: TenantId,
        material: &MaterialStock,
        history: Option<&HistoryEntry>,
    ) -> Result<(), StoreError>;

    fn get_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<MaterialStock>, StoreError>;

    fn list_materials(&self, tenant_id: TenantId) -> Result<Vec<MaterialStock>, StoreError>;

    /// Conditionally update the material and append the movement. Returns the stored movement.
    fn commit_receipt(
        &self,
        tenant_id: TenantId,
        write: ReceiptWrite,
    ) -> Result<StockMovement, StoreError>;

    fn commit_consumption(
        &self,
        tenant_id: TenantId,
        write: ConsumptionWrite,
    ) -> Result<(), StoreError>;

    /// Append a display-only history row outside any transaction.
    fn append_history(&self, tenant_id: TenantId, entry: &HistoryEntry) -> Result<(), StoreError>;

    /// Movements for a material, oldest first.
    fn list_movements(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, StoreError>;

    /// History rows for a material, oldest first.
    fn list_history(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}

impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    fn insert_material(
        &self,
        tenant_id: TenantId,
        material: &MaterialStock,
        history: Option<&HistoryEntry>,
    ) -> Result<(), StoreError> {
        (**self).insert_material(tenant_id, material, history)
    }

    fn get_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<MaterialStock>, StoreError> {
        (**self).get_material(tenant_id, material_id)
    }

    fn list_materials(&self, tenant_id: TenantId) -> Result<Vec<MaterialStock>, StoreError> {
        (**self).list_materials(tenant_id)
    }

    fn commit_receipt(
        &self,
        tenant_id: TenantId,
        write: ReceiptWrite,
    ) -> Result<StockMovement, StoreError> {
        (**self).commit_receipt(tenant_id, write)
    }

    fn commit_consumption(
        &self,
        tenant_id: TenantId,
        write: ConsumptionWrite,
    ) -> Result<(), StoreError> {
        (**self).commit_consumption(tenant_id, write)
    }

    fn append_history(&self, tenant_id: TenantId, entry: &HistoryEntry) -> Result<(), StoreError> {
        (**self).append_history(tenant_id, entry)
    }

    fn list_movements(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        (**self).list_movements(tenant_id, material_id)
    }

    fn list_history(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        (**self).list_history(tenant_id, material_id)
    }
}

/// Reject writes whose payload belongs to another tenant.
pub(crate) fn ensure_tenant(
    tenant_id: TenantId,
    material: &MaterialStock,
) -> Result<(), StoreError> {
    if material.tenant_id() != Some(tenant_id) {
        return Err(StoreError::TenantIsolation(format!(
            "material {} does not belong to tenant {tenant_id}",
            material.id_typed()
        )));
    }
    Ok(())
}
