//! Postgres-backed stock store.
//!
//! Each `commit_*` runs in one database transaction. The material update is
//! `UPDATE ... WHERE version = $expected`; zero affected rows means another
//! writer got there first and the whole transaction is dropped (rolled back).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (serialization failure) | `40001` | `Concurrency` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | n/a | `Storage` |
//!
//! ## Runtime
//!
//! `StockStore` is synchronous. The trait impl bridges into async with
//! `block_in_place`, so it must be called from a multi-threaded tokio runtime.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{Span, instrument};

use stockledger_core::{
    AggregateId, AggregateRoot, ExpectedVersion, HistoryEntryId, MovementId, TenantId, UserId,
};
use stockledger_inventory::{HistoryEntry, HistoryKind, MaterialId, MaterialStock, StockMovement};

use super::r#trait::{ConsumptionWrite, ReceiptWrite, StockStore, StoreError, ensure_tenant};
use crate::config::LedgerConfig;

/// Postgres-backed stock store. Cheap to clone (shares the pool).
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Open a pool from `database_url` / `max_connections` in the ledger config.
    pub async fn from_config(config: &LedgerConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Storage("database_url is not configured".to_string()))?;
        Self::connect(url, config.max_connections).await
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    #[instrument(skip(self, material, history), fields(tenant_id = %tenant_id, material_id = %material.id_typed()), err)]
    pub async fn insert_material_async(
        &self,
        tenant_id: TenantId,
        material: &MaterialStock,
        history: Option<&HistoryEntry>,
    ) -> Result<(), StoreError> {
        ensure_tenant(tenant_id, material)?;

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO material_stock (
                tenant_id,
                material_id,
                name,
                unit,
                quantity_on_hand,
                unit_cost,
                safety_minimum,
                version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(material.id_typed().0.as_uuid())
        .bind(material.name())
        .bind(material.unit())
        .bind(material.quantity_on_hand())
        .bind(material.unit_cost())
        .bind(material.safety_minimum())
        .bind(material.version() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_material", e))?;

        if let Some(entry) = history {
            insert_history(&mut tx, tenant_id, entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, material_id = %material_id), err)]
    pub async fn get_material_async(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<MaterialStock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                tenant_id,
                material_id,
                name,
                unit,
                quantity_on_hand,
                unit_cost,
                safety_minimum,
                version
            FROM material_stock
            WHERE tenant_id = $1 AND material_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(material_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_material", e))?;

        row.as_ref().map(material_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, material_count = tracing::field::Empty), err)]
    pub async fn list_materials_async(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<MaterialStock>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                tenant_id,
                material_id,
                name,
                unit,
                quantity_on_hand,
                unit_cost,
                safety_minimum,
                version
            FROM material_stock
            WHERE tenant_id = $1
            ORDER BY name ASC, material_id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_materials", e))?;

        Span::current().record("material_count", rows.len());
        rows.iter().map(material_from_row).collect()
    }

    #[instrument(
        skip(self, write),
        fields(
            tenant_id = %tenant_id,
            material_id = %write.material.id_typed(),
            expected_version = ?write.expected_version
        ),
        err
    )]
    pub async fn commit_receipt_async(
        &self,
        tenant_id: TenantId,
        write: ReceiptWrite,
    ) -> Result<StockMovement, StoreError> {
        ensure_tenant(tenant_id, &write.material)?;
        if write.movement.tenant_id != tenant_id
            || write.movement.material_id != write.material.id_typed()
        {
            return Err(StoreError::TenantIsolation(
                "movement does not belong to the updated material".to_string(),
            ));
        }

        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self.begin().await?;
        update_material(&mut tx, tenant_id, &write.material, write.expected_version).await?;

        let m = &write.movement;
        sqlx::query(
            r#"
            INSERT INTO stock_movements (
                movement_id,
                tenant_id,
                material_id,
                quantity_received,
                total_cost,
                incoming_unit_cost,
                supplier,
                invoice_reference,
                recorded_by,
                occurred_at,
                recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(m.id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(m.material_id.0.as_uuid())
        .bind(m.quantity_received)
        .bind(m.total_cost)
        .bind(m.incoming_unit_cost)
        .bind(m.supplier.as_deref())
        .bind(m.invoice_reference.as_deref())
        .bind(m.recorded_by.as_uuid())
        .bind(m.occurred_at)
        .bind(m.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;

        if let Some(entry) = &write.history {
            insert_history(&mut tx, tenant_id, entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(write.movement)
    }

    #[instrument(
        skip(self, write),
        fields(
            tenant_id = %tenant_id,
            material_id = %write.material.id_typed(),
            expected_version = ?write.expected_version
        ),
        err
    )]
    pub async fn commit_consumption_async(
        &self,
        tenant_id: TenantId,
        write: ConsumptionWrite,
    ) -> Result<(), StoreError> {
        ensure_tenant(tenant_id, &write.material)?;

        let mut tx = self.begin().await?;
        update_material(&mut tx, tenant_id, &write.material, write.expected_version).await?;
        if let Some(entry) = &write.history {
            insert_history(&mut tx, tenant_id, entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn append_history_async(
        &self,
        tenant_id: TenantId,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        insert_history(&mut tx, tenant_id, entry).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub async fn list_movements_async(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                movement_id,
                tenant_id,
                material_id,
                quantity_received,
                total_cost,
                incoming_unit_cost,
                supplier,
                invoice_reference,
                recorded_by,
                occurred_at,
                recorded_at
            FROM stock_movements
            WHERE tenant_id = $1 AND material_id = $2
            ORDER BY recorded_at ASC, movement_id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(material_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_movements", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    pub async fn list_history_async(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                entry_id,
                tenant_id,
                material_id,
                kind,
                quantity_delta,
                quantity_after,
                unit_cost_after,
                summary,
                recorded_by,
                occurred_at,
                recorded_at
            FROM stock_history
            WHERE tenant_id = $1 AND material_id = $2
            ORDER BY recorded_at ASC, entry_id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(material_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_history", e))?;

        rows.iter().map(history_from_row).collect()
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    fn block_on<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        let handle = multi_thread_handle()?;
        tokio::task::block_in_place(|| handle.block_on(fut))
    }
}

/// The current runtime, if it can host `block_in_place`.
///
/// `block_in_place` panics on a current-thread runtime, so that case is an error here.
fn multi_thread_handle() -> Result<Handle, StoreError> {
    let unsupported =
        || StoreError::Storage("PostgresStockStore requires a multi-threaded tokio runtime".to_string());

    let handle = Handle::try_current().map_err(|_| unsupported())?;
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return Err(unsupported());
    }
    Ok(handle)
}

impl StockStore for PostgresStockStore {
    fn insert_material(
        &self,
        tenant_id: TenantId,
        material: &MaterialStock,
        history: Option<&HistoryEntry>,
    ) -> Result<(), StoreError> {
        self.block_on(self.insert_material_async(tenant_id, material, history))
    }

    fn get_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<MaterialStock>, StoreError> {
        self.block_on(self.get_material_async(tenant_id, material_id))
    }

    fn list_materials(&self, tenant_id: TenantId) -> Result<Vec<MaterialStock>, StoreError> {
        self.block_on(self.list_materials_async(tenant_id))
    }

    fn commit_receipt(
        &self,
        tenant_id: TenantId,
        write: ReceiptWrite,
    ) -> Result<StockMovement, StoreError> {
        self.block_on(self.commit_receipt_async(tenant_id, write))
    }

    fn commit_consumption(
        &self,
        tenant_id: TenantId,
        write: ConsumptionWrite,
    ) -> Result<(), StoreError> {
        self.block_on(self.commit_consumption_async(tenant_id, write))
    }

    fn append_history(&self, tenant_id: TenantId, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.block_on(self.append_history_async(tenant_id, entry))
    }

    fn list_movements(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, StoreError> {
        self.block_on(self.list_movements_async(tenant_id, material_id))
    }

    fn list_history(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.block_on(self.list_history_async(tenant_id, material_id))
    }
}

/// Conditional update: only succeeds if the stored version is still `expected`.
async fn update_material(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    material: &MaterialStock,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let expected_version: Option<i64> = match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    };

    let result = sqlx::query(
        r#"
        UPDATE material_stock
        SET
            quantity_on_hand = $3,
            unit_cost = $4,
            version = $5,
            updated_at = NOW()
        WHERE tenant_id = $1
          AND material_id = $2
          AND ($6::BIGINT IS NULL OR version = $6)
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(material.id_typed().0.as_uuid())
    .bind(material.quantity_on_hand())
    .bind(material.unit_cost())
    .bind(material.version() as i64)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_material", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Concurrency(format!(
            "material {} is no longer at {expected:?}",
            material.id_typed()
        )));
    }
    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    entry: &HistoryEntry,
) -> Result<(), StoreError> {
    if entry.tenant_id != tenant_id {
        return Err(StoreError::TenantIsolation(
            "history entry tenant_id does not match".to_string(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO stock_history (
            entry_id,
            tenant_id,
            material_id,
            kind,
            quantity_delta,
            quantity_after,
            unit_cost_after,
            summary,
            recorded_by,
            occurred_at,
            recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(tenant_id.as_uuid())
    .bind(entry.material_id.0.as_uuid())
    .bind(entry.kind.as_str())
    .bind(entry.quantity_delta)
    .bind(entry.quantity_after)
    .bind(entry.unit_cost_after)
    .bind(&entry.summary)
    .bind(entry.recorded_by.as_uuid())
    .bind(entry.occurred_at)
    .bind(entry.recorded_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;

    Ok(())
}

fn material_from_row(row: &PgRow) -> Result<MaterialStock, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode material row: {e}"));

    let tenant_id: uuid::Uuid = row.try_get("tenant_id").map_err(decode)?;
    let material_id: uuid::Uuid = row.try_get("material_id").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(MaterialStock::restore(
        MaterialId(AggregateId::from_uuid(material_id)),
        TenantId::from_uuid(tenant_id),
        row.try_get("name").map_err(decode)?,
        row.try_get("unit").map_err(decode)?,
        row.try_get::<Decimal, _>("quantity_on_hand").map_err(decode)?,
        row.try_get::<Decimal, _>("unit_cost").map_err(decode)?,
        row.try_get::<Decimal, _>("safety_minimum").map_err(decode)?,
        version as u64,
    ))
}

fn movement_from_row(row: &PgRow) -> Result<StockMovement, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode movement row: {e}"));

    Ok(StockMovement {
        id: MovementId::from_uuid(row.try_get("movement_id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        material_id: MaterialId(AggregateId::from_uuid(
            row.try_get("material_id").map_err(decode)?,
        )),
        quantity_received: row.try_get("quantity_received").map_err(decode)?,
        total_cost: row.try_get("total_cost").map_err(decode)?,
        incoming_unit_cost: row.try_get("incoming_unit_cost").map_err(decode)?,
        supplier: row.try_get("supplier").map_err(decode)?,
        invoice_reference: row.try_get("invoice_reference").map_err(decode)?,
        recorded_by: UserId::from_uuid(row.try_get("recorded_by").map_err(decode)?),
        occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at").map_err(decode)?,
        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at").map_err(decode)?,
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode history row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let kind = HistoryKind::parse(&kind)
        .ok_or_else(|| StoreError::Storage(format!("unknown history kind '{kind}'")))?;

    Ok(HistoryEntry {
        id: HistoryEntryId::from_uuid(row.try_get("entry_id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        material_id: MaterialId(AggregateId::from_uuid(
            row.try_get("material_id").map_err(decode)?,
        )),
        kind,
        quantity_delta: row.try_get("quantity_delta").map_err(decode)?,
        quantity_after: row.try_get("quantity_after").map_err(decode)?,
        unit_cost_after: row.try_get("unit_cost_after").map_err(decode)?,
        summary: row.try_get("summary").map_err(decode)?,
        recorded_by: UserId::from_uuid(row.try_get("recorded_by").map_err(decode)?),
        occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at").map_err(decode)?,
        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("40001") => StoreError::Concurrency(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
