//! Stock ledger service.
//!
//! Every write follows the same cycle:
//!
//! ```text
//! lock (tenant, material)
//!   ↓
//! load current MaterialStock (or an empty one)
//!   ↓
//! aggregate.handle(command)  -> events   (validation happens here)
//!   ↓
//! commit new state + movement [+ history] conditionally on the loaded version
//!   ↓
//! best-effort history (if not atomic), then publish events
//! ```
//!
//! Audit rows get `recorded_at` from the ledger clock; the request's
//! `occurred_at` is kept alongside as business time.
//!
//! Nothing is written before `handle` succeeds, so rejected requests leave the
//! store untouched. A stale version at commit time is returned as
//! `ConcurrencyConflict`; the ledger never retries on its own.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, ExpectedVersion, LedgerContext, MovementId, TenantId,
};
use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::{
    AGGREGATE_TYPE, ConsumeStock, HistoryEntry, InventoryCommand, InventoryEvent, MaterialId,
    MaterialStock, ReceiveStock, RegisterMaterial, StockMovement, inventory_value,
};

use crate::config::{HistoryMode, LedgerConfig};
use crate::locks::{MaterialLocks, acquire};
use crate::store::{ConsumptionWrite, ReceiptWrite, StockStore, StoreError};

/// Errors returned by [`StockLedger`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("material {0} not found")]
    NotFound(MaterialId),

    #[error("material {0} already exists")]
    AlreadyExists(MaterialId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient stock (available: {available}, requested: {requested})")]
    InsufficientStock {
        available: Decimal,
        requested: Decimal,
    },

    /// The material changed between read and commit. Safe to retry.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }

    fn from_domain(material_id: MaterialId, err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvariantViolation(msg)
            | DomainError::InvalidId(msg) => LedgerError::InvalidArgument(msg),
            DomainError::NotFound => LedgerError::NotFound(material_id),
            DomainError::Conflict(_) => LedgerError::AlreadyExists(material_id),
            DomainError::InsufficientStock {
                available,
                requested,
            } => LedgerError::InsufficientStock {
                available,
                requested,
            },
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) => LedgerError::ConcurrencyConflict(msg),
            other => LedgerError::StorageFailure(other.to_string()),
        }
    }
}

/// Result of a committed receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptOutcome {
    pub material: MaterialStock,
    pub movement: StockMovement,
}

/// Tenant-wide valuation snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValuationSummary {
    pub total_items: usize,
    pub below_minimum: usize,
    pub total_quantity: Decimal,
    /// Σ quantity × unit_cost at the configured cost scale.
    pub total_value: Decimal,
}

/// Running quantity and weighted-average cost per material.
#[derive(Debug)]
pub struct StockLedger<S, B> {
    store: S,
    bus: B,
    config: LedgerConfig,
    locks: MaterialLocks,
}

impl<S, B> StockLedger<S, B> {
    pub fn new(store: S, bus: B, config: LedgerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            locks: MaterialLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

impl<S, B> StockLedger<S, B>
where
    S: StockStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Create a material at quantity 0, cost 0, version 1.
    #[instrument(
        skip(self, ctx, request),
        fields(tenant_id = %ctx.tenant_id, material_id = %request.material_id),
        err
    )]
    pub fn register_material(
        &self,
        ctx: &LedgerContext,
        request: RegisterMaterial,
    ) -> Result<MaterialStock, LedgerError> {
        let material_id = request.material_id;
        let lock = self.locks.lock_for(ctx.tenant_id, material_id);
        let _guard = acquire(&lock);

        let current = self.load_or_empty(ctx.tenant_id, material_id)?;
        let events = current
            .handle(&InventoryCommand::Register {
                tenant_id: ctx.tenant_id,
                registered_by: ctx.user_id,
                request,
            })
            .map_err(|e| LedgerError::from_domain(material_id, e))?;
        let next = current.evolve(&events);
        let recorded_at = Utc::now();

        let history = events.iter().find_map(|e| match e {
            InventoryEvent::MaterialRegistered(registered) => {
                Some(HistoryEntry::registration(registered, recorded_at))
            }
            _ => None,
        });
        let atomic = self.config.history_mode == HistoryMode::Atomic;

        self.store
            .insert_material(
                ctx.tenant_id,
                &next,
                history.as_ref().filter(|_| atomic),
            )
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => LedgerError::AlreadyExists(material_id),
                other => other.into(),
            })?;

        if !atomic {
            self.append_history_best_effort(ctx.tenant_id, history.as_ref());
        }
        info!(material_name = next.name(), unit = next.unit(), "material registered");

        self.publish(ctx.tenant_id, material_id, current.version(), &events);
        Ok(next)
    }

    /// Fold an inbound receipt into the weighted-average cost.
    #[instrument(
        skip(self, ctx, request),
        fields(
            tenant_id = %ctx.tenant_id,
            material_id = %request.material_id,
            quantity_received = %request.quantity_received,
            total_cost = %request.total_cost
        ),
        err
    )]
    pub fn receive_stock(
        &self,
        ctx: &LedgerContext,
        request: ReceiveStock,
    ) -> Result<ReceiptOutcome, LedgerError> {
        let material_id = request.material_id;
        let lock = self.locks.lock_for(ctx.tenant_id, material_id);
        let _guard = acquire(&lock);

        let current = self.load_or_empty(ctx.tenant_id, material_id)?;
        let events = current
            .handle(&InventoryCommand::Receive {
                tenant_id: ctx.tenant_id,
                recorded_by: ctx.user_id,
                movement_id: MovementId::new(),
                policy: self.config.valuation_policy(),
                request,
            })
            .map_err(|e| LedgerError::from_domain(material_id, e))?;
        let next = current.evolve(&events);
        let recorded_at = Utc::now();

        let Some(received) = events.iter().find_map(|e| match e {
            InventoryEvent::StockReceived(received) => Some(received),
            _ => None,
        }) else {
            return Err(LedgerError::InvalidArgument(
                "receipt produced no stock movement".to_string(),
            ));
        };
        let history = HistoryEntry::receipt(received, recorded_at);
        let atomic = self.config.history_mode == HistoryMode::Atomic;

        let movement = self
            .store
            .commit_receipt(
                ctx.tenant_id,
                ReceiptWrite {
                    material: next.clone(),
                    expected_version: ExpectedVersion::Exact(current.version()),
                    movement: StockMovement::record(received, recorded_at),
                    history: atomic.then(|| history.clone()),
                },
            )
            .map_err(|e| self.commit_failed(material_id, e))?;

        if !atomic {
            self.append_history_best_effort(ctx.tenant_id, Some(&history));
        }
        info!(
            movement_id = %movement.id,
            quantity_on_hand = %next.quantity_on_hand(),
            unit_cost = %next.unit_cost(),
            version = next.version(),
            "stock received"
        );

        self.publish(ctx.tenant_id, material_id, current.version(), &events);
        Ok(ReceiptOutcome {
            material: next,
            movement,
        })
    }

    /// Take stock out for production. Unit cost is left as is.
    #[instrument(
        skip(self, ctx, request),
        fields(
            tenant_id = %ctx.tenant_id,
            material_id = %request.material_id,
            quantity = %request.quantity
        ),
        err
    )]
    pub fn consume_stock(
        &self,
        ctx: &LedgerContext,
        request: ConsumeStock,
    ) -> Result<MaterialStock, LedgerError> {
        let material_id = request.material_id;
        let lock = self.locks.lock_for(ctx.tenant_id, material_id);
        let _guard = acquire(&lock);

        let current = self.load_or_empty(ctx.tenant_id, material_id)?;
        let events = current
            .handle(&InventoryCommand::Consume {
                tenant_id: ctx.tenant_id,
                recorded_by: ctx.user_id,
                request,
            })
            .map_err(|e| LedgerError::from_domain(material_id, e))?;
        let next = current.evolve(&events);
        let recorded_at = Utc::now();

        let history = events.iter().find_map(|e| match e {
            InventoryEvent::StockConsumed(consumed) => {
                Some(HistoryEntry::consumption(consumed, recorded_at))
            }
            _ => None,
        });
        let atomic = self.config.history_mode == HistoryMode::Atomic;

        self.store
            .commit_consumption(
                ctx.tenant_id,
                ConsumptionWrite {
                    material: next.clone(),
                    expected_version: ExpectedVersion::Exact(current.version()),
                    history: history.clone().filter(|_| atomic),
                },
            )
            .map_err(|e| self.commit_failed(material_id, e))?;

        if !atomic {
            self.append_history_best_effort(ctx.tenant_id, history.as_ref());
        }
        info!(
            quantity_on_hand = %next.quantity_on_hand(),
            below_minimum = next.is_below_safety_minimum(),
            version = next.version(),
            "stock consumed"
        );

        self.publish(ctx.tenant_id, material_id, current.version(), &events);
        Ok(next)
    }

    pub fn get_material(
        &self,
        ctx: &LedgerContext,
        material_id: MaterialId,
    ) -> Result<MaterialStock, LedgerError> {
        self.store
            .get_material(ctx.tenant_id, material_id)?
            .ok_or(LedgerError::NotFound(material_id))
    }

    /// All materials of the caller's tenant, ordered by name.
    pub fn list_materials(&self, ctx: &LedgerContext) -> Result<Vec<MaterialStock>, LedgerError> {
        Ok(self.store.list_materials(ctx.tenant_id)?)
    }

    /// Receipts for one material, oldest first.
    pub fn movements(
        &self,
        ctx: &LedgerContext,
        material_id: MaterialId,
    ) -> Result<Vec<StockMovement>, LedgerError> {
        self.get_material(ctx, material_id)?;
        Ok(self.store.list_movements(ctx.tenant_id, material_id)?)
    }

    /// Activity feed for one material, oldest first.
    pub fn history(
        &self,
        ctx: &LedgerContext,
        material_id: MaterialId,
    ) -> Result<Vec<HistoryEntry>, LedgerError> {
        self.get_material(ctx, material_id)?;
        Ok(self.store.list_history(ctx.tenant_id, material_id)?)
    }

    /// Materials whose quantity on hand is below their safety minimum.
    pub fn low_stock(&self, ctx: &LedgerContext) -> Result<Vec<MaterialStock>, LedgerError> {
        Ok(self
            .store
            .list_materials(ctx.tenant_id)?
            .into_iter()
            .filter(MaterialStock::is_below_safety_minimum)
            .collect())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id), err)]
    pub fn valuation_summary(&self, ctx: &LedgerContext) -> Result<ValuationSummary, LedgerError> {
        let materials = self.store.list_materials(ctx.tenant_id)?;
        let overflow = || LedgerError::InvalidArgument("valuation overflowed decimal range".into());

        let mut summary = ValuationSummary {
            total_items: materials.len(),
            below_minimum: 0,
            total_quantity: Decimal::ZERO,
            total_value: Decimal::ZERO,
        };
        for m in &materials {
            if m.is_below_safety_minimum() {
                summary.below_minimum += 1;
            }
            let value = inventory_value(m.quantity_on_hand(), m.unit_cost(), self.config.cost_scale)
                .map_err(|e| LedgerError::from_domain(m.id_typed(), e))?;
            summary.total_quantity = summary
                .total_quantity
                .checked_add(m.quantity_on_hand())
                .ok_or_else(overflow)?;
            summary.total_value = summary.total_value.checked_add(value).ok_or_else(overflow)?;
        }

        Ok(summary)
    }

    fn load_or_empty(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<MaterialStock, LedgerError> {
        Ok(self
            .store
            .get_material(tenant_id, material_id)?
            .unwrap_or_else(|| MaterialStock::empty(material_id)))
    }

    fn commit_failed(&self, material_id: MaterialId, err: StoreError) -> LedgerError {
        if let StoreError::Concurrency(msg) = &err {
            debug!(%material_id, reason = %msg, "stale material version at commit");
        }
        err.into()
    }

    fn append_history_best_effort(&self, tenant_id: TenantId, entry: Option<&HistoryEntry>) {
        let Some(entry) = entry else { return };
        if let Err(e) = self.store.append_history(tenant_id, entry) {
            warn!(
                material_id = %entry.material_id,
                kind = entry.kind.as_str(),
                error = %e,
                "failed to write history entry"
            );
        }
    }

    /// Publish committed events. `base_version` is the version before they applied.
    fn publish(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
        base_version: u64,
        events: &[InventoryEvent],
    ) {
        for (offset, event) in (1u64..).zip(events) {
            let sequence = base_version + offset;
            let envelope = match EventEnvelope::from_event(
                tenant_id,
                material_id.0,
                AGGREGATE_TYPE,
                sequence,
                event,
            ) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%material_id, sequence, error = %e, "failed to serialize event");
                    continue;
                }
            };

            if let Err(e) = self.bus.publish(envelope) {
                warn!(%material_id, sequence, error = ?e, "failed to publish event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_ledger_errors() {
        let err: LedgerError = StoreError::Concurrency("v3 != v4".into()).into();
        assert!(err.is_retryable());

        let err: LedgerError = StoreError::Storage("connection reset".into()).into();
        assert_eq!(
            err,
            LedgerError::StorageFailure("storage error: connection reset".into())
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn domain_errors_map_to_ledger_errors() {
        let id = MaterialId::generate();
        assert_eq!(
            LedgerError::from_domain(id, DomainError::NotFound),
            LedgerError::NotFound(id)
        );
        assert_eq!(
            LedgerError::from_domain(id, DomainError::conflict("dup")),
            LedgerError::AlreadyExists(id)
        );
        assert!(matches!(
            LedgerError::from_domain(id, DomainError::validation("qty")),
            LedgerError::InvalidArgument(_)
        ));
    }
}
