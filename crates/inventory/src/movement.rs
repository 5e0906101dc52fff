//! Audit rows written alongside stock changes.
//!
//! `StockMovement` is the authoritative, append-only record of a receipt.
//! `HistoryEntry` is a display aid for the material's activity feed.
//!
//! `occurred_at` is the caller's business time and may be backdated.
//! `recorded_at` is stamped by the writer and orders the audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{HistoryEntryId, MovementId, TenantId, UserId};

use crate::material::{MaterialId, MaterialRegistered, StockConsumed, StockReceived};

/// One inbound receipt. Never updated or deleted once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub quantity_received: Decimal,
    pub total_cost: Decimal,
    pub incoming_unit_cost: Decimal,
    pub supplier: Option<String>,
    pub invoice_reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn record(e: &StockReceived, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: e.movement_id,
            tenant_id: e.tenant_id,
            material_id: e.material_id,
            quantity_received: e.quantity_received,
            total_cost: e.total_cost,
            incoming_unit_cost: e.incoming_unit_cost,
            supplier: e.supplier.clone(),
            invoice_reference: e.invoice_reference.clone(),
            recorded_by: e.recorded_by,
            occurred_at: e.occurred_at,
            recorded_at,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Registration,
    Receipt,
    Consumption,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Registration => "registration",
            HistoryKind::Receipt => "receipt",
            HistoryKind::Consumption => "consumption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(HistoryKind::Registration),
            "receipt" => Some(HistoryKind::Receipt),
            "consumption" => Some(HistoryKind::Consumption),
            _ => None,
        }
    }
}

/// Display-only line in a material's activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub kind: HistoryKind,
    /// Signed change in quantity (negative for consumption).
    pub quantity_delta: Decimal,
    pub quantity_after: Decimal,
    pub unit_cost_after: Decimal,
    pub summary: String,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn registration(e: &MaterialRegistered, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: HistoryEntryId::new(),
            tenant_id: e.tenant_id,
            material_id: e.material_id,
            kind: HistoryKind::Registration,
            quantity_delta: Decimal::ZERO,
            quantity_after: Decimal::ZERO,
            unit_cost_after: Decimal::ZERO,
            summary: format!("Registered {}", e.name),
            recorded_by: e.registered_by,
            occurred_at: e.occurred_at,
            recorded_at,
        }
    }

    pub fn receipt(e: &StockReceived, recorded_at: DateTime<Utc>) -> Self {
        let mut summary = format!("Received {} at {}", e.quantity_received, e.incoming_unit_cost);
        if let Some(supplier) = &e.supplier {
            summary.push_str(&format!(" from {supplier}"));
        }
        if let Some(invoice) = &e.invoice_reference {
            summary.push_str(&format!(" (invoice {invoice})"));
        }

        Self {
            id: HistoryEntryId::new(),
            tenant_id: e.tenant_id,
            material_id: e.material_id,
            kind: HistoryKind::Receipt,
            quantity_delta: e.quantity_received,
            quantity_after: e.quantity_after,
            unit_cost_after: e.unit_cost_after,
            summary,
            recorded_by: e.recorded_by,
            occurred_at: e.occurred_at,
            recorded_at,
        }
    }

    pub fn consumption(e: &StockConsumed, recorded_at: DateTime<Utc>) -> Self {
        let summary = match &e.reference {
            Some(reference) => format!("Consumed {} for {reference}", e.quantity),
            None => format!("Consumed {}", e.quantity),
        };

        Self {
            id: HistoryEntryId::new(),
            tenant_id: e.tenant_id,
            material_id: e.material_id,
            kind: HistoryKind::Consumption,
            quantity_delta: -e.quantity,
            quantity_after: e.quantity_after,
            unit_cost_after: e.unit_cost,
            summary,
            recorded_by: e.recorded_by,
            occurred_at: e.occurred_at,
            recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn receipt_history_mentions_supplier_and_invoice() {
        let e = StockReceived {
            tenant_id: TenantId::new(),
            material_id: MaterialId::generate(),
            movement_id: MovementId::new(),
            quantity_received: dec!(100),
            total_cost: dec!(2000),
            incoming_unit_cost: dec!(20),
            quantity_after: dec!(200),
            unit_cost_after: dec!(15),
            supplier: Some("Aceros del Norte".to_string()),
            invoice_reference: Some("A-42".to_string()),
            recorded_by: UserId::new(),
            occurred_at: Utc::now(),
        };

        let movement = StockMovement::record(&e, Utc::now());
        assert_eq!(movement.id, e.movement_id);
        assert_eq!(movement.total_cost, dec!(2000));

        let entry = HistoryEntry::receipt(&e, Utc::now());
        assert_eq!(entry.kind, HistoryKind::Receipt);
        assert_eq!(entry.summary, "Received 100 at 20 from Aceros del Norte (invoice A-42)");
    }

    #[test]
    fn consumption_history_is_negative() {
        let e = StockConsumed {
            tenant_id: TenantId::new(),
            material_id: MaterialId::generate(),
            quantity: dec!(7.5),
            quantity_after: dec!(2.5),
            unit_cost: dec!(3),
            reference: None,
            recorded_by: UserId::new(),
            occurred_at: Utc::now(),
        };

        let entry = HistoryEntry::consumption(&e, Utc::now());
        assert_eq!(entry.quantity_delta, dec!(-7.5));
        assert_eq!(entry.summary, "Consumed 7.5");
    }

    #[test]
    fn backdated_receipt_keeps_business_time_apart_from_recorded_time() {
        let backdated = DateTime::parse_from_rfc3339("2001-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let e = StockReceived {
            tenant_id: TenantId::new(),
            material_id: MaterialId::generate(),
            movement_id: MovementId::new(),
            quantity_received: dec!(10),
            total_cost: dec!(100),
            incoming_unit_cost: dec!(10),
            quantity_after: dec!(10),
            unit_cost_after: dec!(10),
            supplier: None,
            invoice_reference: None,
            recorded_by: UserId::new(),
            occurred_at: backdated,
        };
        let now = Utc::now();

        let movement = StockMovement::record(&e, now);
        assert_eq!(movement.occurred_at, backdated);
        assert_eq!(movement.recorded_at, now);

        let entry = HistoryEntry::receipt(&e, now);
        assert_eq!(entry.occurred_at, backdated);
        assert_eq!(entry.recorded_at, now);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [HistoryKind::Registration, HistoryKind::Receipt, HistoryKind::Consumption] {
            assert_eq!(HistoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(HistoryKind::parse("adjustment"), None);
    }
}
