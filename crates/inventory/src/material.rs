use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, MovementId, TenantId, UserId,
};
use stockledger_events::Event;

use crate::valuation::{ValuationPolicy, weighted_average};

/// Aggregate type name used on published envelopes.
pub const AGGREGATE_TYPE: &str = "inventory.material";

/// Raw-material SKU identifier (tenant-scoped via `tenant_id` fields).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(pub AggregateId);

impl MaterialId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for MaterialId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: MaterialStock.
///
/// Holds the running quantity and weighted-average unit cost of one material.
/// `unit_cost` only moves on receipts; consumption changes quantity alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialStock {
    id: MaterialId,
    tenant_id: Option<TenantId>,
    name: String,
    unit: String,
    quantity_on_hand: Decimal,
    unit_cost: Decimal,
    safety_minimum: Decimal,
    version: u64,
    created: bool,
}

impl MaterialStock {
    /// A not-yet-registered material (target of `RegisterMaterial`).
    pub fn empty(id: MaterialId) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            unit: String::new(),
            quantity_on_hand: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            safety_minimum: Decimal::ZERO,
            version: 0,
            created: false,
        }
    }

    /// Rebuild a registered material from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: MaterialId,
        tenant_id: TenantId,
        name: String,
        unit: String,
        quantity_on_hand: Decimal,
        unit_cost: Decimal,
        safety_minimum: Decimal,
        version: u64,
    ) -> Self {
        Self {
            id,
            tenant_id: Some(tenant_id),
            name,
            unit,
            quantity_on_hand,
            unit_cost,
            safety_minimum,
            version,
            created: true,
        }
    }

    pub fn id_typed(&self) -> MaterialId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn quantity_on_hand(&self) -> Decimal {
        self.quantity_on_hand
    }

    pub fn unit_cost(&self) -> Decimal {
        self.unit_cost
    }

    pub fn safety_minimum(&self) -> Decimal {
        self.safety_minimum
    }

    pub fn is_registered(&self) -> bool {
        self.created
    }

    pub fn is_below_safety_minimum(&self) -> bool {
        self.created && self.quantity_on_hand < self.safety_minimum
    }
}

impl AggregateRoot for MaterialStock {
    type Id = MaterialId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterMaterial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMaterial {
    pub material_id: MaterialId,
    pub name: String,
    pub unit: String,
    pub safety_minimum: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveStock (inbound receipt from a supplier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub material_id: MaterialId,
    pub quantity_received: Decimal,
    /// Total monetary cost of this receipt, not the unit price.
    pub total_cost: Decimal,
    pub supplier: Option<String>,
    pub invoice_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConsumeStock (outbound production usage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeStock {
    pub material_id: MaterialId,
    pub quantity: Decimal,
    /// Work order, batch or free-text reason.
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Commands carry the caller identity and ledger policy alongside the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    Register {
        tenant_id: TenantId,
        registered_by: UserId,
        request: RegisterMaterial,
    },
    Receive {
        tenant_id: TenantId,
        recorded_by: UserId,
        movement_id: MovementId,
        policy: ValuationPolicy,
        request: ReceiveStock,
    },
    Consume {
        tenant_id: TenantId,
        recorded_by: UserId,
        request: ConsumeStock,
    },
}

/// Event: MaterialRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRegistered {
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub name: String,
    pub unit: String,
    pub safety_minimum: Decimal,
    pub registered_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReceived.
///
/// Carries the computed average so `apply` never recomputes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub movement_id: MovementId,
    pub quantity_received: Decimal,
    pub total_cost: Decimal,
    pub incoming_unit_cost: Decimal,
    pub quantity_after: Decimal,
    pub unit_cost_after: Decimal,
    pub supplier: Option<String>,
    pub invoice_reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockConsumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConsumed {
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub quantity: Decimal,
    pub quantity_after: Decimal,
    /// Average cost at the time of consumption (unchanged by it).
    pub unit_cost: Decimal,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockBelowSafetyMinimum (low-stock alert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBelowSafetyMinimum {
    pub tenant_id: TenantId,
    pub material_id: MaterialId,
    pub quantity_on_hand: Decimal,
    pub safety_minimum: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    MaterialRegistered(MaterialRegistered),
    StockReceived(StockReceived),
    StockConsumed(StockConsumed),
    StockBelowSafetyMinimum(StockBelowSafetyMinimum),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::MaterialRegistered(_) => "inventory.material.registered",
            InventoryEvent::StockReceived(_) => "inventory.material.stock_received",
            InventoryEvent::StockConsumed(_) => "inventory.material.stock_consumed",
            InventoryEvent::StockBelowSafetyMinimum(_) => "inventory.material.below_safety_minimum",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::MaterialRegistered(e) => e.occurred_at,
            InventoryEvent::StockReceived(e) => e.occurred_at,
            InventoryEvent::StockConsumed(e) => e.occurred_at,
            InventoryEvent::StockBelowSafetyMinimum(e) => e.occurred_at,
        }
    }
}

impl Aggregate for MaterialStock {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::MaterialRegistered(e) => {
                self.id = e.material_id;
                self.tenant_id = Some(e.tenant_id);
                self.name = e.name.clone();
                self.unit = e.unit.clone();
                self.safety_minimum = e.safety_minimum;
                self.quantity_on_hand = Decimal::ZERO;
                self.unit_cost = Decimal::ZERO;
                self.created = true;
            }
            InventoryEvent::StockReceived(e) => {
                self.quantity_on_hand = e.quantity_after;
                self.unit_cost = e.unit_cost_after;
            }
            InventoryEvent::StockConsumed(e) => {
                self.quantity_on_hand = e.quantity_after;
            }
            InventoryEvent::StockBelowSafetyMinimum(_) => {}
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::Register {
                tenant_id,
                registered_by,
                request,
            } => self.handle_register(*tenant_id, *registered_by, request),
            InventoryCommand::Receive {
                tenant_id,
                recorded_by,
                movement_id,
                policy,
                request,
            } => self.handle_receive(*tenant_id, *recorded_by, *movement_id, *policy, request),
            InventoryCommand::Consume {
                tenant_id,
                recorded_by,
                request,
            } => self.handle_consume(*tenant_id, *recorded_by, request),
        }
    }
}

impl MaterialStock {
    /// Apply a batch of freshly decided events, returning the new state.
    pub fn evolve(&self, events: &[InventoryEvent]) -> Self {
        let mut next = self.clone();
        for e in events {
            next.apply(e);
        }
        next
    }

    fn ensure_existing(&self, tenant_id: TenantId, material_id: MaterialId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != material_id {
            return Err(DomainError::invariant("material_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(
        &self,
        tenant_id: TenantId,
        registered_by: UserId,
        cmd: &RegisterMaterial,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("material already registered"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.safety_minimum < Decimal::ZERO {
            return Err(DomainError::validation("safety_minimum cannot be negative"));
        }

        Ok(vec![InventoryEvent::MaterialRegistered(MaterialRegistered {
            tenant_id,
            material_id: cmd.material_id,
            name: cmd.name.trim().to_string(),
            unit: cmd.unit.trim().to_string(),
            safety_minimum: cmd.safety_minimum,
            registered_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(
        &self,
        tenant_id: TenantId,
        recorded_by: UserId,
        movement_id: MovementId,
        policy: ValuationPolicy,
        cmd: &ReceiveStock,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        if cmd.quantity_received <= Decimal::ZERO {
            return Err(DomainError::validation("quantity_received must be positive"));
        }
        if cmd.total_cost < Decimal::ZERO {
            return Err(DomainError::validation("total_cost cannot be negative"));
        }
        if cmd.total_cost.is_zero() && !policy.allow_zero_cost {
            return Err(DomainError::validation("total_cost must be positive"));
        }
        self.ensure_existing(tenant_id, cmd.material_id)?;

        let avg = weighted_average(
            self.quantity_on_hand,
            self.unit_cost,
            cmd.quantity_received,
            cmd.total_cost,
            policy.cost_scale,
        )?;

        Ok(vec![InventoryEvent::StockReceived(StockReceived {
            tenant_id,
            material_id: cmd.material_id,
            movement_id,
            quantity_received: cmd.quantity_received,
            total_cost: cmd.total_cost,
            incoming_unit_cost: avg.incoming_unit_cost,
            quantity_after: avg.quantity_after,
            unit_cost_after: avg.unit_cost_after,
            supplier: cmd.supplier.clone(),
            invoice_reference: cmd.invoice_reference.clone(),
            recorded_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_consume(
        &self,
        tenant_id: TenantId,
        recorded_by: UserId,
        cmd: &ConsumeStock,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        if cmd.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity must be positive"));
        }
        self.ensure_existing(tenant_id, cmd.material_id)?;

        if cmd.quantity > self.quantity_on_hand {
            return Err(DomainError::InsufficientStock {
                available: self.quantity_on_hand,
                requested: cmd.quantity,
            });
        }

        let quantity_after = self.quantity_on_hand - cmd.quantity;
        let mut events = vec![InventoryEvent::StockConsumed(StockConsumed {
            tenant_id,
            material_id: cmd.material_id,
            quantity: cmd.quantity,
            quantity_after,
            unit_cost: self.unit_cost,
            reference: cmd.reference.clone(),
            recorded_by,
            occurred_at: cmd.occurred_at,
        })];

        if quantity_after < self.safety_minimum {
            events.push(InventoryEvent::StockBelowSafetyMinimum(StockBelowSafetyMinimum {
                tenant_id,
                material_id: cmd.material_id,
                quantity_on_hand: quantity_after,
                safety_minimum: self.safety_minimum,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }
}
