//! Raw-material stock domain (weighted-average costing).
//!
//! This crate contains business rules for material stock, implemented purely as
//! deterministic domain logic (no IO, no storage).

pub mod material;
pub mod movement;
pub mod valuation;

pub use material::{
    ConsumeStock, InventoryCommand, InventoryEvent, MaterialId, MaterialRegistered, MaterialStock,
    ReceiveStock, RegisterMaterial, StockBelowSafetyMinimum, StockConsumed, StockReceived,
    AGGREGATE_TYPE,
};
pub use movement::{HistoryEntry, HistoryKind, StockMovement};
pub use valuation::{ValuationPolicy, WeightedAverage, inventory_value, round_cost, weighted_average};
