//! Weighted-average cost arithmetic.
//!
//! Quantities stay exact. Costs are rounded to the policy's scale with
//! midpoint-away-from-zero, which is what invoices and price lists use.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use stockledger_core::DomainError;

/// Knobs the receipt rule needs from configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationPolicy {
    /// Decimal places kept for unit cost and inventory value.
    pub cost_scale: u32,
    /// Accept receipts with `total_cost == 0` (samples, free replacements).
    pub allow_zero_cost: bool,
}

impl Default for ValuationPolicy {
    fn default() -> Self {
        Self {
            cost_scale: 2,
            allow_zero_cost: false,
        }
    }
}

/// Result of folding one receipt into a material's running average.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedAverage {
    /// `total_cost / quantity_received`, rounded to the cost scale.
    pub incoming_unit_cost: Decimal,
    pub quantity_after: Decimal,
    /// `old_qty * old_cost + total_cost`, unrounded.
    pub total_value_after: Decimal,
    pub unit_cost_after: Decimal,
}

pub fn round_cost(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Fold a receipt of `quantity_received` units costing `total_cost` in total
/// into a position of `quantity_on_hand` units at `unit_cost`.
///
/// Callers validate signs; this only guards the arithmetic.
pub fn weighted_average(
    quantity_on_hand: Decimal,
    unit_cost: Decimal,
    quantity_received: Decimal,
    total_cost: Decimal,
    cost_scale: u32,
) -> Result<WeightedAverage, DomainError> {
    if quantity_received.is_zero() {
        return Err(DomainError::validation("quantity_received must be positive"));
    }

    let incoming_unit_cost = total_cost
        .checked_div(quantity_received)
        .map(|c| round_cost(c, cost_scale))
        .ok_or_else(overflow)?;

    let quantity_after = quantity_on_hand
        .checked_add(quantity_received)
        .ok_or_else(overflow)?;

    let total_value_after = quantity_on_hand
        .checked_mul(unit_cost)
        .and_then(|existing| existing.checked_add(total_cost))
        .ok_or_else(overflow)?;

    let unit_cost_after = if quantity_after.is_zero() {
        Decimal::ZERO
    } else {
        total_value_after
            .checked_div(quantity_after)
            .map(|c| round_cost(c, cost_scale))
            .ok_or_else(overflow)?
    };

    Ok(WeightedAverage {
        incoming_unit_cost,
        quantity_after,
        total_value_after,
        unit_cost_after,
    })
}

/// Value of a position (`quantity * unit_cost`) at the cost scale.
pub fn inventory_value(
    quantity: Decimal,
    unit_cost: Decimal,
    cost_scale: u32,
) -> Result<Decimal, DomainError> {
    quantity
        .checked_mul(unit_cost)
        .map(|v| round_cost(v, cost_scale))
        .ok_or_else(overflow)
}

fn overflow() -> DomainError {
    DomainError::invariant("stock valuation overflowed decimal range")
}
