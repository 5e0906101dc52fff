//! Ledger configuration.

use core::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use stockledger_inventory::ValuationPolicy;

/// Where the display-only history row is written.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// After the authoritative commit; failures are logged, not returned.
    #[default]
    BestEffort,
    /// Inside the same transaction as the stock update.
    Atomic,
}

impl FromStr for HistoryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "best-effort" => Ok(HistoryMode::BestEffort),
            "atomic" => Ok(HistoryMode::Atomic),
            other => bail!("unknown history mode '{other}' (expected best_effort or atomic)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Decimal places kept for unit cost and inventory value.
    pub cost_scale: u32,
    pub history_mode: HistoryMode,
    pub allow_zero_cost_receipts: bool,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cost_scale: 2,
            history_mode: HistoryMode::BestEffort,
            allow_zero_cost_receipts: false,
            database_url: None,
            max_connections: 5,
        }
    }
}

impl LedgerConfig {
    /// Read `STOCKLEDGER_*` variables (and `DATABASE_URL`), falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let cost_scale = match lookup("STOCKLEDGER_COST_SCALE") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("STOCKLEDGER_COST_SCALE is not a number: {v}"))?,
            None => defaults.cost_scale,
        };
        let history_mode = match lookup("STOCKLEDGER_HISTORY_MODE") {
            Some(v) => v.parse().context("STOCKLEDGER_HISTORY_MODE")?,
            None => defaults.history_mode,
        };
        let allow_zero_cost_receipts = match lookup("STOCKLEDGER_ALLOW_ZERO_COST") {
            Some(v) => parse_bool(&v).context("STOCKLEDGER_ALLOW_ZERO_COST")?,
            None => defaults.allow_zero_cost_receipts,
        };
        let max_connections = match lookup("STOCKLEDGER_MAX_CONNECTIONS") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("STOCKLEDGER_MAX_CONNECTIONS is not a number: {v}"))?,
            None => defaults.max_connections,
        };

        let config = Self {
            cost_scale,
            history_mode,
            allow_zero_cost_receipts,
            database_url: lookup("DATABASE_URL"),
            max_connections,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // rust_decimal carries at most 28 fractional digits.
        if self.cost_scale > 28 {
            bail!("cost_scale must be at most 28, got {}", self.cost_scale);
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        Ok(())
    }

    pub fn valuation_policy(&self) -> ValuationPolicy {
        ValuationPolicy {
            cost_scale: self.cost_scale,
            allow_zero_cost: self.allow_zero_cost_receipts,
        }
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
