//! Infrastructure layer: storage adapters, configuration and the stock ledger service.

pub mod config;
pub mod ledger;
pub mod locks;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{HistoryMode, LedgerConfig};
pub use ledger::{LedgerError, ReceiptOutcome, StockLedger, ValuationSummary};
pub use locks::MaterialLocks;
pub use store::{
    ConsumptionWrite, InMemoryStockStore, PostgresStockStore, ReceiptWrite, StockStore, StoreError,
};
