//! Stock persistence boundary.
//!
//! The ledger talks to storage only through [`StockStore`], so the same rules
//! run against the in-memory store in tests and Postgres in production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use r#trait::{ConsumptionWrite, ReceiptWrite, StockStore, StoreError};
