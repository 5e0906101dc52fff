//! `stockledger-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod context;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use context::LedgerContext;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, HistoryEntryId, MovementId, TenantId, UserId};
