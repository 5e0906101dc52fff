//! Ledger events and their fan-out transport.
//!
//! Events describe committed stock changes. They are published after the
//! storage write succeeds and are never the source of truth.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
