//! Tracing/logging setup shared by binaries and test harnesses embedding the ledger.

/// Tracing subscriber configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize process-wide logging: JSON lines, `RUST_LOG` filter, default `info`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
/// Returns `true` only for the call that installed the subscriber.
pub fn init() -> bool {
    crate::tracing::init(LogFormat::Json, "info")
}
