//! Tracing and logging setup shared by the tradeflow binaries.

/// Initialize process-wide tracing using the format selected by
/// `TRADEFLOW_LOG_FORMAT` (`json` or `pretty`, default `json`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use self::tracing::LogFormat;
