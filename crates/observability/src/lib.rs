//! Tracing and logging (shared setup).

/// Initialize process-wide observability at the configured `level`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(level: &str) {
    tracing::init(level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
