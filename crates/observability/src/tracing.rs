//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Filter for the process: `RUST_LOG` when set and valid, otherwise `level`.
///
/// `level` is an `EnvFilter` directive such as `info` or `off`; an invalid
/// one falls back to `info`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(level: &str) {
    // JSON logs + timestamps.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_is_used_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(filter("debug").to_string(), "debug");
        assert_eq!(filter("off").to_string(), "off");
    }

    #[test]
    fn init_twice_is_a_no_op() {
        init("warn");
        init("trace");
        ::tracing::warn!(attempt = 1, "still logging");
    }
}
