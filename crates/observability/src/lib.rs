//! Tracing and logging setup shared by the engine's binaries and tests.

/// Initialize process-wide observability (JSON logs, `RUST_LOG` filter).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json, "info");
}

/// Human-readable output captured by the test harness.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_for_tests() {
    tracing::init_test_writer("debug");
}

/// Tracing configuration (filters, formats).
pub mod tracing;
