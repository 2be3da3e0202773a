//! Tracing/logging setup shared by every binary in the workspace.

use courier_core::LogSettings;

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(settings: &LogSettings) {
    tracing::init(settings);
}

/// Initialize with default settings (info level, JSON output).
pub fn init_default() {
    init(&LogSettings::default());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
