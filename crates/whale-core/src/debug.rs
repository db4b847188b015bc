//! Helpers for verbose debug output.

use std::sync::OnceLock;

/// Returns `true` when verbose debug output is enabled.
///
/// Controlled by the `WHALE_DEBUG` environment variable (any non-empty value).
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("WHALE_DEBUG").is_some())
}
