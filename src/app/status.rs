//! Process-wide status line
//!
//! The strategies publish a short human-readable status ("Connecting to
//! tokyo-1...", "Connected (per-request via ...)") that diagnostics can
//! read back. One slot, last writer wins.

use std::sync::OnceLock;

use parking_lot::Mutex;

fn slot() -> &'static Mutex<String> {
    static STATUS: OnceLock<Mutex<String>> = OnceLock::new();
    STATUS.get_or_init(|| Mutex::new(String::from("Idle")))
}

/// Replace the status line
pub fn set(status: impl Into<String>) {
    let status = status.into();
    tracing::debug!(status = %status, "Status updated");
    *slot().lock() = status;
}

/// Read the current status line
#[must_use]
pub fn get() -> String {
    slot().lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        set("Connecting to somewhere...");
        assert_eq!(get(), "Connecting to somewhere...");
        set("Connected");
        assert_eq!(get(), "Connected");
    }
}
