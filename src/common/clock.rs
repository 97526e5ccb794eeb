// Wall clock helpers
//
// Lease records are shared between nodes through the store, so their expiry
// is kept as milliseconds since the UNIX epoch rather than as an `Instant`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Expiry timestamp for a lease of length `lease` starting now
pub fn expiry_after(lease: Duration) -> u64 {
    now_millis().saturating_add(lease.as_millis() as u64)
}
