//! Monotonic clock used for backoff windows and refresh schedules.
//!
//! Unit tests swap in `mock_instant` so schedules can be advanced without
//! sleeping; every other build uses the standard library clock.

use std::time::Duration;

#[cfg(test)]
pub use mock_instant::thread_local::Instant;
#[cfg(not(test))]
pub use std::time::Instant;

/// Furthest a deadline is placed when `from + delay` does not fit in an `Instant`.
pub(crate) const MAX_DEADLINE_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Returns the current instant on the active clock.
pub(crate) fn now() -> Instant {
    Instant::now()
}

/// Returns `from + delay`, saturating instead of panicking on overflow.
pub(crate) fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(MAX_DEADLINE_DELAY))
        .unwrap_or(from)
}
