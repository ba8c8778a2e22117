//! A single endpoint of a store together with its backoff window.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fastrand::Rng;

use crate::backoff::{jittered_delay, BackoffConfig};
use crate::client::ConfigurationClient;
use crate::clock::{self, Instant};

/// Failure bookkeeping guarded by the client's mutex.
#[derive(Debug, Default, Clone, Copy)]
struct BackoffWindow {
    /// `None` until the first failure, which reads as "already expired".
    backoff_end_time: Option<Instant>,
    failed_attempts: u32,
}

/// Wire client for one endpoint plus the time until which it should be skipped.
pub struct ReplicaClient {
    endpoint: String,
    client: Arc<dyn ConfigurationClient>,
    backoff: BackoffConfig,
    window: Mutex<BackoffWindow>,
}

impl fmt::Debug for ReplicaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let window = self.window();
        f.debug_struct("ReplicaClient")
            .field("endpoint", &self.endpoint)
            .field("failed_attempts", &window.failed_attempts)
            .field("backoff_end_time", &window.backoff_end_time)
            .finish()
    }
}

impl ReplicaClient {
    pub fn new(
        endpoint: impl Into<String>,
        client: Arc<dyn ConfigurationClient>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            backoff,
            window: Mutex::new(BackoffWindow::default()),
        }
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wire client used for change-token lookups.
    pub fn client(&self) -> &Arc<dyn ConfigurationClient> {
        &self.client
    }

    /// Returns `true` once the backoff window has elapsed at `now`.
    pub fn is_available(&self, now: Instant) -> bool {
        match self.window().backoff_end_time {
            Some(end) => now >= end,
            None => true,
        }
    }

    /// Number of failures recorded since construction or the last reset.
    pub fn failed_attempts(&self) -> u32 {
        self.window().failed_attempts
    }

    /// End of the current backoff window, if a failure was ever recorded.
    pub fn backoff_end_time(&self) -> Option<Instant> {
        self.window().backoff_end_time
    }

    /// Records a failure at `now` and returns the backoff applied.
    pub fn record_failure(&self, now: Instant) -> Duration {
        self.record_failure_with_rng(now, &mut Rng::new())
    }

    /// Same as [`ReplicaClient::record_failure`] with an explicit random source.
    pub fn record_failure_with_rng(&self, now: Instant, rng: &mut Rng) -> Duration {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.failed_attempts = window.failed_attempts.saturating_add(1);
        let delay = jittered_delay(
            rng,
            window.failed_attempts,
            self.backoff.min_backoff,
            self.backoff.max_backoff,
        );
        window.backoff_end_time = Some(clock::deadline(now, delay));
        delay
    }

    /// Clears the failure count and makes the client available immediately.
    pub fn reset(&self) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = BackoffWindow::default();
    }

    fn window(&self) -> BackoffWindow {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::test_support::ScriptedClient;
    use mock_instant::thread_local::MockClock;

    fn replica() -> ReplicaClient {
        ReplicaClient::new(
            "https://replica.example.io",
            Arc::new(ScriptedClient::default()),
            BackoffConfig::default(),
        )
    }

    #[test]
    fn new_client_is_available() {
        let client = replica();
        assert!(client.is_available(Instant::now()));
        assert_eq!(client.failed_attempts(), 0);
        assert!(client.backoff_end_time().is_none());
    }

    #[test]
    fn first_failure_applies_minimum_backoff() {
        MockClock::set_time(Duration::from_secs(100));
        let client = replica();
        let now = Instant::now();
        let delay = client.record_failure(now);

        assert_eq!(delay, BackoffConfig::default().min_backoff);
        assert_eq!(client.failed_attempts(), 1);
        assert!(!client.is_available(now));
        assert!(!client.is_available(now + Duration::from_secs(29)));
        assert!(client.is_available(now + Duration::from_secs(30)));
    }

    #[test]
    fn repeated_failures_grow_within_bounds() {
        let client = replica();
        let now = Instant::now();
        client.record_failure(now);
        let second = client.record_failure_with_rng(now, &mut Rng::with_seed(3));
        let config = BackoffConfig::default();
        assert_eq!(client.failed_attempts(), 2);
        assert!(second >= config.min_backoff && second <= config.max_backoff);
        assert_eq!(client.backoff_end_time(), Some(now + second));
    }

    /// A backoff too large for the clock saturates instead of panicking.
    #[test]
    fn oversized_backoff_saturates_window_end() {
        MockClock::set_time(Duration::from_secs(100));
        let client = ReplicaClient::new(
            "https://replica.example.io",
            Arc::new(ScriptedClient::default()),
            BackoffConfig {
                min_backoff: Duration::MAX,
                max_backoff: Duration::MAX,
            },
        );
        let now = Instant::now();
        client.record_failure(now);
        assert_eq!(
            client.backoff_end_time(),
            Some(now + clock::MAX_DEADLINE_DELAY)
        );
        assert!(!client.is_available(now + Duration::from_secs(3600)));
    }

    #[test]
    fn reset_restores_availability() {
        let client = replica();
        let now = Instant::now();
        client.record_failure(now);
        client.reset();
        assert!(client.is_available(now));
        assert_eq!(client.failed_attempts(), 0);
    }
}
