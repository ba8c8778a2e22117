//! Process-wide refresh schedule.
//!
//! Every mutation builds a new [`RefreshSnapshot`] and swaps it in atomically,
//! so a reader holding a snapshot never observes a partially applied update.
//! Per-store entries are immutable [`StoreRefreshState`] values shared between
//! snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use fastrand::Rng;
use tracing::debug;

use super::watch::{WatchKind, WatchSet, WatchedSelector, WatchedSetting};
use crate::backoff::{jittered_delay, BackoffConfig};
use crate::clock::{self, Instant};

/// Upper bound of the random delay applied by [`RefreshStateStore::expire`].
pub const MAX_EXPIRE_DELAY: Duration = Duration::from_secs(15);

/// Refresh schedule of one store for one watch kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRefreshState {
    pub origin_endpoint: String,
    pub watch: WatchSet,
    pub refresh_interval: Duration,
    /// The store is not contacted before this instant.
    pub next_refresh_check: Instant,
    /// Consecutive schedule misses caused by errors, starting at 1.
    pub refresh_attempt: u32,
}

impl StoreRefreshState {
    pub fn kind(&self) -> WatchKind {
        self.watch.kind()
    }

    /// Returns `true` once the check window is open at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_refresh_check
    }
}

/// Schedule of the global fallback refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedRefresh {
    pub next: Instant,
    pub attempt: u32,
}

/// Immutable view of every store's refresh schedule.
#[derive(Debug, Clone, Default)]
pub struct RefreshSnapshot {
    settings: HashMap<String, Arc<StoreRefreshState>>,
    feature_flags: HashMap<String, Arc<StoreRefreshState>>,
    load_state: HashMap<String, bool>,
    forced_refresh: Option<ForcedRefresh>,
}

impl RefreshSnapshot {
    pub fn state(&self, kind: WatchKind, origin_endpoint: &str) -> Option<&Arc<StoreRefreshState>> {
        self.states(kind).get(origin_endpoint)
    }

    /// Whether the last load of the store succeeded; `false` when unknown.
    pub fn load_state(&self, origin_endpoint: &str) -> bool {
        self.load_state.get(origin_endpoint).copied().unwrap_or(false)
    }

    pub fn forced_refresh(&self) -> Option<ForcedRefresh> {
        self.forced_refresh
    }

    fn states(&self, kind: WatchKind) -> &HashMap<String, Arc<StoreRefreshState>> {
        match kind {
            WatchKind::Settings => &self.settings,
            WatchKind::FeatureFlags => &self.feature_flags,
        }
    }

    fn states_mut(&mut self, kind: WatchKind) -> &mut HashMap<String, Arc<StoreRefreshState>> {
        match kind {
            WatchKind::Settings => &mut self.settings,
            WatchKind::FeatureFlags => &mut self.feature_flags,
        }
    }
}

/// Holder of the current [`RefreshSnapshot`]; one instance per process.
#[derive(Debug, Default)]
pub struct RefreshStateStore {
    current: ArcSwap<RefreshSnapshot>,
}

impl RefreshStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RefreshSnapshot> {
        self.current.load_full()
    }

    /// Convenience accessor for a single store state in the current snapshot.
    pub fn state(&self, kind: WatchKind, origin_endpoint: &str) -> Option<Arc<StoreRefreshState>> {
        self.current.load().state(kind, origin_endpoint).cloned()
    }

    /// Installs the watched settings of a store, first check one `interval` from now.
    pub fn set_watch_state(
        &self,
        origin_endpoint: &str,
        settings: Vec<WatchedSetting>,
        interval: Duration,
    ) {
        self.install(origin_endpoint, WatchSet::Settings(settings), interval);
    }

    /// Installs the watched feature-flag selectors of a store.
    pub fn set_feature_flag_watch_state(
        &self,
        origin_endpoint: &str,
        selectors: Vec<WatchedSelector>,
        interval: Duration,
    ) {
        self.install(origin_endpoint, WatchSet::FeatureFlags(selectors), interval);
    }

    fn install(&self, origin_endpoint: &str, watch: WatchSet, interval: Duration) {
        let state = Arc::new(StoreRefreshState {
            origin_endpoint: origin_endpoint.to_owned(),
            watch,
            refresh_interval: interval,
            next_refresh_check: clock::deadline(clock::now(), interval),
            refresh_attempt: 1,
        });
        let kind = state.kind();
        self.update(|snapshot| {
            snapshot
                .states_mut(kind)
                .insert(origin_endpoint.to_owned(), state.clone());
        });
    }

    /// Pushes the next check of a store one `interval` out after a completed check.
    ///
    /// The attempt counter is kept for unchanged results and reset when a
    /// change was found. Stores whose state was removed meanwhile are left alone.
    pub fn record_refresh_outcome(
        &self,
        previous: &StoreRefreshState,
        changed: bool,
        interval: Duration,
    ) {
        let next_refresh_check = clock::deadline(clock::now(), interval);
        let kind = previous.kind();
        self.update(|snapshot| {
            if let Some(current) = snapshot.states_mut(kind).get_mut(&previous.origin_endpoint) {
                *current = Arc::new(StoreRefreshState {
                    next_refresh_check,
                    refresh_attempt: if changed { 1 } else { current.refresh_attempt },
                    ..StoreRefreshState::clone(current)
                });
            }
        });
    }

    /// Brings both checks of a store forward to a random point within [`MAX_EXPIRE_DELAY`].
    ///
    /// A check that is already scheduled sooner is never delayed.
    pub fn expire(&self, origin_endpoint: &str) {
        self.expire_with_rng(origin_endpoint, &mut Rng::new());
    }

    pub fn expire_with_rng(&self, origin_endpoint: &str, rng: &mut Rng) {
        let delay = Duration::from_millis(rng.u64(0..=MAX_EXPIRE_DELAY.as_millis() as u64));
        let candidate = clock::deadline(clock::now(), delay);
        self.update(|snapshot| {
            for kind in WatchKind::ALL {
                if let Some(current) = snapshot.states_mut(kind).get_mut(origin_endpoint) {
                    if candidate < current.next_refresh_check {
                        *current = Arc::new(StoreRefreshState {
                            next_refresh_check: candidate,
                            ..StoreRefreshState::clone(current)
                        });
                    }
                }
            }
        });
        debug!(
            origin = %origin_endpoint,
            delay_ms = delay.as_millis() as u64,
            "config-refresh: store expired"
        );
    }

    pub fn set_load_state(&self, origin_endpoint: &str, success: bool) {
        self.update(|snapshot| {
            snapshot
                .load_state
                .insert(origin_endpoint.to_owned(), success);
        });
    }

    pub fn get_load_state(&self, origin_endpoint: &str) -> bool {
        self.current.load().load_state(origin_endpoint)
    }

    /// Schedules the global forced refresh one `interval` from now.
    pub fn set_next_forced_refresh(&self, interval: Duration) {
        let forced = ForcedRefresh {
            next: clock::deadline(clock::now(), interval),
            attempt: 1,
        };
        self.update(|snapshot| snapshot.forced_refresh = Some(forced));
    }

    /// Pushes out every overdue schedule after a failed pass.
    ///
    /// The forced refresh uses `forced_interval` (when configured) and each store
    /// its own refresh interval. An overdue schedule moves to `now + interval`
    /// when the interval does not exceed the minimum backoff, and to a jittered
    /// backoff based on its attempt counter otherwise. The counter grows only when
    /// the schedule actually moved.
    pub fn update_next_refresh_time(&self, forced_interval: Option<Duration>, backoff: BackoffConfig) {
        self.update_next_refresh_time_with_rng(forced_interval, backoff, &mut Rng::new());
    }

    pub fn update_next_refresh_time_with_rng(
        &self,
        forced_interval: Option<Duration>,
        backoff: BackoffConfig,
        rng: &mut Rng,
    ) {
        let now = clock::now();
        self.update(|snapshot| {
            if let (Some(interval), Some(forced)) = (forced_interval, snapshot.forced_refresh.as_mut()) {
                let scheduled = recovery_check(now, forced.next, forced.attempt, interval, backoff, rng);
                if scheduled != forced.next {
                    forced.attempt = forced.attempt.saturating_add(1);
                }
                forced.next = scheduled;
            }

            for kind in WatchKind::ALL {
                for current in snapshot.states_mut(kind).values_mut() {
                    let scheduled = recovery_check(
                        now,
                        current.next_refresh_check,
                        current.refresh_attempt,
                        current.refresh_interval,
                        backoff,
                        rng,
                    );
                    if scheduled != current.next_refresh_check {
                        *current = Arc::new(StoreRefreshState {
                            next_refresh_check: scheduled,
                            refresh_attempt: current.refresh_attempt.saturating_add(1),
                            ..StoreRefreshState::clone(current)
                        });
                    }
                }
            }
        });
    }

    fn update<F>(&self, mut apply: F)
    where
        F: FnMut(&mut RefreshSnapshot),
    {
        self.current.rcu(|current| {
            let mut next = RefreshSnapshot::clone(current);
            apply(&mut next);
            next
        });
    }
}

fn recovery_check(
    now: Instant,
    scheduled: Instant,
    attempt: u32,
    interval: Duration,
    backoff: BackoffConfig,
    rng: &mut Rng,
) -> Instant {
    if now < scheduled {
        return scheduled;
    }
    if interval <= backoff.min_backoff {
        return clock::deadline(now, interval);
    }
    clock::deadline(
        now,
        jittered_delay(rng, attempt, backoff.min_backoff, backoff.max_backoff),
    )
}
