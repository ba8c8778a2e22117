//! Telemetry helpers for the refresh engine.
//!
//! This module provides drop-in implementations of [`RefreshTelemetry`]:
//! atomic counters that hosts can export through their own metric backend,
//! and a dispatcher that fans events out to several observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::refresh::{RefreshError, RefreshEventData, RefreshTelemetry, WatchKind};

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    passes: AtomicU64,
    refresh_signals: AtomicU64,
    passes_skipped: AtomicU64,
    settings_checks: AtomicU64,
    feature_flag_checks: AtomicU64,
    replica_backoffs: AtomicU64,
    refresh_errors: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            refresh_signals: self.refresh_signals.load(Ordering::Relaxed),
            passes_skipped: self.passes_skipped.load(Ordering::Relaxed),
            settings_checks: self.settings_checks.load(Ordering::Relaxed),
            feature_flag_checks: self.feature_flag_checks.load(Ordering::Relaxed),
            replica_backoffs: self.replica_backoffs.load(Ordering::Relaxed),
            refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Passes that produced a verdict.
    pub passes: u64,
    /// Passes whose verdict asked the host to reload.
    pub refresh_signals: u64,
    /// Passes skipped because another pass was running.
    pub passes_skipped: u64,
    /// Completed watched-settings checks.
    pub settings_checks: u64,
    /// Completed feature-flag checks.
    pub feature_flag_checks: u64,
    /// Replicas backed off after transient failures.
    pub replica_backoffs: u64,
    /// Passes aborted by an error.
    pub refresh_errors: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passes={}, refresh_signals={}, passes_skipped={}, settings_checks={}, feature_flag_checks={}, replica_backoffs={}, refresh_errors={}",
            self.passes,
            self.refresh_signals,
            self.passes_skipped,
            self.settings_checks,
            self.feature_flag_checks,
            self.replica_backoffs,
            self.refresh_errors
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a new telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl RefreshTelemetry for CountingTelemetry {
    fn on_pass_complete(&self, event: &RefreshEventData) {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        if event.should_refresh {
            self.counters
                .refresh_signals
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_store_checked(&self, _origin_endpoint: &str, kind: WatchKind, _changed: bool) {
        let counter = match kind {
            WatchKind::Settings => &self.counters.settings_checks,
            WatchKind::FeatureFlags => &self.counters.feature_flag_checks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_replica_backoff(&self, _origin_endpoint: &str, _endpoint: &str) {
        self.counters
            .replica_backoffs
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_error(&self, _error: &RefreshError) {
        self.counters.refresh_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn on_pass_skipped(&self) {
        self.counters.passes_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn RefreshTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a telemetry observer to the dispatcher.
    pub fn with_observer(mut self, telemetry: Arc<dyn RefreshTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl RefreshTelemetry for CompositeTelemetry {
    fn on_pass_complete(&self, event: &RefreshEventData) {
        for observer in &self.observers {
            observer.on_pass_complete(event);
        }
    }

    fn on_store_checked(&self, origin_endpoint: &str, kind: WatchKind, changed: bool) {
        for observer in &self.observers {
            observer.on_store_checked(origin_endpoint, kind, changed);
        }
    }

    fn on_replica_backoff(&self, origin_endpoint: &str, endpoint: &str) {
        for observer in &self.observers {
            observer.on_replica_backoff(origin_endpoint, endpoint);
        }
    }

    fn on_refresh_error(&self, error: &RefreshError) {
        for observer in &self.observers {
            observer.on_refresh_error(error);
        }
    }

    fn on_pass_skipped(&self) {
        for observer in &self.observers {
            observer.on_pass_skipped();
        }
    }
}
