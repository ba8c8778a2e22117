//! Refresh telemetry abstractions.
//!
//! Hosts implement [`RefreshTelemetry`] to observe pass outcomes and replica
//! backoffs without reaching into the engine's state. Every hook defaults to a
//! no-op.

use super::watch::WatchKind;
use super::{RefreshError, RefreshEventData};

/// Telemetry hook invoked on significant refresh events.
pub trait RefreshTelemetry: Send + Sync {
    /// Called after a pass produced a verdict.
    fn on_pass_complete(&self, _event: &RefreshEventData) {}
    /// Called after one store's check completed against some replica.
    fn on_store_checked(&self, _origin_endpoint: &str, _kind: WatchKind, _changed: bool) {}
    /// Called when a replica is backed off after a transient failure.
    fn on_replica_backoff(&self, _origin_endpoint: &str, _endpoint: &str) {}
    /// Called when a pass aborts with an error.
    fn on_refresh_error(&self, _error: &RefreshError) {}
    /// Called when a pass is skipped because another one is running.
    fn on_pass_skipped(&self) {}
}

/// Default telemetry implementation that performs no-ops.
#[derive(Debug, Default)]
pub(crate) struct NoopTelemetry;

impl RefreshTelemetry for NoopTelemetry {}
