//! Change detection and refresh scheduling.
//!
//! The [`RefreshStateStore`] holds what each store watches and when it is
//! next due; the [`RefreshEngine`] runs passes over it and reports whether the
//! host should reload.

mod engine;
pub(crate) mod state;
pub(crate) mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod watch;

pub use engine::{
    RefreshEngine, RefreshError, RefreshEventData, FORCED_REFRESH_MESSAGE,
    PASS_IN_PROGRESS_MESSAGE,
};
pub use state::{
    ForcedRefresh, RefreshSnapshot, RefreshStateStore, StoreRefreshState, MAX_EXPIRE_DELAY,
};
pub use telemetry::RefreshTelemetry;
pub use watch::{WatchKind, WatchSet, WatchedSelector, WatchedSetting};
