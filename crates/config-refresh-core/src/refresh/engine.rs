//! Refresh pass orchestration.
//!
//! A pass walks the registered stores in configured order. For each store it
//! checks watched settings and then watched feature flags, but only when the
//! corresponding window is open and the store's last load succeeded. A check
//! runs against the store's available replicas one at a time: transient
//! failures back the replica off and move on to the next one, anything else
//! aborts the pass after pushing out the overdue schedules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use super::state::{RefreshStateStore, StoreRefreshState};
use super::telemetry::{NoopTelemetry, RefreshTelemetry};
use super::watch::WatchKind;
use crate::backoff::BackoffConfig;
use crate::client::{ClientError, ClientFactory};
use crate::clock;
use crate::config::{ConfigError, RefreshConfig};
use crate::replica::{ConnectionManager, FailoverEndpointLookup, ReplicaClientRegistry};

/// Message returned when the global fallback timer fired.
pub const FORCED_REFRESH_MESSAGE: &str = "refresh due to forced interval";
/// Message returned when a concurrent pass is already running.
pub const PASS_IN_PROGRESS_MESSAGE: &str = "refresh already in progress";

/// Errors that abort a refresh pass.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// A replica reported a non-transient failure.
    #[error("store {origin}: replica {endpoint} failed: {source}")]
    Client {
        origin: String,
        endpoint: String,
        #[source]
        source: ClientError,
    },
    /// The store definitions could not be turned into a registry.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Verdict of one refresh pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEventData {
    /// Whether the host should reload its configuration.
    pub should_refresh: bool,
    /// Human-readable cause.
    pub message: String,
}

impl RefreshEventData {
    pub fn changed(message: impl Into<String>) -> Self {
        Self {
            should_refresh: true,
            message: message.into(),
        }
    }

    pub fn unchanged(message: impl Into<String>) -> Self {
        Self {
            should_refresh: false,
            message: message.into(),
        }
    }
}

/// Result of checking one watch kind of one store.
enum CheckOutcome {
    Changed(String),
    Unchanged,
    /// Every replica was backed off or failed transiently.
    Unreachable,
}

/// Clears the running flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Decides whether any registered store changed since it was last loaded.
pub struct RefreshEngine {
    registry: ReplicaClientRegistry,
    state: Arc<RefreshStateStore>,
    forced_interval: Option<Duration>,
    backoff: BackoffConfig,
    telemetry: Arc<dyn RefreshTelemetry>,
    running: AtomicBool,
}

impl RefreshEngine {
    /// Creates an engine over an existing registry and state store.
    pub fn new(
        registry: ReplicaClientRegistry,
        state: Arc<RefreshStateStore>,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            registry,
            state,
            forced_interval: config.refresh_interval,
            backoff: config.backoff,
            telemetry: Arc::new(NoopTelemetry),
            running: AtomicBool::new(false),
        }
    }

    /// Builds the registry and a fresh state store from `config`.
    pub fn from_config(
        config: &RefreshConfig,
        factory: Arc<dyn ClientFactory>,
        failover: Arc<dyn FailoverEndpointLookup>,
    ) -> Result<Self, RefreshError> {
        let registry = ReplicaClientRegistry::new(config, factory, failover)?;
        Ok(Self::new(
            registry,
            Arc::new(RefreshStateStore::new()),
            config,
        ))
    }

    /// Replaces the telemetry sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn RefreshTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn registry(&self) -> &ReplicaClientRegistry {
        &self.registry
    }

    pub fn state(&self) -> &Arc<RefreshStateStore> {
        &self.state
    }

    /// Runs one refresh pass.
    ///
    /// A call made while another pass is in flight returns an unchanged verdict
    /// immediately.
    pub async fn run_pass(&self) -> Result<RefreshEventData, RefreshError> {
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            debug!("config-refresh: pass skipped, another pass is running");
            self.telemetry.on_pass_skipped();
            return Ok(RefreshEventData::unchanged(PASS_IN_PROGRESS_MESSAGE));
        };

        match self.check_stores().await {
            Ok(event) => {
                debug!(
                    should_refresh = event.should_refresh,
                    message = %event.message,
                    "config-refresh: pass complete"
                );
                self.telemetry.on_pass_complete(&event);
                Ok(event)
            }
            Err(err) => {
                error!(%err, "config-refresh: pass aborted");
                self.state
                    .update_next_refresh_time(self.forced_interval, self.backoff);
                self.telemetry.on_refresh_error(&err);
                Err(err)
            }
        }
    }

    /// Accelerates the next checks of the store serving `endpoint`.
    ///
    /// `endpoint` may be any replica of the store. Stores that did not opt into
    /// push notifications ignore the signal.
    pub fn expire(&self, endpoint: &str, change_hint: Option<&str>) {
        let origin = self.registry.find_origin_for_endpoint(endpoint);
        let Some(manager) = self.registry.manager(&origin) else {
            debug!(endpoint = %endpoint, "config-refresh: push notification for unknown store ignored");
            return;
        };
        if !manager.monitoring().push_notification {
            debug!(
                origin = %origin,
                "config-refresh: push notifications not enabled for store, ignoring"
            );
            return;
        }
        debug!(
            origin = %origin,
            change_hint = change_hint.unwrap_or_default(),
            "config-refresh: push notification received"
        );
        self.state.expire(&origin);
    }

    async fn check_stores(&self) -> Result<RefreshEventData, RefreshError> {
        let now = clock::now();
        let snapshot = self.state.snapshot();

        if let Some(forced) = snapshot.forced_refresh() {
            if now >= forced.next {
                return Ok(RefreshEventData::changed(FORCED_REFRESH_MESSAGE));
            }
        }

        let mut verdict: Option<String> = None;
        for manager in self.registry.managers() {
            let origin = manager.origin_endpoint();
            manager.refresh_failover();
            manager.reset_current_client();

            for kind in WatchKind::ALL {
                let enabled = match kind {
                    WatchKind::Settings => manager.monitoring().enabled,
                    WatchKind::FeatureFlags => manager.feature_flags().enabled,
                };
                if !enabled || !snapshot.load_state(origin) {
                    continue;
                }
                let Some(state) = snapshot.state(kind, origin) else {
                    continue;
                };
                if !state.is_due(now) {
                    debug!(origin = %origin, %kind, "config-refresh: check window not open, skipping");
                    continue;
                }

                match self.check_store(manager, state).await? {
                    CheckOutcome::Changed(key) => {
                        if verdict.is_none() {
                            verdict = Some(format!("refresh due to key {key} changed"));
                        }
                        // First positive wins for this store.
                        break;
                    }
                    CheckOutcome::Unchanged | CheckOutcome::Unreachable => {}
                }
            }
        }

        Ok(match verdict {
            Some(message) => RefreshEventData::changed(message),
            None => RefreshEventData::unchanged("no watched setting changed"),
        })
    }

    async fn check_store(
        &self,
        manager: &ConnectionManager,
        state: &StoreRefreshState,
    ) -> Result<CheckOutcome, RefreshError> {
        let origin = manager.origin_endpoint();
        let kind = state.kind();

        for client in manager.get_available_clients(true) {
            let endpoint = client.endpoint();
            match state.watch.detect_change(client.client().as_ref()).await {
                Ok(changed) => {
                    manager.set_current_client(endpoint);
                    self.state
                        .record_refresh_outcome(state, changed.is_some(), state.refresh_interval);
                    self.telemetry
                        .on_store_checked(origin, kind, changed.is_some());
                    return Ok(match changed {
                        Some(key) => {
                            debug!(origin = %origin, %kind, key = %key, "config-refresh: change detected");
                            CheckOutcome::Changed(key)
                        }
                        None => {
                            debug!(origin = %origin, %kind, "config-refresh: no change detected");
                            CheckOutcome::Unchanged
                        }
                    });
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        origin = %origin,
                        endpoint = %endpoint,
                        %err,
                        "config-refresh: transient failure, trying next replica"
                    );
                    manager.backoff_client(endpoint);
                    self.telemetry.on_replica_backoff(origin, endpoint);
                }
                Err(err) => {
                    return Err(RefreshError::Client {
                        origin: origin.to_owned(),
                        endpoint: endpoint.to_owned(),
                        source: err,
                    });
                }
            }
        }

        debug!(origin = %origin, %kind, "config-refresh: no replica available, skipping store");
        Ok(CheckOutcome::Unreachable)
    }
}
