//! Public entry points for the config-refresh core crate.
//!
//! The crate keeps a process talking to a healthy replica of each remote
//! configuration store and cheaply detects whether any watched setting or
//! feature flag changed since the last load. Hosts plug in the wire client
//! through [`ClientFactory`], build one [`ReplicaClientRegistry`] and one
//! [`RefreshStateStore`] per process, and drive [`RefreshEngine::run_pass`]
//! from their own timer.

pub mod backoff;
pub mod client;
mod clock;
pub mod config;
pub mod refresh;
pub mod replica;
pub mod status;
pub mod telemetry;

pub use backoff::{compute_backoff, compute_backoff_with_rng, BackoffConfig, BackoffError};
pub use client::{
    classify_status, ClientError, ClientFactory, ConfigurationClient, ConfigurationSetting,
    SettingSelector,
};
pub use config::{
    endpoint_from_connection_string, ConfigError, FeatureFlagConfig, FeatureFlagSelect,
    MonitoringConfig, RefreshConfig, RefreshEnv, StoreConfig, WatchedKeyConfig,
};
pub use refresh::{
    RefreshEngine, RefreshError, RefreshEventData, RefreshSnapshot, RefreshStateStore,
    RefreshTelemetry, StoreRefreshState, WatchKind, WatchSet, WatchedSelector, WatchedSetting,
};
pub use replica::{
    ConnectionManager, FailoverEndpointLookup, NoFailover, ReplicaClient, ReplicaClientRegistry,
    StaticFailoverLookup, StoreHealth,
};
pub use status::{health_json, HealthSnapshot};
pub use telemetry::{CompositeTelemetry, CountingTelemetry, TelemetryCounters, TelemetrySnapshot};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Ensures hosts can wire an engine through the crate root alone.
    #[test]
    fn engine_can_be_built_from_reexports() {
        let config = RefreshEnv::from_env_iter([("APPCONFIG_ENDPOINT", "https://a.example.io")])
            .into_config();
        let factory = refresh::test_support::ScriptedBackend::default();
        let engine = RefreshEngine::from_config(&config, Arc::new(factory), Arc::new(NoFailover))
            .unwrap()
            .with_telemetry(Arc::new(CountingTelemetry::default()));

        assert_eq!(
            engine.registry().origins().collect::<Vec<_>>(),
            vec!["https://a.example.io"]
        );
        assert_eq!(
            health_json(engine.registry()),
            serde_json::json!({"stores": {"https://a.example.io": "NOT_LOADED"}})
        );
    }
}
