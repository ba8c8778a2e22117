//! Store definitions and refresh settings.
//!
//! Hosts describe their configuration stores either as JSON (see
//! [`RefreshConfig::from_json`]) or through `APPCONFIG_*` environment
//! variables (see [`RefreshEnv`]). Durations are expressed in seconds. The
//! values are clamped by [`RefreshConfig::sanitise`] before the registry and
//! refresh engine consume them.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

use crate::backoff::{BackoffConfig, MAX_BACKOFF};
use crate::client::SettingSelector;

/// Refresh cadence used when a store does not configure one.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Shortest refresh cadence accepted for watched settings and feature flags.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// Longest refresh cadence accepted for forced, settings and feature-flag checks.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Retry budget handed to wire clients when a store does not configure one.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Key filter selecting every feature flag in a store.
pub const DEFAULT_FEATURE_FLAG_KEY_FILTER: &str = ".appconfig.featureflag/*";

const ENV_ENABLED: &str = "APPCONFIG_ENABLED";
const ENV_ENDPOINT: &str = "APPCONFIG_ENDPOINT";
const ENV_CONNECTION_STRING: &str = "APPCONFIG_CONNECTION_STRING";
const ENV_REPLICA_ENDPOINTS: &str = "APPCONFIG_REPLICA_ENDPOINTS";
const ENV_REFRESH_ENABLED: &str = "APPCONFIG_REFRESH_ENABLED";
const ENV_REFRESH_INTERVAL: &str = "APPCONFIG_REFRESH_INTERVAL";
const ENV_REFRESH_TRIGGERS: &str = "APPCONFIG_REFRESH_TRIGGERS";
const ENV_PUSH_REFRESH: &str = "APPCONFIG_PUSH_REFRESH";
const ENV_FEATURE_FLAGS_ENABLED: &str = "APPCONFIG_FEATURE_FLAGS_ENABLED";
const ENV_MIN_BACKOFF: &str = "APPCONFIG_MIN_BACKOFF";
const ENV_MAX_BACKOFF: &str = "APPCONFIG_MAX_BACKOFF";

/// Errors raised while interpreting store definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither an endpoint nor a connection string identifies the store.
    #[error("store has neither an endpoint nor a connection string")]
    MissingEndpoint,
    /// A connection string lacks its `Endpoint=` segment.
    #[error("connection string has no Endpoint segment")]
    MalformedConnectionString,
    /// Two stores share the same origin endpoint.
    #[error("duplicate store origin endpoint: {0}")]
    DuplicateStore(String),
    /// The JSON document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single key/label pair whose change token triggers a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchedKeyConfig {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Watched-key monitoring settings for one store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether watched keys are polled at all.
    pub enabled: bool,
    /// Time between two checks of the watched keys.
    #[serde(deserialize_with = "duration_from_secs")]
    pub refresh_interval: Duration,
    /// Keys whose change tokens are compared on every check.
    pub triggers: Vec<WatchedKeyConfig>,
    /// Whether push notifications may accelerate the next check.
    pub push_notification: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            triggers: Vec::new(),
            push_notification: false,
        }
    }
}

/// One feature-flag selection, serialised as key/label filters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureFlagSelect {
    #[serde(default = "default_feature_flag_filter")]
    pub key_filter: String,
    #[serde(default)]
    pub label_filter: Option<String>,
}

impl FeatureFlagSelect {
    /// Converts the configured filters into a wire selector.
    pub fn selector(&self) -> SettingSelector {
        SettingSelector::new(self.key_filter.clone(), self.label_filter.as_deref())
    }
}

fn default_feature_flag_filter() -> String {
    DEFAULT_FEATURE_FLAG_KEY_FILTER.to_owned()
}

/// Feature-flag loading and monitoring settings for one store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeatureFlagConfig {
    /// Whether feature flags are loaded and watched.
    pub enabled: bool,
    /// Time between two checks of the watched selectors.
    #[serde(deserialize_with = "duration_from_secs")]
    pub refresh_interval: Duration,
    /// Selectors to watch; empty means every flag with the null label.
    pub selects: Vec<FeatureFlagSelect>,
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            selects: Vec::new(),
        }
    }
}

impl FeatureFlagConfig {
    /// Returns the selectors to watch, falling back to "all flags, null label".
    pub fn selectors(&self) -> Vec<SettingSelector> {
        if self.selects.is_empty() {
            return vec![SettingSelector::new(DEFAULT_FEATURE_FLAG_KEY_FILTER, None)];
        }
        self.selects.iter().map(FeatureFlagSelect::selector).collect()
    }
}

/// Definition of one logical configuration store and its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Primary endpoint; takes precedence over `connection_string`.
    pub endpoint: Option<String>,
    /// `Endpoint=...;Id=...;Secret=...` connection string for the primary.
    pub connection_string: Option<String>,
    /// Replica endpoints in failover order.
    pub replica_endpoints: Vec<String>,
    /// Replica connection strings in failover order (appended after `replica_endpoints`).
    pub replica_connection_strings: Vec<String>,
    /// Disabled stores are skipped entirely.
    pub enabled: bool,
    /// Retry budget handed to the wire client of each replica.
    pub max_retries: u32,
    /// Per-store backoff override.
    pub backoff: Option<BackoffConfig>,
    /// Watched-key monitoring.
    pub monitoring: MonitoringConfig,
    /// Feature-flag monitoring.
    pub feature_flags: FeatureFlagConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connection_string: None,
            replica_endpoints: Vec::new(),
            replica_connection_strings: Vec::new(),
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: None,
            monitoring: MonitoringConfig::default(),
            feature_flags: FeatureFlagConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Builds a store definition for a single endpoint with default settings.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Returns the stable identity of the store.
    pub fn origin_endpoint(&self) -> Result<String, ConfigError> {
        if let Some(endpoint) = self.endpoint.as_deref().and_then(sanitize_non_empty) {
            return Ok(normalize_endpoint(&endpoint));
        }
        match self.connection_string.as_deref() {
            Some(connection_string) => endpoint_from_connection_string(connection_string),
            None => Err(ConfigError::MissingEndpoint),
        }
    }

    /// Returns the origin followed by every configured replica, without duplicates.
    pub fn endpoints(&self) -> Result<Vec<String>, ConfigError> {
        let mut endpoints = vec![self.origin_endpoint()?];
        let replicas = self
            .replica_endpoints
            .iter()
            .filter_map(|endpoint| sanitize_non_empty(endpoint))
            .map(|endpoint| Ok(normalize_endpoint(&endpoint)))
            .chain(
                self.replica_connection_strings
                    .iter()
                    .map(|value| endpoint_from_connection_string(value)),
            );
        for replica in replicas {
            let replica = replica?;
            if !endpoints.contains(&replica) {
                endpoints.push(replica);
            }
        }
        Ok(endpoints)
    }

    /// Resolves the backoff bounds for this store.
    pub fn backoff_or(&self, fallback: BackoffConfig) -> BackoffConfig {
        self.backoff.unwrap_or(fallback)
    }
}

/// Top-level refresh configuration covering every store of the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Master switch; when false no store is registered.
    pub enabled: bool,
    /// Interval of the global forced refresh; `None` disables it.
    #[serde(deserialize_with = "optional_duration_from_secs")]
    pub refresh_interval: Option<Duration>,
    /// Default backoff bounds for replicas and refresh recovery.
    pub backoff: BackoffConfig,
    /// Stores in the order they are checked.
    pub stores: Vec<StoreConfig>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval: None,
            backoff: BackoffConfig::default(),
            stores: Vec::new(),
        }
    }
}

impl RefreshConfig {
    /// Parses a JSON document into a sanitised configuration.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: RefreshConfig = serde_json::from_str(document)?;
        Ok(config.sanitise())
    }

    /// Returns the enabled stores in configured order (none when disabled globally).
    pub fn enabled_stores(&self) -> impl Iterator<Item = &StoreConfig> + '_ {
        self.stores
            .iter()
            .filter(move |store| self.enabled && store.enabled)
    }

    /// Clamps intervals and backoff bounds to usable values.
    pub fn sanitise(mut self) -> Self {
        self.refresh_interval = self
            .refresh_interval
            .map(|interval| clamp_interval("forced refresh", interval));
        self.backoff = sanitise_backoff(self.backoff);
        for store in &mut self.stores {
            store.monitoring.refresh_interval =
                clamp_interval("monitoring refresh", store.monitoring.refresh_interval);
            store.feature_flags.refresh_interval =
                clamp_interval("feature flag refresh", store.feature_flags.refresh_interval);
            store.backoff = store.backoff.map(sanitise_backoff);
        }
        self
    }
}

fn clamp_interval(name: &str, interval: Duration) -> Duration {
    if interval < MIN_REFRESH_INTERVAL {
        warn!(
            "{} interval {:?} is below the minimum {:?}; clamping",
            name, interval, MIN_REFRESH_INTERVAL
        );
        return MIN_REFRESH_INTERVAL;
    }
    if interval > MAX_REFRESH_INTERVAL {
        warn!(
            "{} interval {:?} is above the maximum {:?}; clamping",
            name, interval, MAX_REFRESH_INTERVAL
        );
        return MAX_REFRESH_INTERVAL;
    }
    interval
}

fn sanitise_backoff(mut backoff: BackoffConfig) -> BackoffConfig {
    if backoff.min_backoff > MAX_BACKOFF {
        warn!(
            "min backoff {:?} is above the maximum {:?}; clamping",
            backoff.min_backoff, MAX_BACKOFF
        );
        backoff.min_backoff = MAX_BACKOFF;
    }
    if backoff.max_backoff > MAX_BACKOFF {
        warn!(
            "max backoff {:?} is above the maximum {:?}; clamping",
            backoff.max_backoff, MAX_BACKOFF
        );
        backoff.max_backoff = MAX_BACKOFF;
    }
    if backoff.max_backoff < backoff.min_backoff {
        warn!(
            "max backoff {:?} is below min backoff {:?}; aligning with min",
            backoff.max_backoff, backoff.min_backoff
        );
        backoff.max_backoff = backoff.min_backoff;
    }
    backoff
}

/// Extracts the endpoint from an `Endpoint=...;Id=...;Secret=...` connection string.
pub fn endpoint_from_connection_string(connection_string: &str) -> Result<String, ConfigError> {
    connection_string
        .split(';')
        .filter_map(|segment| segment.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("endpoint"))
        .and_then(|(_, value)| sanitize_non_empty(value))
        .map(|endpoint| normalize_endpoint(&endpoint))
        .ok_or(ConfigError::MalformedConnectionString)
}

/// Strips trailing slashes so endpoints compare equal regardless of spelling.
fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_owned()
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn optional_duration_from_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
}

/// Environment-derived settings for hosts that configure a single store.
#[derive(Debug, Clone)]
pub struct RefreshEnv {
    /// Whether the store is registered at all. Defaults to `true`.
    pub enabled: bool,
    /// Primary endpoint.
    pub endpoint: Option<String>,
    /// Connection string used when no endpoint is given.
    pub connection_string: Option<String>,
    /// Comma-separated replica endpoints.
    pub replica_endpoints: Vec<String>,
    /// Whether watched keys are polled. Defaults to `false`.
    pub refresh_enabled: bool,
    /// Watched-key refresh interval.
    pub refresh_interval: Option<Duration>,
    /// Watched keys, written as `key` or `key|label`.
    pub triggers: Vec<WatchedKeyConfig>,
    /// Whether push notifications may accelerate checks.
    pub push_refresh: bool,
    /// Whether feature flags are watched.
    pub feature_flags_enabled: bool,
    /// Backoff bounds.
    pub backoff: BackoffConfig,
}

impl RefreshEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| map.get(name).map(String::as_str);

        let defaults = BackoffConfig::default();
        let backoff = BackoffConfig {
            min_backoff: parse_secs(ENV_MIN_BACKOFF, get(ENV_MIN_BACKOFF))
                .unwrap_or(defaults.min_backoff),
            max_backoff: parse_secs(ENV_MAX_BACKOFF, get(ENV_MAX_BACKOFF))
                .unwrap_or(defaults.max_backoff),
        };

        Self {
            enabled: parse_bool(get(ENV_ENABLED), true),
            endpoint: get(ENV_ENDPOINT).and_then(sanitize_non_empty),
            connection_string: get(ENV_CONNECTION_STRING).and_then(sanitize_non_empty),
            replica_endpoints: split_list(get(ENV_REPLICA_ENDPOINTS)),
            refresh_enabled: parse_bool(get(ENV_REFRESH_ENABLED), false),
            refresh_interval: parse_secs(ENV_REFRESH_INTERVAL, get(ENV_REFRESH_INTERVAL)),
            triggers: split_list(get(ENV_REFRESH_TRIGGERS))
                .into_iter()
                .map(|entry| match entry.split_once('|') {
                    Some((key, label)) => WatchedKeyConfig {
                        key: key.trim().to_owned(),
                        label: sanitize_non_empty(label),
                    },
                    None => WatchedKeyConfig {
                        key: entry,
                        label: None,
                    },
                })
                .collect(),
            push_refresh: parse_bool(get(ENV_PUSH_REFRESH), false),
            feature_flags_enabled: parse_bool(get(ENV_FEATURE_FLAGS_ENABLED), false),
            backoff,
        }
    }

    /// Converts the environment settings into a sanitised single-store configuration.
    pub fn into_config(self) -> RefreshConfig {
        let store = StoreConfig {
            endpoint: self.endpoint,
            connection_string: self.connection_string,
            replica_endpoints: self.replica_endpoints,
            monitoring: MonitoringConfig {
                enabled: self.refresh_enabled,
                refresh_interval: self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
                triggers: self.triggers,
                push_notification: self.push_refresh,
            },
            feature_flags: FeatureFlagConfig {
                enabled: self.feature_flags_enabled,
                ..Default::default()
            },
            ..Default::default()
        };
        RefreshConfig {
            enabled: self.enabled,
            refresh_interval: None,
            backoff: self.backoff,
            stores: vec![store],
        }
        .sanitise()
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|raw| raw.split(',').filter_map(sanitize_non_empty).collect())
        .unwrap_or_default()
}

/// Parses a non-negative second count, warning about anything else.
fn parse_secs(name: &str, value: Option<&str>) -> Option<Duration> {
    let raw = value?.trim();
    match raw.parse::<i64>().ok().and_then(|secs| u64::try_from(secs).ok()) {
        Some(secs) => Some(Duration::from_secs(secs)),
        None => {
            warn!("{name} must be a non-negative number of seconds, ignoring {raw:?}");
            None
        }
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
