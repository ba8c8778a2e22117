//! Shared fixtures for refresh and replica tests.
//!
//! [`ScriptedClient`] plays the wire client: tests script the change tokens
//! and listings it serves and queue the failures it should raise.
//! [`ScriptedBackend`] hands out one scripted client per endpoint so tests can
//! steer replicas independently.

#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{
    ClientError, ClientFactory, ConfigurationClient, ConfigurationSetting, SettingSelector,
};
use crate::config::{FeatureFlagConfig, MonitoringConfig, StoreConfig, WatchedKeyConfig};

/// Primary endpoint used across the refresh tests.
pub(crate) const PRIMARY: &str = "https://primary.example.io";
/// First replica of [`PRIMARY`].
pub(crate) const REPLICA: &str = "https://replica.example.io";
/// A second, independent store.
pub(crate) const OTHER_STORE: &str = "https://other.example.io";

/// In-memory wire client driven by the test.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    tokens: Mutex<HashMap<(String, Option<String>), String>>,
    listings: Mutex<HashMap<SettingSelector, Vec<ConfigurationSetting>>>,
    queued_failures: Mutex<VecDeque<ClientError>>,
    persistent_failure: Mutex<Option<ClientError>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    /// Serves `etag` for `key`/`label` from now on.
    pub(crate) fn set_token(&self, key: &str, label: Option<&str>, etag: &str) {
        self.tokens
            .lock()
            .unwrap()
            .insert((key.to_owned(), label.map(str::to_owned)), etag.to_owned());
    }

    /// Serves `settings` for every listing of `selector`.
    pub(crate) fn set_listing(&self, selector: SettingSelector, settings: Vec<ConfigurationSetting>) {
        self.listings.lock().unwrap().insert(selector, settings);
    }

    /// Fails the next request with `error`.
    pub(crate) fn fail_next(&self, error: ClientError) {
        self.queued_failures.lock().unwrap().push_back(error);
    }

    /// Fails every request with `error` until [`ScriptedClient::recover`] is called.
    pub(crate) fn fail_always(&self, error: ClientError) {
        *self.persistent_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn recover(&self) {
        *self.persistent_failure.lock().unwrap() = None;
    }

    /// Number of requests served so far, failed ones included.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_failure(&self) -> Option<ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Hand control back once so concurrent passes can interleave.
        tokio::task::yield_now().await;
        if let Some(error) = self.queued_failures.lock().unwrap().pop_front() {
            return Some(error);
        }
        self.persistent_failure.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigurationClient for ScriptedClient {
    async fn fetch_change_token(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<String>, ClientError> {
        if let Some(error) = self.next_failure().await {
            return Err(error);
        }
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(&(key.to_owned(), label.map(str::to_owned)))
            .cloned())
    }

    async fn fetch_matching(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, ClientError> {
        if let Some(error) = self.next_failure().await {
            return Err(error);
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }
}

/// Client factory handing out one [`ScriptedClient`] per endpoint.
#[derive(Default, Clone)]
pub(crate) struct ScriptedBackend {
    clients: Arc<Mutex<HashMap<String, Arc<ScriptedClient>>>>,
}

impl ScriptedBackend {
    /// Returns the scripted client of `endpoint`, creating it on first use.
    pub(crate) fn client(&self, endpoint: &str) -> Arc<ScriptedClient> {
        self.clients
            .lock()
            .unwrap()
            .entry(endpoint.to_owned())
            .or_default()
            .clone()
    }

    /// Applies `etag` for `key` on every listed endpoint.
    pub(crate) fn set_token_everywhere(&self, endpoints: &[&str], key: &str, etag: &str) {
        for endpoint in endpoints {
            self.client(endpoint).set_token(key, None, etag);
        }
    }
}

impl ClientFactory for ScriptedBackend {
    fn create(&self, endpoint: &str, _store: &StoreConfig) -> Arc<dyn ConfigurationClient> {
        self.client(endpoint)
    }
}

/// Store watching `keys` (null label) every `interval`, with optional replicas.
pub(crate) fn monitored_store(
    endpoint: &str,
    replicas: &[&str],
    keys: &[&str],
    interval: Duration,
) -> StoreConfig {
    StoreConfig {
        replica_endpoints: replicas.iter().map(|r| r.to_string()).collect(),
        monitoring: MonitoringConfig {
            enabled: true,
            refresh_interval: interval,
            triggers: keys
                .iter()
                .map(|key| WatchedKeyConfig {
                    key: key.to_string(),
                    label: None,
                })
                .collect(),
            push_notification: false,
        },
        ..StoreConfig::with_endpoint(endpoint)
    }
}

/// Store watching only its feature flags (default selector) every `interval`.
pub(crate) fn feature_flag_store(endpoint: &str, interval: Duration) -> StoreConfig {
    StoreConfig {
        feature_flags: FeatureFlagConfig {
            enabled: true,
            refresh_interval: interval,
            selects: Vec::new(),
        },
        ..StoreConfig::with_endpoint(endpoint)
    }
}
