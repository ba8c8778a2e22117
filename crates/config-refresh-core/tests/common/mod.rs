//! In-memory configuration store shared by the integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use config_refresh_core::{
    classify_status, ClientError, ClientFactory, ConfigurationClient, ConfigurationSetting,
    SettingSelector, StoreConfig,
};

/// One replica endpoint serving key/label tokens, or failing with an HTTP status.
#[derive(Default)]
pub struct InMemoryReplica {
    tokens: Mutex<HashMap<(String, Option<String>), String>>,
    failing_status: Mutex<Option<u16>>,
}

impl InMemoryReplica {
    pub fn put(&self, key: &str, etag: &str) {
        self.tokens
            .lock()
            .unwrap()
            .insert((key.to_string(), None), etag.to_string());
    }

    pub fn token(&self, key: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(&(key.to_string(), None))
            .cloned()
    }

    /// Answers every following request with `status` until cleared with `None`.
    pub fn respond_with(&self, status: Option<u16>) {
        *self.failing_status.lock().unwrap() = status;
    }

    fn check_status(&self) -> Result<(), ClientError> {
        match *self.failing_status.lock().unwrap() {
            Some(status) => classify_status(status),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConfigurationClient for InMemoryReplica {
    async fn fetch_change_token(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<String>, ClientError> {
        self.check_status()?;
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(&(key.to_string(), label.map(str::to_string)))
            .cloned())
    }

    async fn fetch_matching(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, ClientError> {
        self.check_status()?;
        let prefix = selector.key_filter.trim_end_matches('*');
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|((key, label), _)| {
                key.starts_with(prefix) && label.as_deref() == selector.label_filter.as_deref()
            })
            .map(|((key, label), etag)| ConfigurationSetting::new(key.clone(), label.as_deref(), etag.clone()))
            .collect())
    }
}

/// All replicas of all stores, keyed by endpoint.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    replicas: Arc<Mutex<HashMap<String, Arc<InMemoryReplica>>>>,
}

impl InMemoryBackend {
    pub fn replica(&self, endpoint: &str) -> Arc<InMemoryReplica> {
        self.replicas
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    /// Wraps the backend in a closure-based factory.
    pub fn factory(&self) -> Arc<dyn ClientFactory> {
        let backend = self.clone();
        Arc::new(
            move |endpoint: &str, _store: &StoreConfig| -> Arc<dyn ConfigurationClient> {
                backend.replica(endpoint)
            },
        )
    }
}
