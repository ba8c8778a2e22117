//! Boundary towards the wire client that talks to a configuration store.
//!
//! The refresh core never issues HTTP requests itself. Hosts plug in an
//! implementation of [`ConfigurationClient`] per replica endpoint through a
//! [`ClientFactory`], and report failures through [`ClientError`] so the core
//! can tell a replica worth skipping apart from a failure that must surface.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreConfig;

/// A configuration entry as returned by the store, reduced to what change detection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationSetting {
    /// Setting key.
    pub key: String,
    /// Optional label; `None` is the store's null label.
    pub label: Option<String>,
    /// Change token (ETag) that differs whenever the value changes.
    pub etag: String,
}

impl ConfigurationSetting {
    /// Convenience constructor used by hosts and tests.
    pub fn new(key: impl Into<String>, label: Option<&str>, etag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.map(str::to_owned),
            etag: etag.into(),
        }
    }
}

/// Key and label filters used to list a group of settings (e.g. all feature flags).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingSelector {
    /// Key filter, may contain the store's wildcard syntax.
    pub key_filter: String,
    /// Label filter; `None` selects the null label.
    pub label_filter: Option<String>,
}

impl SettingSelector {
    pub fn new(key_filter: impl Into<String>, label_filter: Option<&str>) -> Self {
        Self {
            key_filter: key_filter.into(),
            label_filter: label_filter.map(str::to_owned),
        }
    }
}

/// Error taxonomy the wire client reports back to the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The store throttled, timed out, or reported a server-side outage.
    #[error("transient service error: status {status}")]
    Transient { status: u16 },
    /// The request never produced a response (DNS, connect, TLS, reset).
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication, authorisation, or malformed response failures.
    #[error("fatal service error: {0}")]
    Fatal(String),
    /// A status code outside the transient list.
    #[error("unexpected status {status}")]
    Unexpected { status: u16 },
}

impl ClientError {
    /// Returns `true` when the failure should move the check on to the next replica.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Transport(_))
    }
}

/// Maps an HTTP status code to the error taxonomy; `Ok(())` for success codes.
pub fn classify_status(status: u16) -> Result<(), ClientError> {
    match status {
        200..=299 => Ok(()),
        // Request timeout and throttling clear up on another replica or later.
        408 | 429 => Err(ClientError::Transient { status }),
        500..=599 => Err(ClientError::Transient { status }),
        401 | 403 => Err(ClientError::Fatal(format!(
            "credentials rejected with status {status}"
        ))),
        _ => Err(ClientError::Unexpected { status }),
    }
}

/// Wire client for one endpoint of one store.
#[async_trait]
pub trait ConfigurationClient: Send + Sync {
    /// Fetches the current change token of `key`/`label`; `None` when the setting does not exist.
    async fn fetch_change_token(
        &self,
        key: &str,
        label: Option<&str>,
    ) -> Result<Option<String>, ClientError>;

    /// Lists every setting matching `selector`.
    async fn fetch_matching(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, ClientError>;
}

/// Builds wire clients for replica endpoints on demand.
pub trait ClientFactory: Send + Sync {
    /// Creates the client for `endpoint`, which belongs to `store`.
    fn create(&self, endpoint: &str, store: &StoreConfig) -> Arc<dyn ConfigurationClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(&str, &StoreConfig) -> Arc<dyn ConfigurationClient> + Send + Sync,
{
    fn create(&self, endpoint: &str, store: &StoreConfig) -> Arc<dyn ConfigurationClient> {
        self(endpoint, store)
    }
}
