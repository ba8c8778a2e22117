//! Watched settings and feature-flag selectors together with their change check.

use std::collections::HashMap;
use std::fmt;

use crate::client::{ClientError, ConfigurationClient, ConfigurationSetting, SettingSelector};

/// Which of the two independently scheduled concerns a watch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Settings,
    FeatureFlags,
}

impl WatchKind {
    /// Both kinds, in the order a pass checks them.
    pub const ALL: [WatchKind; 2] = [WatchKind::Settings, WatchKind::FeatureFlags];

    pub fn as_str(self) -> &'static str {
        match self {
            WatchKind::Settings => "settings",
            WatchKind::FeatureFlags => "feature_flags",
        }
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key/label pair with the change token observed when it was last loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedSetting {
    pub key: String,
    pub label: Option<String>,
    /// `None` when the setting did not exist at load time.
    pub etag: Option<String>,
}

impl WatchedSetting {
    pub fn new(key: impl Into<String>, label: Option<&str>, etag: Option<&str>) -> Self {
        Self {
            key: key.into(),
            label: label.map(str::to_owned),
            etag: etag.map(str::to_owned),
        }
    }
}

impl From<&ConfigurationSetting> for WatchedSetting {
    fn from(setting: &ConfigurationSetting) -> Self {
        Self {
            key: setting.key.clone(),
            label: setting.label.clone(),
            etag: Some(setting.etag.clone()),
        }
    }
}

/// A feature-flag selector together with the listing observed at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedSelector {
    pub selector: SettingSelector,
    pub settings: Vec<ConfigurationSetting>,
}

impl WatchedSelector {
    pub fn new(selector: SettingSelector, settings: Vec<ConfigurationSetting>) -> Self {
        Self { selector, settings }
    }

    /// Returns the key of the first entry that was added, removed, or modified.
    fn changed_key(&self, live: &[ConfigurationSetting]) -> Option<String> {
        let known: HashMap<(&str, Option<&str>), &str> = self
            .settings
            .iter()
            .map(|s| ((s.key.as_str(), s.label.as_deref()), s.etag.as_str()))
            .collect();

        let modified = live.iter().find(|setting| {
            known.get(&(setting.key.as_str(), setting.label.as_deref())) != Some(&setting.etag.as_str())
        });
        if let Some(setting) = modified {
            return Some(setting.key.clone());
        }
        if live.len() != self.settings.len() {
            // Same entries but fewer of them: something was deleted.
            let removed = self.settings.iter().find(|loaded| {
                !live
                    .iter()
                    .any(|s| s.key == loaded.key && s.label == loaded.label)
            });
            return Some(
                removed
                    .map(|s| s.key.clone())
                    .unwrap_or_else(|| self.selector.key_filter.clone()),
            );
        }
        None
    }
}

/// The watched items of one store, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSet {
    Settings(Vec<WatchedSetting>),
    FeatureFlags(Vec<WatchedSelector>),
}

impl WatchSet {
    pub fn kind(&self) -> WatchKind {
        match self {
            WatchSet::Settings(_) => WatchKind::Settings,
            WatchSet::FeatureFlags(_) => WatchKind::FeatureFlags,
        }
    }

    /// Compares the live change tokens served by `client` with the recorded ones.
    ///
    /// Returns the key of the first changed item and stops probing at that
    /// point. Client errors are returned untouched so the caller can decide
    /// between moving on to another replica and aborting.
    pub async fn detect_change(
        &self,
        client: &dyn ConfigurationClient,
    ) -> Result<Option<String>, ClientError> {
        match self {
            WatchSet::Settings(settings) => {
                for setting in settings {
                    let live = client
                        .fetch_change_token(&setting.key, setting.label.as_deref())
                        .await?;
                    if live != setting.etag {
                        return Ok(Some(setting.key.clone()));
                    }
                }
                Ok(None)
            }
            WatchSet::FeatureFlags(selectors) => {
                for watched in selectors {
                    let live = client.fetch_matching(&watched.selector).await?;
                    if let Some(key) = watched.changed_key(&live) {
                        return Ok(Some(key));
                    }
                }
                Ok(None)
            }
        }
    }
}
