//! Multi-store facade over the connection managers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::client::ReplicaClient;
use super::failover::FailoverEndpointLookup;
use super::manager::{ConnectionManager, StoreHealth};
use crate::client::ClientFactory;
use crate::config::{ConfigError, RefreshConfig};

struct RegistryInner {
    /// Managers in configured store order.
    managers: Vec<Arc<ConnectionManager>>,
    by_origin: HashMap<String, usize>,
}

/// Owns one [`ConnectionManager`] per logical store, keyed by origin endpoint.
///
/// Build exactly one registry per process and hand clones to every consumer:
/// clones share the same managers, so several loaders never open redundant
/// connections to the same store.
#[derive(Clone)]
pub struct ReplicaClientRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ReplicaClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaClientRegistry")
            .field("stores", &self.inner.managers)
            .finish()
    }
}

impl ReplicaClientRegistry {
    /// Creates managers for every enabled store in `config`.
    pub fn new(
        config: &RefreshConfig,
        factory: Arc<dyn ClientFactory>,
        failover: Arc<dyn FailoverEndpointLookup>,
    ) -> Result<Self, ConfigError> {
        let managers = config
            .enabled_stores()
            .map(|store| {
                ConnectionManager::from_store(
                    store.clone(),
                    factory.clone(),
                    failover.clone(),
                    config.backoff,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_managers(managers)
    }

    /// Wraps pre-built managers; origins must be unique.
    pub fn from_managers(managers: Vec<ConnectionManager>) -> Result<Self, ConfigError> {
        let mut by_origin = HashMap::with_capacity(managers.len());
        for (index, manager) in managers.iter().enumerate() {
            let origin = manager.origin_endpoint().to_owned();
            if by_origin.insert(origin.clone(), index).is_some() {
                return Err(ConfigError::DuplicateStore(origin));
            }
        }
        Ok(Self {
            inner: Arc::new(RegistryInner {
                managers: managers.into_iter().map(Arc::new).collect(),
                by_origin,
            }),
        })
    }

    /// Manager of the store identified by `origin_endpoint`.
    pub fn manager(&self, origin_endpoint: &str) -> Option<&Arc<ConnectionManager>> {
        self.inner
            .by_origin
            .get(origin_endpoint)
            .map(|&index| &self.inner.managers[index])
    }

    /// Managers in configured store order.
    pub fn managers(&self) -> impl Iterator<Item = &Arc<ConnectionManager>> + '_ {
        self.inner.managers.iter()
    }

    /// Origin endpoints in configured store order.
    pub fn origins(&self) -> impl Iterator<Item = &str> + '_ {
        self.inner.managers.iter().map(|m| m.origin_endpoint())
    }

    /// Usable clients of a store; empty for unknown stores.
    pub fn get_available_clients(
        &self,
        origin_endpoint: &str,
        prefer_current: bool,
    ) -> Vec<Arc<ReplicaClient>> {
        self.manager(origin_endpoint)
            .map(|manager| manager.get_available_clients(prefer_current))
            .unwrap_or_default()
    }

    pub fn backoff_client(&self, origin_endpoint: &str, endpoint: &str) {
        if let Some(manager) = self.manager(origin_endpoint) {
            manager.backoff_client(endpoint);
        }
    }

    pub fn record_success(&self, origin_endpoint: &str, endpoint: &str) {
        if let Some(manager) = self.manager(origin_endpoint) {
            manager.record_success(endpoint);
        }
    }

    pub fn set_current_client(&self, origin_endpoint: &str, endpoint: &str) {
        if let Some(manager) = self.manager(origin_endpoint) {
            manager.set_current_client(endpoint);
        }
    }

    pub fn reset_current_client(&self, origin_endpoint: &str) {
        if let Some(manager) = self.manager(origin_endpoint) {
            manager.reset_current_client();
        }
    }

    pub fn refresh_failover(&self, origin_endpoint: &str) {
        if let Some(manager) = self.manager(origin_endpoint) {
            manager.refresh_failover();
        }
    }

    /// Maps any replica or failover endpoint to its store's origin.
    ///
    /// Unknown endpoints are returned unchanged since callers only use the
    /// result as a lookup key.
    pub fn find_origin_for_endpoint(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        self.inner
            .managers
            .iter()
            .find(|manager| manager.owns_endpoint(endpoint))
            .map(|manager| manager.origin_endpoint().to_owned())
            .unwrap_or_else(|| endpoint.to_owned())
    }

    pub fn has_replicas(&self, origin_endpoint: &str) -> bool {
        self.manager(origin_endpoint)
            .is_some_and(|manager| manager.has_replicas())
    }

    /// Health of every store keyed by origin endpoint.
    pub fn health(&self) -> BTreeMap<String, StoreHealth> {
        self.inner
            .managers
            .iter()
            .map(|manager| (manager.origin_endpoint().to_owned(), manager.health()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::refresh::test_support::ScriptedBackend;
    use crate::replica::failover::{NoFailover, StaticFailoverLookup};

    fn config() -> RefreshConfig {
        RefreshConfig {
            stores: vec![
                StoreConfig {
                    replica_endpoints: vec!["https://a-west.example.io".into()],
                    ..StoreConfig::with_endpoint("https://a.example.io")
                },
                StoreConfig::with_endpoint("https://b.example.io"),
                StoreConfig {
                    enabled: false,
                    ..StoreConfig::with_endpoint("https://c.example.io")
                },
            ],
            ..Default::default()
        }
    }

    fn registry() -> ReplicaClientRegistry {
        ReplicaClientRegistry::new(
            &config(),
            Arc::new(ScriptedBackend::default()),
            Arc::new(NoFailover),
        )
        .unwrap()
    }

    #[test]
    fn registers_enabled_stores_in_order() {
        let registry = registry();
        assert_eq!(
            registry.origins().collect::<Vec<_>>(),
            vec!["https://a.example.io", "https://b.example.io"]
        );
        assert!(registry.manager("https://c.example.io").is_none());
        assert!(registry.has_replicas("https://a.example.io"));
        assert!(!registry.has_replicas("https://b.example.io"));
        assert!(!registry.has_replicas("https://unknown.example.io"));
    }

    #[test]
    fn duplicate_origins_are_rejected() {
        let config = RefreshConfig {
            stores: vec![
                StoreConfig::with_endpoint("https://a.example.io"),
                StoreConfig::with_endpoint("https://a.example.io/"),
            ],
            ..Default::default()
        };
        let err = ReplicaClientRegistry::new(
            &config,
            Arc::new(ScriptedBackend::default()),
            Arc::new(NoFailover),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStore(origin) if origin == "https://a.example.io"));
    }

    #[test]
    fn clones_share_managers() {
        let registry = registry();
        let clone = registry.clone();
        registry.get_available_clients("https://a.example.io", false);
        registry.backoff_client("https://a.example.io", "https://a.example.io");

        let available = clone.get_available_clients("https://a.example.io", false);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].endpoint(), "https://a-west.example.io");
        assert!(Arc::ptr_eq(
            registry.manager("https://a.example.io").unwrap(),
            clone.manager("https://a.example.io").unwrap()
        ));
    }

    #[test]
    fn reverse_lookup_falls_back_to_identity() {
        let registry = registry();
        assert_eq!(
            registry.find_origin_for_endpoint("https://a-west.example.io/"),
            "https://a.example.io"
        );
        assert_eq!(
            registry.find_origin_for_endpoint("https://b.example.io"),
            "https://b.example.io"
        );
        assert_eq!(
            registry.find_origin_for_endpoint("https://stray.example.io"),
            "https://stray.example.io"
        );
    }

    #[test]
    fn reverse_lookup_sees_discovered_failover_endpoints() {
        let lookup = Arc::new(StaticFailoverLookup::new());
        lookup.set_endpoints("https://b.example.io", vec!["https://b-dr.example.io".into()]);
        let registry = ReplicaClientRegistry::new(
            &config(),
            Arc::new(ScriptedBackend::default()),
            lookup,
        )
        .unwrap();

        registry.get_available_clients("https://b.example.io", false);
        registry.backoff_client("https://b.example.io", "https://b.example.io");
        registry.get_available_clients("https://b.example.io", false);

        assert_eq!(
            registry.find_origin_for_endpoint("https://b-dr.example.io"),
            "https://b.example.io"
        );
    }

    #[test]
    fn health_reports_every_store() {
        let registry = registry();
        registry.get_available_clients("https://b.example.io", false);
        registry.backoff_client("https://b.example.io", "https://b.example.io");
        registry.get_available_clients("https://b.example.io", false);

        let health = registry.health();
        assert_eq!(health["https://a.example.io"], StoreHealth::NotLoaded);
        assert_eq!(health["https://b.example.io"], StoreHealth::Down);
    }

    #[test]
    fn unknown_stores_are_soft_failures() {
        let registry = registry();
        assert!(registry
            .get_available_clients("https://unknown.example.io", true)
            .is_empty());
        registry.backoff_client("https://unknown.example.io", "https://x.example.io");
        registry.set_current_client("https://unknown.example.io", "https://x.example.io");
        assert!(registry.health().get("https://unknown.example.io").is_none());
    }
}
