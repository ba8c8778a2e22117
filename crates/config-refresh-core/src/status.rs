//! Health reporting for embedders.
//!
//! Renders the connectivity verdict of every registered store as JSON, e.g.
//! `{"stores":{"https://a.example.io":"UP"}}`, for hosts that expose it on a
//! diagnostics endpoint.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::replica::{ReplicaClientRegistry, StoreHealth};

/// Serializable view of the registry's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub stores: BTreeMap<String, StoreHealth>,
}

impl HealthSnapshot {
    pub fn from_registry(registry: &ReplicaClientRegistry) -> Self {
        Self {
            stores: registry.health(),
        }
    }

    /// Returns `true` when no store is down. Stores that were never contacted count as healthy.
    pub fn is_healthy(&self) -> bool {
        self.stores.values().all(|health| *health != StoreHealth::Down)
    }

    pub fn to_json(&self) -> Value {
        // A map of strings to unit variants always serialises.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Formats the health of every store as a JSON object.
pub fn health_json(registry: &ReplicaClientRegistry) -> Value {
    HealthSnapshot::from_registry(registry).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RefreshConfig, StoreConfig};
    use crate::refresh::test_support::ScriptedBackend;
    use crate::replica::NoFailover;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn renders_store_health() {
        let config = RefreshConfig {
            stores: vec![
                StoreConfig::with_endpoint("https://a.example.io"),
                StoreConfig::with_endpoint("https://b.example.io"),
            ],
            ..Default::default()
        };
        let registry = ReplicaClientRegistry::new(
            &config,
            Arc::new(ScriptedBackend::default()),
            Arc::new(NoFailover),
        )
        .unwrap();
        registry.get_available_clients("https://a.example.io", false);
        registry.get_available_clients("https://b.example.io", false);
        registry.backoff_client("https://b.example.io", "https://b.example.io");
        registry.get_available_clients("https://b.example.io", false);

        assert_eq!(
            health_json(&registry),
            json!({"stores": {"https://a.example.io": "UP", "https://b.example.io": "DOWN"}})
        );
        assert!(!HealthSnapshot::from_registry(&registry).is_healthy());
    }

    #[test]
    fn empty_registry_renders_empty_map() {
        let registry = ReplicaClientRegistry::from_managers(Vec::new()).unwrap();
        assert_eq!(health_json(&registry), json!({"stores": {}}));
        assert!(HealthSnapshot::from_registry(&registry).is_healthy());
    }
}
