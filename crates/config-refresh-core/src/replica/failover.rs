//! Sources of dynamically discovered failover endpoints.
//!
//! Stores may advertise replicas outside the static configuration (for example
//! through DNS service records). Discovery itself belongs to the host; the
//! connection manager only asks for the current candidates of an origin.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Supplies failover endpoints for a store, in preference order.
pub trait FailoverEndpointLookup: Send + Sync {
    /// Returns the currently known failover endpoints of `origin_endpoint`.
    fn failover_endpoints(&self, origin_endpoint: &str) -> Vec<String>;

    /// Re-resolves the candidates of `origin_endpoint`; called once per refresh pass.
    fn refresh(&self, _origin_endpoint: &str) {}
}

/// Lookup for deployments without dynamic discovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailover;

impl FailoverEndpointLookup for NoFailover {
    fn failover_endpoints(&self, _origin_endpoint: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Lookup fed by the host, e.g. from its own service-discovery loop.
#[derive(Debug, Default)]
pub struct StaticFailoverLookup {
    endpoints: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticFailoverLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the failover candidates of `origin_endpoint`.
    pub fn set_endpoints(&self, origin_endpoint: impl Into<String>, endpoints: Vec<String>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin_endpoint.into(), endpoints);
    }
}

impl FailoverEndpointLookup for StaticFailoverLookup {
    fn failover_endpoints(&self, origin_endpoint: &str) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin_endpoint)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup_returns_configured_candidates() {
        let lookup = StaticFailoverLookup::new();
        assert!(lookup.failover_endpoints("https://a.example.io").is_empty());
        lookup.set_endpoints(
            "https://a.example.io",
            vec!["https://a-east.example.io".into()],
        );
        assert_eq!(
            lookup.failover_endpoints("https://a.example.io"),
            vec!["https://a-east.example.io".to_string()]
        );
        assert!(NoFailover.failover_endpoints("https://a.example.io").is_empty());
    }
}
