//! Per-store replica selection.
//!
//! A [`ConnectionManager`] owns every [`ReplicaClient`] of one logical store:
//! the statically configured endpoints (origin first, then replicas in
//! configured order) and the failover endpoints discovered at runtime. It
//! answers "which clients may I use right now?" and keeps a coarse health
//! verdict for diagnostics.
//!
//! Static replicas are scanned exhaustively, while failover endpoints are only
//! consulted when every static replica is backed off and yield at most one
//! candidate.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use super::client::ReplicaClient;
use super::failover::FailoverEndpointLookup;
use crate::backoff::BackoffConfig;
use crate::client::ClientFactory;
use crate::clock;
use crate::config::{ConfigError, FeatureFlagConfig, MonitoringConfig, StoreConfig};

/// Connectivity verdict of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreHealth {
    /// No client has been built yet, or the store has no endpoints.
    NotLoaded,
    /// At least one client was usable on the last availability check.
    Up,
    /// Clients exist but every one of them is backed off.
    Down,
}

/// Mutable manager state guarded by a single mutex.
struct ManagerState {
    /// Static clients, built on first access.
    clients: Option<Vec<Arc<ReplicaClient>>>,
    /// Failover clients keyed by endpoint, built as they are discovered.
    failover_clients: HashMap<String, Arc<ReplicaClient>>,
    /// Endpoint that most recently served a successful request.
    current_replica: Option<String>,
    health: StoreHealth,
}

/// Owns the replica clients of one logical store.
pub struct ConnectionManager {
    origin_endpoint: String,
    endpoints: Vec<String>,
    store: StoreConfig,
    factory: Arc<dyn ClientFactory>,
    failover: Arc<dyn FailoverEndpointLookup>,
    backoff: BackoffConfig,
    state: Mutex<ManagerState>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("origin_endpoint", &self.origin_endpoint)
            .field("endpoints", &self.endpoints)
            .field("health", &self.health())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager for `store`, resolving its origin and replica endpoints.
    pub fn from_store(
        store: StoreConfig,
        factory: Arc<dyn ClientFactory>,
        failover: Arc<dyn FailoverEndpointLookup>,
        default_backoff: BackoffConfig,
    ) -> Result<Self, ConfigError> {
        let origin_endpoint = store.origin_endpoint()?;
        let endpoints = store.endpoints()?;
        Ok(Self::new(
            origin_endpoint,
            endpoints,
            store,
            factory,
            failover,
            default_backoff,
        ))
    }

    /// Creates a manager from an explicit endpoint list; the list may be empty.
    pub fn new(
        origin_endpoint: impl Into<String>,
        endpoints: Vec<String>,
        store: StoreConfig,
        factory: Arc<dyn ClientFactory>,
        failover: Arc<dyn FailoverEndpointLookup>,
        default_backoff: BackoffConfig,
    ) -> Self {
        let backoff = store.backoff_or(default_backoff);
        Self {
            origin_endpoint: origin_endpoint.into(),
            endpoints,
            store,
            factory,
            failover,
            backoff,
            state: Mutex::new(ManagerState {
                clients: None,
                failover_clients: HashMap::new(),
                current_replica: None,
                health: StoreHealth::NotLoaded,
            }),
        }
    }

    /// Stable identity of the store.
    pub fn origin_endpoint(&self) -> &str {
        &self.origin_endpoint
    }

    /// Statically configured endpoints, origin first.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn monitoring(&self) -> &MonitoringConfig {
        &self.store.monitoring
    }

    pub fn feature_flags(&self) -> &FeatureFlagConfig {
        &self.store.feature_flags
    }

    /// Backoff bounds applied to this store's replicas.
    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    /// Returns `true` when replicas besides the origin are configured.
    pub fn has_replicas(&self) -> bool {
        self.endpoints.len() > 1
    }

    /// Health as of the last availability check.
    pub fn health(&self) -> StoreHealth {
        self.lock().health
    }

    /// Endpoint that most recently served a successful request.
    pub fn current_client(&self) -> Option<String> {
        self.lock().current_replica.clone()
    }

    /// Returns the clients that may be used now, in preference order.
    ///
    /// With `prefer_current`, static replicas configured before the current
    /// one are skipped. When no static replica is usable, the first available
    /// failover endpoint is returned on its own. An empty list means the store
    /// should be skipped this round.
    pub fn get_available_clients(&self, prefer_current: bool) -> Vec<Arc<ReplicaClient>> {
        let now = clock::now();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let clients = state.clients.get_or_insert_with(|| {
                self.endpoints
                    .iter()
                    .map(|endpoint| self.build_client(endpoint))
                    .collect()
            });

            if clients.is_empty() {
                state.health = StoreHealth::NotLoaded;
                return Vec::new();
            }

            let start = if prefer_current && clients.len() > 1 {
                state
                    .current_replica
                    .as_deref()
                    .and_then(|current| clients.iter().position(|c| c.endpoint() == current))
                    .unwrap_or(0)
            } else {
                0
            };
            let available: Vec<_> = clients[start..]
                .iter()
                .filter(|client| client.is_available(now))
                .cloned()
                .collect();

            if !available.is_empty() {
                state.health = StoreHealth::Up;
                return available;
            }
        }

        // Every static replica is backed off; ask discovery without holding the lock.
        let candidates = self.failover.failover_endpoints(&self.origin_endpoint);
        let mut state = self.lock();
        let mut fallback = None;
        for endpoint in candidates {
            if self.endpoints.contains(&endpoint) {
                continue;
            }
            let client = state
                .failover_clients
                .entry(endpoint)
                .or_insert_with_key(|endpoint| self.build_client(endpoint));
            if client.is_available(now) {
                fallback = Some(client.clone());
                break;
            }
        }

        match fallback {
            Some(client) => {
                debug!(
                    origin = %self.origin_endpoint,
                    endpoint = %client.endpoint(),
                    "config-refresh: static replicas backed off, using failover endpoint"
                );
                state.health = StoreHealth::Up;
                vec![client]
            }
            None => {
                state.health = StoreHealth::Down;
                Vec::new()
            }
        }
    }

    /// Backs off the client serving `endpoint`; unknown endpoints are ignored.
    pub fn backoff_client(&self, endpoint: &str) {
        match self.find_client(endpoint) {
            Some(client) => {
                let delay = client.record_failure(clock::now());
                warn!(
                    origin = %self.origin_endpoint,
                    endpoint = %endpoint,
                    failed_attempts = client.failed_attempts(),
                    backoff_ms = delay.as_millis() as u64,
                    "config-refresh: backing off replica"
                );
            }
            None => {
                debug!(
                    origin = %self.origin_endpoint,
                    endpoint = %endpoint,
                    "config-refresh: ignoring backoff for unknown endpoint"
                );
            }
        }
    }

    /// Clears the failure history of the client serving `endpoint`.
    pub fn record_success(&self, endpoint: &str) {
        if let Some(client) = self.find_client(endpoint) {
            client.reset();
        }
    }

    /// Remembers `endpoint` as the replica to continue from.
    pub fn set_current_client(&self, endpoint: &str) {
        self.lock().current_replica = Some(endpoint.to_owned());
    }

    /// Makes the next preferring lookup start from the origin again.
    pub fn reset_current_client(&self) {
        self.lock().current_replica = None;
    }

    /// Asks the failover lookup to re-resolve this store's candidates.
    pub fn refresh_failover(&self) {
        self.failover.refresh(&self.origin_endpoint);
    }

    /// Returns `true` when `endpoint` is a static or discovered endpoint of this store.
    pub fn owns_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|known| known == endpoint)
            || self.lock().failover_clients.contains_key(endpoint)
    }

    fn find_client(&self, endpoint: &str) -> Option<Arc<ReplicaClient>> {
        let state = self.lock();
        state
            .clients
            .iter()
            .flatten()
            .find(|client| client.endpoint() == endpoint)
            .or_else(|| state.failover_clients.get(endpoint))
            .cloned()
    }

    fn build_client(&self, endpoint: &str) -> Arc<ReplicaClient> {
        Arc::new(ReplicaClient::new(
            endpoint,
            self.factory.create(endpoint, &self.store),
            self.backoff,
        ))
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
