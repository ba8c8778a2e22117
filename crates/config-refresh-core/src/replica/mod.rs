//! Replica-aware connection management.
//!
//! [`ReplicaClient`] tracks the backoff window of one endpoint,
//! [`ConnectionManager`] selects usable clients for one store, and
//! [`ReplicaClientRegistry`] is the multi-store facade handed to the refresh
//! engine and to host loaders.

mod client;
mod failover;
mod manager;
mod registry;

pub use client::ReplicaClient;
pub use failover::{FailoverEndpointLookup, NoFailover, StaticFailoverLookup};
pub use manager::{ConnectionManager, StoreHealth};
pub use registry::ReplicaClientRegistry;
