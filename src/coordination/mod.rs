//! Coordination store contract.
//!
//! The registry talks to an etcd-like store through [`CoordinationClient`]:
//! leases with a TTL, keys bound to leases, a keep-alive channel per lease and
//! prefix listing for discovery. [`MemoryCoordinator`] implements it in
//! process; with the `etcd` feature, `EtcdCoordinator` implements it
//! over a real etcd cluster.

use crate::error::CoordinationError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

mod memory;
#[cfg(feature = "etcd")]
mod etcd;

pub use memory::{FaultOp, MemoryClient, MemoryCoordinator, StoreEvent, StoreEventKind};
#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinator;

/// Lease identifier assigned by the store.
pub type LeaseId = i64;

/// One successful lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    /// Renewed lease
    pub lease: LeaseId,
    /// Time to live granted by this renewal
    pub ttl: Duration,
}

/// Operations the registry needs from the coordination store.
///
/// `keep_alive` returns a channel that yields an ack per renewal and closes
/// when renewal stops for any reason (lease expired or revoked, connection
/// lost, client closed). Dropping the receiver stops renewing.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Grant a lease that expires `ttl` after its last renewal.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinationError>;

    /// Write `key = value`, bound to `lease`.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CoordinationError>;

    /// Keep `lease` alive until the returned receiver is dropped.
    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, CoordinationError>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// List `(key, value)` pairs under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinationError>;

    /// Close the connection. Open keep-alive channels close with it.
    async fn close(&self) -> Result<(), CoordinationError>;
}
