//! In-process coordination store.
//!
//! Behaves like a single etcd member as far as the registry can observe:
//! leases expire `ttl` after their last renewal and take their keys with
//! them, keep-alive channels renew at a third of the TTL, and every mutation
//! is recorded in an event log that tests use to reason about visibility over
//! time. Faults can be injected per operation.

use super::{CoordinationClient, KeepAliveAck, LeaseId};
use crate::error::CoordinationError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);
const KEEP_ALIVE_BUFFER: usize = 16;

/// Operations that can be made to fail with [`CoordinationError::Unavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// `grant`
    Grant,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// opening a keep-alive channel
    KeepAlive,
    /// `revoke`
    Revoke,
    /// `list`
    List,
}

/// One mutation of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// When it took effect. For expiries this is the lease deadline.
    pub at: Instant,
    /// Affected key
    pub key: String,
    /// What happened
    pub kind: StoreEventKind,
}

/// Kind of [`StoreEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Key written with this value.
    Put(String),
    /// Key deleted explicitly.
    Deleted,
    /// Key removed because its lease was revoked.
    Revoked,
    /// Key removed because its lease expired.
    Expired,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    severed: CancellationToken,
}

struct Entry {
    value: String,
    lease: LeaseId,
}

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    kvs: BTreeMap<String, Entry>,
    events: Vec<StoreEvent>,
    failing: HashSet<FaultOp>,
}

impl State {
    fn check(&self, op: FaultOp) -> Result<(), CoordinationError> {
        if self.failing.contains(&op) {
            return Err(CoordinationError::Unavailable(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<(LeaseId, Instant)> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, lease)| (*id, lease.deadline))
            .collect();

        for (id, deadline) in expired {
            tracing::trace!(lease = id, "lease expired");
            self.drop_lease(id, deadline, StoreEventKind::Expired);
        }
    }

    fn drop_lease(&mut self, id: LeaseId, at: Instant, kind: StoreEventKind) {
        if let Some(lease) = self.leases.remove(&id) {
            lease.severed.cancel();
        }
        let keys: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, e)| e.lease == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.kvs.remove(&key);
            self.events.push(StoreEvent {
                at,
                key,
                kind: kind.clone(),
            });
        }
    }

    fn entries(&self, prefix: &str) -> Vec<(String, String)> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

/// An in-process coordination store.
///
/// Clones share the same data. Hand out [`client`](Self::client)s to
/// components and use the inspection methods from tests.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection to this store.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            state: Arc::clone(&self.state),
            closed: CancellationToken::new(),
        }
    }

    /// Current `(key, value)` pairs under `prefix`, after expiring leases.
    pub fn entries(&self, prefix: &str) -> Vec<(String, String)> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.entries(prefix)
    }

    /// Number of leases that are neither revoked nor expired.
    pub fn live_leases(&self) -> usize {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.leases.len()
    }

    /// Lease bound to `key`, if the key exists.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.kvs.get(key).map(|e| e.lease)
    }

    /// Every mutation so far, in order.
    pub fn events(&self) -> Vec<StoreEvent> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.events.clone()
    }

    /// Make `op` fail (or succeed again) on every client.
    pub fn set_failing(&self, op: FaultOp, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Close the keep-alive channels of `lease` without revoking it, as a
    /// dropped connection would. The lease then expires after its TTL.
    pub fn sever(&self, lease: LeaseId) {
        let mut state = self.state.lock();
        if let Some(l) = state.leases.get_mut(&lease) {
            l.severed.cancel();
            // Later keep-alive channels for the lease are unaffected.
            l.severed = CancellationToken::new();
        }
    }
}

/// A client connection to a [`MemoryCoordinator`].
pub struct MemoryClient {
    state: Arc<Mutex<State>>,
    closed: CancellationToken,
}

impl MemoryClient {
    fn open(&self) -> Result<(), CoordinationError> {
        if self.closed.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        self.open()?;
        let mut state = self.state.lock();
        state.check(FaultOp::Grant)?;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                severed: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), CoordinationError> {
        self.open()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check(FaultOp::Put)?;
        state.expire(now);
        if !state.leases.contains_key(&lease) {
            return Err(CoordinationError::LeaseNotFound(lease));
        }
        state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        state.events.push(StoreEvent {
            at: now,
            key: key.to_string(),
            kind: StoreEventKind::Put(value.to_string()),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.open()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check(FaultOp::Delete)?;
        state.expire(now);
        if state.kvs.remove(key).is_some() {
            state.events.push(StoreEvent {
                at: now,
                key: key.to_string(),
                kind: StoreEventKind::Deleted,
            });
        }
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, CoordinationError> {
        self.open()?;
        let (period, severed) = {
            let mut state = self.state.lock();
            state.check(FaultOp::KeepAlive)?;
            state.expire(Instant::now());
            let l = state
                .leases
                .get(&lease)
                .ok_or(CoordinationError::LeaseNotFound(lease))?;
            ((l.ttl / 3).max(MIN_RENEW_PERIOD), l.severed.clone())
        };

        let (tx, rx) = mpsc::channel(KEEP_ALIVE_BUFFER);
        let state = Arc::clone(&self.state);
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = severed.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let ack = {
                    let now = Instant::now();
                    let mut state = state.lock();
                    state.expire(now);
                    match state.leases.get_mut(&lease) {
                        Some(l) => {
                            l.deadline = now + l.ttl;
                            KeepAliveAck { lease, ttl: l.ttl }
                        }
                        None => break,
                    }
                };
                if tx.send(ack).await.is_err() {
                    break;
                }
            }
            tracing::trace!(lease, "keep-alive channel closed");
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.open()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check(FaultOp::Revoke)?;
        state.expire(now);
        if !state.leases.contains_key(&lease) {
            return Err(CoordinationError::LeaseNotFound(lease));
        }
        state.drop_lease(lease, now, StoreEventKind::Revoked);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinationError> {
        self.open()?;
        let mut state = self.state.lock();
        state.check(FaultOp::List)?;
        state.expire(Instant::now());
        Ok(state.entries(prefix))
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_key_lives_and_dies_with_its_lease() {
        let store = MemoryCoordinator::new();
        let client = store.client();

        let lease = client.grant(Duration::from_secs(3)).await.unwrap();
        client.put("service/task/a", "a", lease).await.unwrap();
        assert_eq!(store.entries("service/task/").len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.entries("service/task/").is_empty());
        assert_eq!(store.live_leases(), 0);
        assert_eq!(
            store.events().last().map(|e| e.kind.clone()),
            Some(StoreEventKind::Expired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_the_lease() {
        let store = MemoryCoordinator::new();
        let client = store.client();

        let lease = client.grant(Duration::from_secs(3)).await.unwrap();
        client.put("k", "v", lease).await.unwrap();
        let mut acks = client.keep_alive(lease).await.unwrap();

        for _ in 0..5 {
            let ack = acks.recv().await.unwrap();
            assert_eq!(ack.lease, lease);
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        // Acks kept flowing into the buffer while we slept, so the key is alive.
        assert_eq!(store.entries("k").len(), 1);

        drop(acks);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(store.entries("k").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sever_closes_the_channel() {
        let store = MemoryCoordinator::new();
        let client = store.client();

        let lease = client.grant(Duration::from_secs(3)).await.unwrap();
        let mut acks = client.keep_alive(lease).await.unwrap();
        acks.recv().await.unwrap();

        store.sever(lease);
        while acks.recv().await.is_some() {}
        assert_eq!(store.live_leases(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.live_leases(), 0);
    }

    #[tokio::test]
    async fn test_revoke_removes_bound_keys() {
        let store = MemoryCoordinator::new();
        let client = store.client();

        let lease = client.grant(Duration::from_secs(30)).await.unwrap();
        client.put("service/user/a", "a", lease).await.unwrap();
        client.put("service/user/b", "b", lease).await.unwrap();
        client.revoke(lease).await.unwrap();

        assert!(client.list("service/user/").await.unwrap().is_empty());
        assert!(matches!(
            client.revoke(lease).await,
            Err(CoordinationError::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let store = MemoryCoordinator::new();
        let client = store.client();
        let lease = client.grant(Duration::from_secs(30)).await.unwrap();

        client.put("service/task/a", "a", lease).await.unwrap();
        client.put("service/taskx/b", "b", lease).await.unwrap();
        client.put("service/user/c", "c", lease).await.unwrap();

        let listed = client.list("service/task/").await.unwrap();
        assert_eq!(listed, vec![("service/task/a".to_string(), "a".to_string())]);
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let client = MemoryCoordinator::new().client();
        assert!(matches!(
            client.put("k", "v", 42).await,
            Err(CoordinationError::LeaseNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_and_close() {
        let store = MemoryCoordinator::new();
        let client = store.client();

        store.set_failing(FaultOp::Grant, true);
        assert!(matches!(
            client.grant(Duration::from_secs(1)).await,
            Err(CoordinationError::Unavailable(_))
        ));
        store.set_failing(FaultOp::Grant, false);
        assert!(client.grant(Duration::from_secs(1)).await.is_ok());

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.list("").await, Err(CoordinationError::Closed)));

        // Other clients of the same store are unaffected.
        assert!(store.client().list("").await.is_ok());
    }
}
