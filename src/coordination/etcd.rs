//! etcd backend.

use super::{CoordinationClient, KeepAliveAck, LeaseId};
use crate::error::CoordinationError;
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KEEP_ALIVE_BUFFER: usize = 16;

fn unavailable(e: etcd_client::Error) -> CoordinationError {
    CoordinationError::Unavailable(e.to_string())
}

/// etcd reports an expired or unknown lease as `etcdserver: requested lease not found`.
fn lease_gone(message: &str) -> bool {
    message.contains("lease not found")
}

/// [`CoordinationClient`] over an etcd v3 cluster.
///
/// etcd has no explicit client close; [`close`](CoordinationClient::close)
/// stops every keep-alive task and rejects further calls, and the gRPC
/// channel goes away with the last clone of the inner client.
pub struct EtcdCoordinator {
    client: Client,
    ttls: Mutex<HashMap<LeaseId, Duration>>,
    closed: CancellationToken,
}

impl EtcdCoordinator {
    /// Connect to `endpoints` (e.g. `["127.0.0.1:2379"]`).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Unavailable`] if no endpoint answers within
    /// `dial_timeout`.
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(unavailable)?;
        tracing::info!(?endpoints, "connected to etcd");
        Ok(Self {
            client,
            ttls: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    fn client(&self) -> Result<Client, CoordinationError> {
        if self.closed.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        Ok(self.client.clone())
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self
            .client()?
            .lease_grant(secs, None)
            .await
            .map_err(unavailable)?;
        self.ttls.lock().insert(resp.id(), ttl);
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), CoordinationError> {
        self.client()?
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.client()?.delete(key, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<mpsc::Receiver<KeepAliveAck>, CoordinationError> {
        let ttl = self
            .ttls
            .lock()
            .get(&lease)
            .copied()
            .ok_or(CoordinationError::LeaseNotFound(lease))?;
        let (mut keeper, mut stream) = self
            .client()?
            .lease_keep_alive(lease)
            .await
            .map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(KEEP_ALIVE_BUFFER);
        let closed = self.closed.clone();
        let period = (ttl / 3).max(Duration::from_millis(500));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease, error = %e, "etcd keep-alive request failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        let ack = KeepAliveAck {
                            lease,
                            ttl: Duration::from_secs(resp.ttl() as u64),
                        };
                        if tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                    // TTL 0 means the lease is gone.
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!(lease, error = %e, "etcd keep-alive stream failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        match self.client()?.lease_revoke(lease).await {
            Ok(_) => {
                self.ttls.lock().remove(&lease);
                Ok(())
            }
            Err(etcd_client::Error::GRpcStatus(status)) if lease_gone(status.message()) => {
                self.ttls.lock().remove(&lease);
                Err(CoordinationError::LeaseNotFound(lease))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordinationError> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(k), Ok(v)) => pairs.push((k.to_string(), v.to_string())),
                _ => tracing::warn!("skipping non-UTF-8 discovery entry"),
            }
        }
        pairs.sort();
        Ok(pairs)
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.closed.cancel();
        Ok(())
    }
}
