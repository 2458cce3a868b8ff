use super::service_key;
use crate::coordination::{CoordinationClient, KeepAliveAck, LeaseId};
use crate::error::{CoordinationError, RegistryError};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lease and request timing for an [`EndpointRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// TTL requested for the lease. Default 15 s.
    pub lease_ttl: Duration,
    /// Upper bound on each coordination call. Default 1 s.
    pub request_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of an [`EndpointRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Never registered, or the last registration attempt failed.
    Inert,
    /// Record written and renewal running.
    Active,
    /// Unregistered, or renewal ended. Terminal.
    Retired,
}

/// Why a renewal loop ended. Only the first cause is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExit {
    /// `unregister` raised the stop signal.
    Stopped,
    /// The token passed to `register` was cancelled.
    Cancelled,
    /// The keep-alive channel closed: the lease expired or the connection
    /// was lost.
    ChannelClosed,
}

#[derive(Default)]
struct RenewalStats {
    count: AtomicU64,
    last: Mutex<Option<Instant>>,
    exit: OnceLock<RenewalExit>,
}

struct Renewal {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Advertises one `(service, address)` pair under a renewed lease.
///
/// A registry is single use: once unregistered (or once its renewal ends)
/// it is [`Retired`](RegistryState::Retired) and a fresh registry is needed
/// to advertise again.
pub struct EndpointRegistry {
    client: Arc<dyn CoordinationClient>,
    service: String,
    address: String,
    key: String,
    options: RegistryOptions,
    lease: RwLock<Option<LeaseId>>,
    state: Arc<RwLock<RegistryState>>,
    renewal: Mutex<Option<Renewal>>,
    stats: Arc<RenewalStats>,
    lifecycle: tokio::sync::Mutex<bool>,
}

impl EndpointRegistry {
    /// Create an inert registry for `address` under `service`.
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        service: impl Into<String>,
        address: impl Into<String>,
        options: RegistryOptions,
    ) -> Self {
        let service = service.into();
        let address = address.into();
        let key = service_key(&service, &address);
        Self {
            client,
            service,
            address,
            key,
            options,
            lease: RwLock::new(None),
            state: Arc::new(RwLock::new(RegistryState::Inert)),
            renewal: Mutex::new(None),
            stats: Arc::new(RenewalStats::default()),
            lifecycle: tokio::sync::Mutex::new(false),
        }
    }

    /// Grant a lease, write the endpoint record bound to it and start renewing.
    ///
    /// Renewal also stops when `cancel` fires. On error the registry stays
    /// [`Inert`](RegistryState::Inert) and no lease is left behind.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyActive`] or [`RegistryError::Retired`] outside
    /// the inert state, otherwise the failing step.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            RegistryState::Inert => {}
            RegistryState::Active => return Err(RegistryError::AlreadyActive),
            RegistryState::Retired => return Err(RegistryError::Retired),
        }

        let lease = self
            .call("grant", self.client.grant(self.options.lease_ttl))
            .await
            .map_err(RegistryError::Grant)?;

        if let Err(source) = self
            .call("put", self.client.put(&self.key, &self.address, lease))
            .await
        {
            self.discard_lease(lease).await;
            return Err(RegistryError::Put {
                key: self.key.clone(),
                source,
            });
        }

        let acks = match self.call("keep_alive", self.client.keep_alive(lease)).await {
            Ok(acks) => acks,
            Err(e) => {
                if let Err(del) = self.call("delete", self.client.delete(&self.key)).await {
                    tracing::warn!(key = %self.key, error = %del, "failed to delete record after keep-alive failure");
                }
                self.discard_lease(lease).await;
                return Err(RegistryError::KeepAlive(e));
            }
        };

        *self.lease.write() = Some(lease);
        *self.state.write() = RegistryState::Active;

        let stop = CancellationToken::new();
        let task = tokio::spawn(renew(
            acks,
            stop.clone(),
            cancel.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.state),
            self.key.clone(),
        ));
        *self.renewal.lock() = Some(Renewal { stop, task });

        tracing::info!(
            service = %self.service,
            address = %self.address,
            lease,
            ttl = ?self.options.lease_ttl,
            "endpoint registered"
        );
        Ok(())
    }

    /// Stop renewing, delete the record and revoke the lease.
    ///
    /// Delete and revoke are both attempted; their failures are reported
    /// together. Calling this again, or on a registry that never registered,
    /// does nothing.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unregister`] when either step failed. The registry is
    /// retired regardless.
    pub async fn unregister(&self) -> Result<(), RegistryError> {
        let mut done = self.lifecycle.lock().await;
        if *done {
            return Ok(());
        }
        *done = true;

        let renewal = self.renewal.lock().take();
        if let Some(renewal) = renewal {
            renewal.stop.cancel();
            let _ = self.stats.exit.set(RenewalExit::Stopped);
            if let Err(e) = renewal.task.await {
                tracing::warn!(key = %self.key, error = %e, "renewal task ended abnormally");
            }
        }
        *self.state.write() = RegistryState::Retired;

        let Some(lease) = self.lease.write().take() else {
            return Ok(());
        };

        let delete = self
            .call("delete", self.client.delete(&self.key))
            .await
            .err();
        let revoke = match self.call("revoke", self.client.revoke(lease)).await {
            // Already expired, which is the outcome revoke was after.
            Err(CoordinationError::LeaseNotFound(_)) | Ok(()) => None,
            Err(e) => Some(e),
        };

        if delete.is_none() && revoke.is_none() {
            tracing::info!(service = %self.service, address = %self.address, lease, "endpoint unregistered");
            Ok(())
        } else {
            Err(RegistryError::Unregister { delete, revoke })
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegistryState {
        *self.state.read()
    }

    /// Lease held while active.
    pub fn lease(&self) -> Option<LeaseId> {
        *self.lease.read()
    }

    /// Advertised address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Discovery key of the record.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of acknowledged renewals.
    pub fn renewals(&self) -> u64 {
        self.stats.count.load(Ordering::Relaxed)
    }

    /// Time of the last acknowledged renewal.
    pub fn last_renewal(&self) -> Option<Instant> {
        *self.stats.last.lock()
    }

    /// Why renewal ended, once it has.
    pub fn renewal_exit(&self) -> Option<RenewalExit> {
        self.stats.exit.get().copied()
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, CoordinationError>>,
    ) -> Result<T, CoordinationError> {
        tokio::time::timeout(self.options.request_timeout, fut)
            .await
            .map_err(|_| CoordinationError::Timeout { op })?
    }

    async fn discard_lease(&self, lease: LeaseId) {
        if let Err(e) = self.call("revoke", self.client.revoke(lease)).await {
            tracing::warn!(lease, error = %e, "failed to revoke lease after failed registration");
        }
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.get_mut().take() {
            renewal.stop.cancel();
        }
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("lease", &self.lease())
            .finish()
    }
}

async fn renew(
    mut acks: mpsc::Receiver<KeepAliveAck>,
    stop: CancellationToken,
    cancel: CancellationToken,
    stats: Arc<RenewalStats>,
    state: Arc<RwLock<RegistryState>>,
    key: String,
) {
    let exit = loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break RenewalExit::Stopped,
            _ = cancel.cancelled() => break RenewalExit::Cancelled,
            ack = acks.recv() => match ack {
                Some(ack) => {
                    stats.count.fetch_add(1, Ordering::Relaxed);
                    *stats.last.lock() = Some(Instant::now());
                    tracing::trace!(%key, lease = ack.lease, ttl = ?ack.ttl, "lease renewed");
                }
                None => break RenewalExit::ChannelClosed,
            },
        }
    };

    if stats.exit.set(exit).is_ok() {
        match exit {
            RenewalExit::ChannelClosed => {
                tracing::error!(%key, "lease keep-alive closed; endpoint is no longer advertised")
            }
            RenewalExit::Cancelled => tracing::debug!(%key, "renewal cancelled"),
            RenewalExit::Stopped => tracing::debug!(%key, "renewal stopped"),
        }
    }
    if exit != RenewalExit::Stopped {
        *state.write() = RegistryState::Retired;
    }
}
