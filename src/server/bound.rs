use super::listener::{self, Connections, ListenerHandle};
use super::{ListenAddr, Registrar};
use crate::coordination::CoordinationClient;
use crate::core::{ChangeKind, ServiceConfig};
use crate::error::ServerError;
use crate::notify::Observer;
use crate::registry::{EndpointRegistry, RegistryOptions};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;

const CONNECTION_BACKLOG: usize = 128;

/// Settings for a [`BoundServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Name the endpoint is advertised under.
    pub service_name: String,
    /// Lease TTL and per-call timeout for each endpoint registry.
    pub registry: RegistryOptions,
}

impl ServerOptions {
    /// Options for `service_name` with default lease timing.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            registry: RegistryOptions::default(),
        }
    }
}

/// Lifecycle phase, published on [`BoundServer::subscribe_phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Not serving yet.
    Unbound,
    /// Accepting on one listener and advertised at `addr`.
    Bound {
        /// Advertised address
        addr: String,
    },
    /// Moving from `from` to the listen address `to`.
    Rebinding {
        /// Advertised address being left
        from: String,
        /// Configured address being bound
        to: String,
    },
    /// `shut_down` is in progress.
    ShuttingDown,
    /// Fully stopped.
    Stopped,
}

/// Result of a successful [`BoundServer::rebind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindOutcome {
    /// Address already current; listener and registry untouched.
    Unchanged,
    /// Not serving yet; the address will be used by `serve`.
    Deferred,
    /// Moved to a new listener and endpoint record.
    Rebound {
        /// Previously advertised address
        from: String,
        /// Newly advertised address
        to: String,
    },
}

struct Bound {
    addr: ListenAddr,
    listener: ListenerHandle,
    registry: Arc<EndpointRegistry>,
}

struct Inner {
    options: ServerOptions,
    client: Arc<dyn CoordinationClient>,
    registrar: Box<dyn Registrar>,
    desired: Mutex<ListenAddr>,
    bound: Mutex<Option<Bound>>,
    transition: tokio::sync::Mutex<()>,
    conns: Connections,
    incoming: Mutex<Option<mpsc::Receiver<io::Result<TcpStream>>>>,
    generation: AtomicU64,
    stopping: AtomicBool,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
}

/// A gRPC server whose listen address and discovery record follow
/// configuration.
///
/// Every listener feeds one connection channel consumed by a single tonic
/// server, so a rebind swaps the socket and the endpoint record while
/// connections already accepted keep being served. Register it as an
/// [`Observer`] of a `ConfigStore<ServiceConfig>` to rebind on
/// `server.addr` changes.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct BoundServer {
    inner: Arc<Inner>,
}

impl BoundServer {
    /// Create an unbound server for `addr`.
    pub fn new(
        addr: ListenAddr,
        client: Arc<dyn CoordinationClient>,
        registrar: impl Registrar,
        options: ServerOptions,
    ) -> Self {
        let (conns, incoming) = mpsc::channel(CONNECTION_BACKLOG);
        let (phase, _) = watch::channel(Phase::Unbound);
        Self {
            inner: Arc::new(Inner {
                options,
                client,
                registrar: Box::new(registrar),
                desired: Mutex::new(addr),
                bound: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
                conns,
                incoming: Mutex::new(Some(incoming)),
                generation: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                phase,
            }),
        }
    }

    /// Bind, advertise and serve until [`shut_down`](Self::shut_down)
    /// completes.
    ///
    /// # Errors
    ///
    /// A failed initial bind or registration is returned as is and nothing is
    /// left running. [`ServerError::AlreadyServing`] on a second call,
    /// [`ServerError::ShuttingDown`] after shutdown began.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        let incoming = {
            let _guard = inner.transition.lock().await;
            if inner.stopping.load(Ordering::Acquire) {
                return Err(ServerError::ShuttingDown);
            }
            if inner.incoming.lock().is_none() {
                return Err(ServerError::AlreadyServing);
            }

            let addr = inner.desired.lock().clone();
            let bound = self.bind_and_register(addr).await?;
            let advertised = bound.registry.address().to_string();
            *inner.bound.lock() = Some(bound);
            inner.phase.send_replace(Phase::Bound { addr: advertised });
            inner
                .incoming
                .lock()
                .take()
                .ok_or(ServerError::AlreadyServing)?
        };

        let mut routes = RoutesBuilder::default();
        inner.registrar.register(&mut routes);

        tracing::info!(service = %inner.options.service_name, "serving");
        let served = Server::builder()
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(
                ReceiverStream::new(incoming),
                inner.shutdown.clone().cancelled_owned(),
            )
            .await;

        if let Err(e) = served {
            tracing::error!(error = %e, "transport server failed");
            if let Err(stop) = self.shut_down().await {
                tracing::warn!(error = %stop, "cleanup after transport failure");
            }
            return Err(ServerError::Transport(e));
        }

        let mut phase = self.subscribe_phase();
        let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
        tracing::info!(service = %inner.options.service_name, "server stopped");
        Ok(())
    }

    /// Stop accepting, withdraw the endpoint, drain in-flight calls and close
    /// the coordination client.
    ///
    /// Safe to call any number of times and from any clone; later calls wait
    /// for the first to finish and return `Ok`.
    ///
    /// # Errors
    ///
    /// Only a failure closing the coordination client is returned. Failing to
    /// withdraw the endpoint is logged, since its lease expires anyway.
    pub async fn shut_down(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            let mut phase = self.subscribe_phase();
            let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
            return Ok(());
        }

        tracing::info!(service = %inner.options.service_name, "shutting down");
        inner.phase.send_replace(Phase::ShuttingDown);

        // Waits out a rebind in progress.
        let _guard = inner.transition.lock().await;
        let bound = inner.bound.lock().take();
        if let Some(bound) = bound {
            bound.listener.close().await;
            if let Err(e) = bound.registry.unregister().await {
                tracing::warn!(key = bound.registry.key(), error = %e, "failed to withdraw endpoint");
            }
        }

        inner.shutdown.cancel();
        let closed = inner.client.close().await;
        inner.phase.send_replace(Phase::Stopped);
        closed.map_err(ServerError::from)
    }

    /// Move to `addr`: bind it, advertise it, then retire the old listener
    /// and record.
    ///
    /// The new endpoint is registered before the old one is withdrawn, so
    /// there is a short window where both are discoverable and none where
    /// neither is. On failure the server stays on its current address with
    /// its record in place.
    ///
    /// # Errors
    ///
    /// The failing bind or registration, or [`ServerError::ShuttingDown`].
    pub async fn rebind(&self, addr: ListenAddr) -> Result<RebindOutcome, ServerError> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(ServerError::ShuttingDown);
        }
        *inner.desired.lock() = addr.clone();
        self.rebind_locked(addr).await
    }

    /// Move to whatever address was last requested.
    ///
    /// Concurrent calls queue on the transition lock and each reads `desired`
    /// only once it holds it, so the last one to run settles on the newest
    /// address no matter how the tasks were scheduled.
    async fn converge(&self) -> Result<RebindOutcome, ServerError> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(ServerError::ShuttingDown);
        }
        let addr = inner.desired.lock().clone();
        self.rebind_locked(addr).await
    }

    /// Caller holds `transition`.
    async fn rebind_locked(&self, addr: ListenAddr) -> Result<RebindOutcome, ServerError> {
        let inner = &self.inner;
        let current = inner
            .bound
            .lock()
            .as_ref()
            .map(|b| (b.addr.clone(), b.registry.address().to_string()));
        let Some((current, advertised)) = current else {
            tracing::debug!(%addr, "not serving yet; address recorded for serve");
            return Ok(RebindOutcome::Deferred);
        };
        if current == addr {
            tracing::debug!(%addr, "listen address unchanged");
            return Ok(RebindOutcome::Unchanged);
        }

        tracing::info!(from = %current, to = %addr, "rebinding");
        inner.phase.send_replace(Phase::Rebinding {
            from: advertised.clone(),
            to: addr.to_string(),
        });

        let next = match self.bind_and_register(addr.clone()).await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(from = %current, to = %addr, error = %e, "rebind failed; keeping current listener");
                inner.phase.send_replace(Phase::Bound { addr: advertised });
                return Err(e);
            }
        };
        let to = next.registry.address().to_string();

        let previous = inner.bound.lock().replace(next);

        if let Some(previous) = previous {
            if let Err(e) = previous.registry.unregister().await {
                tracing::warn!(
                    key = previous.registry.key(),
                    error = %e,
                    "failed to withdraw previous endpoint; it remains until its lease expires"
                );
            }
            previous.listener.close().await;
        }

        inner.phase.send_replace(Phase::Bound { addr: to.clone() });
        tracing::info!(from = %advertised, to = %to, "rebound");
        Ok(RebindOutcome::Rebound {
            from: advertised,
            to,
        })
    }

    /// Configured address currently bound.
    pub fn current_addr(&self) -> Option<ListenAddr> {
        self.inner.bound.lock().as_ref().map(|b| b.addr.clone())
    }

    /// Socket address of the current listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .bound
            .lock()
            .as_ref()
            .map(|b| b.listener.local_addr())
    }

    /// Address currently advertised for discovery.
    pub fn advertised_addr(&self) -> Option<String> {
        self.inner
            .bound
            .lock()
            .as_ref()
            .map(|b| b.registry.address().to_string())
    }

    /// Increments each time a listener is opened; unchanged by no-op rebinds.
    pub fn listener_generation(&self) -> Option<u64> {
        self.inner
            .bound
            .lock()
            .as_ref()
            .map(|b| b.listener.generation())
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.phase.borrow().clone()
    }

    async fn bind_and_register(&self, addr: ListenAddr) -> Result<Bound, ServerError> {
        let inner = &self.inner;
        let socket = listener::bind(&addr).await?;
        let local = socket.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let registry = Arc::new(EndpointRegistry::new(
            Arc::clone(&inner.client),
            inner.options.service_name.clone(),
            addr.advertised(local),
            inner.options.registry,
        ));
        // Dropping `socket` on error releases the port.
        registry.register(&inner.shutdown).await?;

        let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let listener = match ListenerHandle::start(socket, generation, inner.conns.clone()) {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(un) = registry.unregister().await {
                    tracing::warn!(error = %un, "failed to withdraw endpoint after listener failure");
                }
                return Err(e);
            }
        };

        Ok(Bound {
            addr,
            listener,
            registry,
        })
    }
}

impl Observer<ServiceConfig> for BoundServer {
    fn on_config_change(&self, snapshot: &Arc<ServiceConfig>, kind: ChangeKind) {
        if kind != ChangeKind::Server {
            return;
        }
        let addr = match ListenAddr::parse(&snapshot.server.addr) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "ignoring unusable listen address");
                return;
            }
        };
        // Written in notification order, before any task runs.
        *self.inner.desired.lock() = addr.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(%addr, "no async runtime to rebind on; address recorded only");
            return;
        };

        let server = self.clone();
        runtime.spawn(async move {
            // Failures are logged inside; the next change retries.
            let _ = server.converge().await;
        });
    }
}

impl std::fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundServer")
            .field("service", &self.inner.options.service_name)
            .field("phase", &self.phase())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::server::NoServices;

    fn server(store: &MemoryCoordinator, addr: &str) -> BoundServer {
        BoundServer::new(
            ListenAddr::parse(addr).unwrap(),
            Arc::new(store.client()),
            NoServices,
            ServerOptions::new("task"),
        )
    }

    #[tokio::test]
    async fn test_rebind_before_serve_is_deferred() {
        let store = MemoryCoordinator::new();
        let srv = server(&store, "127.0.0.1:0");

        let next = ListenAddr::parse("127.0.0.1:1").unwrap();
        assert_eq!(srv.rebind(next).await.unwrap(), RebindOutcome::Deferred);
        assert_eq!(srv.phase(), Phase::Unbound);
        assert!(store.entries("service/").is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_without_serve() {
        let store = MemoryCoordinator::new();
        let srv = server(&store, "127.0.0.1:0");

        srv.shut_down().await.unwrap();
        srv.shut_down().await.unwrap();
        assert_eq!(srv.phase(), Phase::Stopped);
        assert!(matches!(srv.serve().await, Err(ServerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_address_change_before_serve_is_used_by_serve() {
        let store = MemoryCoordinator::new();
        let srv = server(&store, "127.0.0.1:0");
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let snapshot = Arc::new(ServiceConfig::new(format!("127.0.0.1:{port}"), "in-memory"));
        srv.on_config_change(&snapshot, ChangeKind::Server);
        tokio::task::yield_now().await;
        assert_eq!(srv.phase(), Phase::Unbound);

        let serving = tokio::spawn({
            let srv = srv.clone();
            async move { srv.serve().await }
        });
        let mut phase = srv.subscribe_phase();
        phase
            .wait_for(|p| matches!(p, Phase::Bound { .. }))
            .await
            .unwrap();
        assert_eq!(srv.local_addr().map(|a| a.port()), Some(port));

        srv.shut_down().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_initial_registration_failure_propagates() {
        let store = MemoryCoordinator::new();
        store.set_failing(crate::coordination::FaultOp::Grant, true);
        let srv = server(&store, "127.0.0.1:0");

        assert!(matches!(srv.serve().await, Err(ServerError::Registry(_))));
        assert_eq!(srv.local_addr(), None);
        assert_eq!(srv.phase(), Phase::Unbound);
    }
}
