//! Accept loops feeding the shared connection channel.

use super::ListenAddr;
use crate::error::ServerError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) type Connections = mpsc::Sender<io::Result<TcpStream>>;

/// Bind `addr` without accepting yet.
pub(crate) async fn bind(addr: &ListenAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr.bind_addr())
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// A running accept loop.
///
/// The loop owns its socket. Closing cancels the loop's token and waits for
/// it to drop the socket, after which new connections to the port are
/// refused. Connections already handed to the server are unaffected.
pub(crate) struct ListenerHandle {
    local_addr: SocketAddr,
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Start accepting on `listener`, sending every connection to `conns`.
    pub(crate) fn start(
        listener: TcpListener,
        generation: u64,
        conns: Connections,
    ) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: "<bound socket>".to_string(),
            source,
        })?;
        let stop = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, generation, conns, stop.clone()));
        tracing::info!(%local_addr, generation, "listener accepting");
        Ok(Self {
            local_addr,
            generation,
            stop,
            task,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop accepting and wait for the socket to be released.
    pub(crate) async fn close(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(local_addr = %self.local_addr, error = %e, "accept loop ended abnormally");
        }
        tracing::info!(local_addr = %self.local_addr, generation = self.generation, "listener closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    generation: u64,
    conns: Connections,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, generation, "accepted connection");
                    if conns.send(Ok(stream)).await.is_err() {
                        // Server gone.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepts_until_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let addr = ListenAddr::parse("127.0.0.1:0").unwrap();
        let handle = ListenerHandle::start(bind(&addr).await.unwrap(), 1, tx).unwrap();
        let local = handle.local_addr();
        assert_eq!(handle.generation(), 1);

        let _client = TcpStream::connect(local).await.unwrap();
        assert!(rx.recv().await.unwrap().is_ok());

        handle.close().await;
        assert!(TcpStream::connect(local).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let addr = ListenAddr::parse(&format!("127.0.0.1:{port}")).unwrap();

        assert!(matches!(bind(&addr).await, Err(ServerError::Bind { .. })));
    }
}
