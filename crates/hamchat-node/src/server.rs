//! Relay server -- TCP accept loop and worker supervision.

use futures::SinkExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use hamchat_protocol::{EnvelopeCodec, ErrorCode, Response};

use crate::config::ServerSection;
use crate::worker::{CloseReason, SessionError, SessionWorker};
use crate::Relay;

/// How long a rejected connection gets to receive its SERVER_FULL reply.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

type WorkerResult = (usize, SocketAddr, Result<CloseReason, SessionError>);

pub struct RelayServer {
    listener: TcpListener,
    relay: Relay,
    shutdown_tx: broadcast::Sender<()>,
    grace: Duration,
}

impl RelayServer {
    /// Bind the listening socket. Failure here is a startup error.
    pub async fn bind(server: &ServerSection, relay: Relay) -> anyhow::Result<Self> {
        Self::bind_addr(&server.listen_addr, server.shutdown_grace(), relay).await
    }

    pub async fn bind_addr(addr: &str, grace: Duration, relay: Relay) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        tracing::info!(
            addr = %listener.local_addr()?,
            max_sessions = relay.registry.capacity(),
            "relay listening"
        );
        Ok(Self {
            listener,
            relay,
            shutdown_tx,
            grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sender for the shutdown signal. One send stops the accept loop and
    /// every session.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Accept connections until shutdown, then wait for the workers.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer, &mut workers),
                        Err(e) => tracing::warn!("accept error: {e}"),
                    }
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }

                _ = shutdown.recv() => {
                    tracing::info!(sessions = workers.len(), "relay shutting down");
                    break;
                }
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = workers.join_next().await {
                log_worker_exit(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                "sessions did not close within grace period, aborting"
            );
            workers.shutdown().await;
        }

        tracing::info!("relay stopped");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, workers: &mut JoinSet<WorkerResult>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "set_nodelay failed: {e}");
        }

        let (outbox_tx, outbox_rx) = mpsc::channel(self.relay.settings.outbox_capacity);
        let handle = match self.relay.registry.acquire(peer, outbox_tx) {
            Ok(handle) => handle,
            Err(e) => {
                tokio::spawn(reject(stream, peer, e.to_string()));
                return;
            }
        };

        let slot = handle.slot();
        tracing::info!(slot, %peer, "connection accepted");
        let worker = SessionWorker::new(
            self.relay.clone(),
            handle,
            stream,
            peer,
            outbox_rx,
            self.shutdown_tx.subscribe(),
        );
        workers.spawn(async move { (slot, peer, worker.run().await) });
    }
}

/// Best-effort SERVER_FULL reply, then close.
async fn reject(stream: TcpStream, peer: SocketAddr, detail: String) {
    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    let response = Response::error(ErrorCode::ServerFull, detail);
    match tokio::time::timeout(REJECT_WRITE_TIMEOUT, framed.send(response.to_envelope())).await {
        Ok(Ok(())) => tracing::info!(%peer, "rejected connection: server full"),
        Ok(Err(e)) => tracing::debug!(%peer, "server-full reply failed: {e}"),
        Err(_) => tracing::debug!(%peer, "server-full reply timed out"),
    }
}

fn log_worker_exit(joined: Result<WorkerResult, tokio::task::JoinError>) {
    match joined {
        Ok((slot, peer, Ok(reason))) => {
            tracing::debug!(slot, %peer, ?reason, "worker finished");
        }
        Ok((slot, peer, Err(e))) => {
            tracing::debug!(slot, %peer, "worker finished with error: {e}");
        }
        Err(e) => tracing::error!("worker task panicked: {e}"),
    }
}
