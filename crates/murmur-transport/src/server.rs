//! Accept loops for the secure and greet listeners.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsStream};

use murmur_core::crypto;
use murmur_core::wire::Frame;
use murmur_core::PeerRef;

use crate::framing::{framed, read_json, FrameError};
use crate::greet;
use crate::handler::{Handler, CONNECT_TIMEOUT};

/// How long a dialer has to send its hello after the TLS handshake.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

impl Handler {
    /// Serve both listeners until the handler's cancellation token fires,
    /// then wait for every connection task to finish.
    pub async fn run(self: Arc<Self>, secure: TcpListener, greet: TcpListener) {
        tracing::info!(
            peer = %self.me.id(),
            secure = ?secure.local_addr().ok(),
            greet = ?greet.local_addr().ok(),
            "transport listening"
        );

        tokio::join!(
            self.clone().accept_secure(secure),
            self.clone().accept_greet(greet),
        );

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("transport stopped");
    }

    async fn accept_secure(self: Arc<Self>, listener: TcpListener) {
        let acceptor = TlsAcceptor::from(self.server_config.clone());

        loop {
            let (tcp, remote) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "secure accept failed");
                        continue;
                    }
                },
            };

            let handler = self.clone();
            let acceptor = acceptor.clone();
            self.tasks.spawn(async move {
                if let Err(e) = handler.serve_secure(acceptor, tcp, remote).await {
                    tracing::warn!(addr = %remote, error = %format!("{e:#}"), "inbound stream rejected");
                }
            });
        }
    }

    /// Authenticate one inbound connection, then read from it until it
    /// ends or the handler shuts down.
    async fn serve_secure(self: Arc<Self>, acceptor: TlsAcceptor, tcp: TcpStream, remote: SocketAddr) -> Result<()> {
        let tls = timeout(CONNECT_TIMEOUT, acceptor.accept(tcp))
            .await
            .map_err(|_| anyhow!("tls handshake timed out"))?
            .context("tls handshake")?;

        let presented = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
            .context("no client certificate")?;

        let mut conn = framed(TlsStream::Server(tls));
        let hello = timeout(HELLO_TIMEOUT, read_json::<_, Frame>(&mut conn))
            .await
            .map_err(|_| FrameError::TimedOut)?
            .context("reading hello")?;
        let Frame::Hello { peer_id } = hello else {
            bail!("first frame was not a hello");
        };

        let peer = self
            .lookup(&peer_id)
            .with_context(|| format!("hello from unknown peer {peer_id}"))?;
        if !crypto::matches_certificate(&peer.public_cert, &presented) {
            bail!("client certificate does not belong to peer {peer_id}");
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(peer = %peer_id, addr = %remote, "inbound secure stream");

        let remote_ref = PeerRef {
            id: peer.id.clone(),
            name: peer.name.clone(),
        };
        let (stream, source) = self.open(remote_ref, conn).await;
        self.read_frames(stream, source).await;
        Ok(())
    }

    async fn accept_greet(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (tcp, remote) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "greet accept failed");
                        continue;
                    }
                },
            };

            let handler = self.clone();
            self.tasks.spawn(async move {
                let served = tokio::select! {
                    _ = handler.cancel.cancelled() => return,
                    r = greet::respond(tcp, remote, &handler.me, &handler.registry) => r,
                };
                if let Err(e) = served {
                    tracing::debug!(addr = %remote, error = %format!("{e:#}"), "greet failed");
                }
            });
        }
    }
}
