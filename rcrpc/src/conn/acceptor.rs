//! Accepting side of the bootstrap handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;
use verbs::ProtectionDomain;

use super::{Endpoint, create_queue_pair};
use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::handshake::{self, EndpointDescriptor, Handshake};

/// Listens for bootstrap connections and turns each into endpoints.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    pd: Arc<ProtectionDomain>,
    config: ConnConfig,
    closed: watch::Sender<bool>,
}

impl Acceptor {
    /// Bind the bootstrap listener on `port` (0 picks a free port).
    ///
    /// Failing to listen is fatal: the error is logged and the process
    /// aborts.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn new(port: u16, pd: Arc<ProtectionDomain>, config: ConnConfig) -> Self {
        let listener = match bind(port) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind bootstrap listener");
                std::process::abort();
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(port, error = %e, "bootstrap listener has no local address");
                std::process::abort();
            }
        };
        tracing::info!(%local_addr, "acceptor listening");

        Self {
            listener,
            local_addr,
            pd,
            config,
            closed: watch::Sender::new(false),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Pending and later `accept*` calls fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::info!(local_addr = %self.local_addr, "acceptor closed");
        }
    }

    /// Accept one bootstrap connection and establish a single endpoint.
    pub async fn accept(&self) -> Result<Endpoint> {
        let (mut stream, peer) = self.accept_stream().await?;
        let span = tracing::info_span!("accept", %peer);
        async {
            let endpoint = self
                .exchange(&mut stream, self.config.shared_cq, None)
                .await?;
            tracing::debug!(qpn = endpoint.qp_num(), "endpoint established");
            Ok(endpoint)
        }
        .instrument(span)
        .await
    }

    /// Accept one bootstrap connection carrying a handshake record and
    /// establish as many endpoints as it requests.
    ///
    /// Endpoints are returned in exchange order together with the record.
    /// If an exchange fails the error is returned and endpoints created
    /// before it are released with the partial result. The connector is not
    /// told; tearing down the session is up to the caller.
    pub async fn accept_multiple(&self) -> Result<(Vec<Endpoint>, Handshake)> {
        let (mut stream, peer) = self.accept_stream().await?;
        let span = tracing::info_span!("accept_multiple", %peer, session_id = tracing::field::Empty);
        async {
            let hs = handshake::recv_handshake(&mut stream).await?;
            tracing::Span::current().record("session_id", hs.session_id);
            if hs.endpoint_count == 0 {
                return Err(Error::Handshake("handshake requests zero endpoints".into()));
            }

            let mut endpoints = Vec::with_capacity(hs.endpoint_count as usize);
            for _ in 0..hs.endpoint_count {
                let endpoint = self.exchange(&mut stream, true, Some(hs.session_id)).await?;
                endpoints.push(endpoint);
            }
            tracing::debug!(count = endpoints.len(), "endpoints established");
            Ok((endpoints, hs))
        }
        .instrument(span)
        .await
    }

    async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::Closed);
        }
        tokio::select! {
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                stream.set_nodelay(true)?;
                Ok((stream, peer))
            }
            _ = closed.wait_for(|closed| *closed) => Err(Error::Closed),
        }
    }

    /// Receive the connector's descriptor, connect a fresh queue pair to it
    /// and answer with our own carrying the same user data.
    async fn exchange(
        &self,
        stream: &mut TcpStream,
        shared_cq: bool,
        session_id: Option<u64>,
    ) -> Result<Endpoint> {
        let remote = handshake::recv_endpoint(stream).await?;
        let (qp, cqs) = create_queue_pair(&self.pd, &self.config, shared_cq)?;
        qp.connect(&remote.qp)?;

        // The connector's user data is echoed back in the reply.
        let local = EndpointDescriptor {
            qp: qp.local_info(),
            user_data: remote.user_data.clone(),
        };
        handshake::send_endpoint(stream, &local).await?;

        let config = ConnConfig {
            shared_cq,
            ..self.config
        };
        Ok(Endpoint::new(
            qp,
            cqs,
            Arc::clone(&self.pd),
            config,
            remote.user_data,
            session_id,
        ))
    }
}

fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}
