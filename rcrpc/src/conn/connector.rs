//! Connecting side of the bootstrap handshake.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::Instrument;
use verbs::ProtectionDomain;

use super::{Endpoint, create_queue_pair};
use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::handshake::{self, EndpointDescriptor, Handshake, MAX_USER_DATA};

/// Opens bootstrap connections and establishes endpoints over them.
pub struct Connector {
    pd: Arc<ProtectionDomain>,
    config: ConnConfig,
}

impl Connector {
    pub fn new(pd: Arc<ProtectionDomain>, config: ConnConfig) -> Self {
        Self { pd, config }
    }

    /// Establish one endpoint with the acceptor at `host:port`.
    ///
    /// `user_data` is handed to the acceptor's endpoint verbatim and echoed
    /// back into the returned endpoint.
    pub async fn connect(&self, host: &str, port: u16, user_data: &[u8]) -> Result<Endpoint> {
        if user_data.len() > MAX_USER_DATA {
            return Err(Error::Handshake(format!(
                "user data of {} bytes exceeds {}",
                user_data.len(),
                MAX_USER_DATA
            )));
        }
        let span = tracing::info_span!("connect", host, port);
        async {
            let mut stream = open(host, port).await?;
            let endpoint = self
                .exchange(&mut stream, user_data, self.config.shared_cq, None)
                .await?;
            tracing::debug!(qpn = endpoint.qp_num(), "endpoint established");
            Ok(endpoint)
        }
        .instrument(span)
        .await
    }

    /// Establish `handshake.endpoint_count` endpoints over one bootstrap
    /// connection, all tagged with `handshake.session_id`.
    ///
    /// Endpoints are returned in exchange order. If an exchange fails the
    /// error is returned and endpoints created before it are released with
    /// the partial result; the acceptor is not told.
    pub async fn connect_multiple(
        &self,
        host: &str,
        port: u16,
        handshake: &Handshake,
    ) -> Result<Vec<Endpoint>> {
        if handshake.endpoint_count == 0 {
            return Err(Error::Handshake("handshake requests zero endpoints".into()));
        }
        let span = tracing::info_span!(
            "connect_multiple",
            host,
            port,
            session_id = handshake.session_id,
            count = handshake.endpoint_count
        );
        async {
            let mut stream = open(host, port).await?;
            handshake::send_handshake(&mut stream, handshake).await?;

            let mut endpoints = Vec::with_capacity(handshake.endpoint_count as usize);
            for _ in 0..handshake.endpoint_count {
                let endpoint = self
                    .exchange(&mut stream, &[], true, Some(handshake.session_id))
                    .await?;
                endpoints.push(endpoint);
            }
            tracing::debug!(count = endpoints.len(), "endpoints established");
            Ok(endpoints)
        }
        .instrument(span)
        .await
    }

    /// Send our descriptor, then connect to the acceptor's reply.
    async fn exchange(
        &self,
        stream: &mut TcpStream,
        user_data: &[u8],
        shared_cq: bool,
        session_id: Option<u64>,
    ) -> Result<Endpoint> {
        let (qp, cqs) = create_queue_pair(&self.pd, &self.config, shared_cq)?;
        let local = EndpointDescriptor {
            qp: qp.local_info(),
            user_data: user_data.to_vec(),
        };
        handshake::send_endpoint(stream, &local).await?;

        let remote = handshake::recv_endpoint(stream).await?;
        qp.connect(&remote.qp)?;

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

async fn open(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
