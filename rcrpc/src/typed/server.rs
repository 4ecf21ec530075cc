use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::{AsyncHandler, Handler, MethodHandler, RpcFunction, open_pd};
use crate::config::{RpcConfig, TypedRpcConfig};
use crate::conn::{Acceptor, Endpoint};
use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;
use crate::server::Server;

enum Mode {
    /// Serves one already established endpoint.
    Single(Server),
    /// Accepts connections and serves each on its own [`Server`].
    Listening {
        acceptor: Acceptor,
        config: TypedRpcConfig,
        threads: usize,
    },
}

/// Serves [`RpcFunction`]s registered by type.
pub struct TypedServer {
    registry: Arc<HandlerRegistry>,
    mode: Mode,
    stop: watch::Sender<bool>,
}

impl TypedServer {
    /// Serve `endpoint` with `threads` workers.
    pub fn new(endpoint: Endpoint, config: RpcConfig, threads: usize) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::new());
        let server = Server::new(endpoint, config, Arc::clone(&registry), threads)?;
        Ok(Self {
            registry,
            mode: Mode::Single(server),
            stop: watch::Sender::new(false),
        })
    }

    /// Open the configured device and listen on `port`; every accepted
    /// connection is served by `threads` workers sharing one registry.
    ///
    /// Must be called within a tokio runtime. Failing to listen aborts the
    /// process.
    pub fn bind(port: u16, config: TypedRpcConfig, threads: usize) -> Result<Self> {
        config.rpc.validate()?;
        let conn_config = config.to_conn_config();
        conn_config.check_capacity(&config.rpc)?;
        if threads == 0 {
            return Err(Error::Config("server needs at least one worker".into()));
        }
        let pd = open_pd(&config)?;
        Ok(Self {
            registry: Arc::new(HandlerRegistry::new()),
            mode: Mode::Listening {
                acceptor: Acceptor::new(port, pd, conn_config),
                config,
                threads,
            },
            stop: watch::Sender::new(false),
        })
    }

    /// Bootstrap address when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Single(_) => None,
            Mode::Listening { acceptor, .. } => Some(acceptor.local_addr()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Register `H`. A second registration of the same function aborts.
    pub fn register_handler<H: Handler>(&self) {
        self.registry
            .register_handler(H::ID, |payload: &[u8], out: &mut [u8]| {
                let request = decode_or_abort::<H>(payload);
                encode_response::<H>(&H::call(request), out)
            });
    }

    /// Register `H`, invoked on `receiver`.
    pub fn register_method<H: MethodHandler>(&self, receiver: Arc<H::Receiver>) {
        self.registry
            .register_handler(H::ID, move |payload: &[u8], out: &mut [u8]| {
                let request = decode_or_abort::<H>(payload);
                encode_response::<H>(&H::call(&receiver, request), out)
            });
    }

    /// Asynchronous handlers are not supported; always fails with
    /// [`Error::Unsupported`] and registers nothing.
    pub fn register_async_handler<H: AsyncHandler>(&self) -> Result<()> {
        tracing::error!(
            fn_id = format_args!("{:#010x}", H::ID),
            signature = H::SIGNATURE,
            "asynchronous handlers are not supported"
        );
        Err(Error::Unsupported("asynchronous handlers"))
    }

    /// Stop serving. `run` returns once every connection's workers exited.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        match &self.mode {
            Mode::Single(server) => server.shutdown_handle().shutdown(),
            Mode::Listening { acceptor, .. } => acceptor.close(),
        }
    }

    /// Serve until [`TypedServer::shutdown`].
    ///
    /// A single-endpoint server also returns when its connection fails. A
    /// listening server logs per-connection failures and keeps accepting.
    pub async fn run(&self) -> Result<()> {
        match &self.mode {
            Mode::Single(server) => server.run().await,
            Mode::Listening {
                acceptor,
                config,
                threads,
            } => self.accept_loop(acceptor, config, *threads).await,
        }
    }

    async fn accept_loop(
        &self,
        acceptor: &Acceptor,
        config: &TypedRpcConfig,
        threads: usize,
    ) -> Result<()> {
        let mut connections = JoinSet::new();
        let mut stop = self.stop.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = acceptor.accept() => accepted,
                _ = stop.wait_for(|stop| *stop) => break,
            };
            let endpoint = match accepted {
                Ok(endpoint) => endpoint,
                Err(Error::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "bootstrap exchange failed");
                    continue;
                }
            };

            let qpn = endpoint.qp_num();
            match Server::new(endpoint, config.rpc, Arc::clone(&self.registry), threads) {
                Ok(server) => {
                    let span = tracing::info_span!("connection", qpn);
                    connections.spawn(serve_connection(server, self.stop.subscribe()).instrument(span));
                }
                Err(e) => tracing::error!(qpn, error = %e, "failed to set up connection"),
            }
            while connections.try_join_next().is_some() {}
        }

        self.stop.send_replace(true);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(server: Server, mut stop: watch::Receiver<bool>) {
    let handle = server.shutdown_handle();
    let run = server.run();
    tokio::pin!(run);
    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = stop.wait_for(|stop| *stop) => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            handle.shutdown();
            run.await
        }
    };
    match result {
        Ok(()) => tracing::info!("connection shut down"),
        Err(Error::ConnectionClosed) => tracing::info!("client disconnected"),
        Err(e) => tracing::error!(error = %e, "connection failed"),
    }
}

fn decode_or_abort<H: RpcFunction>(payload: &[u8]) -> H::Request {
    match postcard::from_bytes(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(
                fn_id = format_args!("{:#010x}", H::ID),
                signature = H::SIGNATURE,
                error = %e,
                "failed to decode request"
            );
            std::process::abort();
        }
    }
}

fn encode_response<H: RpcFunction>(response: &H::Response, out: &mut [u8]) -> usize {
    match postcard::to_slice(response, out) {
        Ok(used) => used.len(),
        Err(e) => {
            tracing::error!(
                fn_id = format_args!("{:#010x}", H::ID),
                signature = H::SIGNATURE,
                error = %e,
                "failed to encode response, replying empty"
            );
            0
        }
    }
}
