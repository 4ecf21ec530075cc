use std::future::Future;

use tokio::runtime::Handle;

use super::{RpcFunction, decode, encode, open_pd};
use crate::client::Client;
use crate::config::{RpcConfig, TypedRpcConfig};
use crate::conn::Connector;
use crate::error::{Direction, Error, Result};
use crate::mux::ClientMux;
use crate::spin_wait::block_until_complete;

/// Something that can carry a raw call: a [`Client`] or a [`ClientMux`].
pub trait RpcCaller: Send + Sync {
    fn rpc_config(&self) -> &RpcConfig;

    fn call_raw(
        &self,
        fn_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send;
}

impl RpcCaller for Client {
    fn rpc_config(&self) -> &RpcConfig {
        self.config()
    }

    fn call_raw(
        &self,
        fn_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send {
        self.call(fn_id, request, response)
    }
}

impl RpcCaller for ClientMux {
    fn rpc_config(&self) -> &RpcConfig {
        self.config()
    }

    fn call_raw(
        &self,
        fn_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send {
        self.call(fn_id, request, response)
    }
}

/// Calls [`RpcFunction`]s with typed values.
pub struct TypedClient<C = Client> {
    caller: C,
}

impl<C: RpcCaller> TypedClient<C> {
    pub fn new(caller: C) -> Self {
        Self { caller }
    }

    pub fn inner(&self) -> &C {
        &self.caller
    }

    /// Encode `request`, call `F` and decode its response.
    ///
    /// Encoding and decoding failures are returned as
    /// [`Error::Encode`](crate::Error::Encode) /
    /// [`Error::Decode`](crate::Error::Decode) and leave the connection usable.
    pub async fn call<F: RpcFunction>(&self, request: &F::Request) -> Result<F::Response> {
        let config = self.caller.rpc_config();
        let mut request_buf = vec![0u8; config.max_request_payload];
        let len = encode(request, &mut request_buf, Direction::Request)?;

        let mut response_buf = vec![0u8; config.max_response_payload];
        let n = self
            .caller
            .call_raw(F::ID, &request_buf[..len], &mut response_buf)
            .await?;
        decode(&response_buf[..n], Direction::Response)
    }
}

impl TypedClient<Client> {
    /// Open the configured device and connect one endpoint to `host:port`.
    ///
    /// Must be called within a tokio runtime.
    pub async fn connect(host: &str, port: u16, config: TypedRpcConfig) -> Result<Self> {
        let pd = open_pd(&config)?;
        let endpoint = Connector::new(pd, config.to_conn_config())
            .connect(host, port, &[])
            .await?;
        Ok(Self::new(Client::new(endpoint, config.rpc)?))
    }

    /// [`TypedClient::connect`] for call sites that cannot await, such as a
    /// constructor.
    ///
    /// Spins the calling thread until connected. `handle` must belong to a
    /// multi-threaded runtime that is not running on this thread.
    pub fn connect_blocking(
        handle: &Handle,
        host: &str,
        port: u16,
        config: TypedRpcConfig,
    ) -> Result<Self> {
        let _guard = handle.enter();
        block_until_complete(Self::connect(host, port, config))
    }
}

impl TypedClient<ClientMux> {
    /// Open `connections` independent connections to `host:port` and spread
    /// calls across them round-robin.
    pub async fn connect_pool(
        host: &str,
        port: u16,
        config: TypedRpcConfig,
        connections: usize,
    ) -> Result<Self> {
        if connections == 0 {
            return Err(Error::Config("connection pool needs at least one connection".into()));
        }
        let pd = open_pd(&config)?;
        let connector = Connector::new(pd, config.to_conn_config());
        let mut endpoints = Vec::with_capacity(connections);
        for _ in 0..connections {
            endpoints.push(connector.connect(host, port, &[]).await?);
        }
        Ok(Self::new(ClientMux::from_endpoints(endpoints, config.rpc)?))
    }
}
