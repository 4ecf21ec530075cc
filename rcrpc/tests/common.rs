//! Common test utilities for rcrpc integration tests.
//!
//! Every test runs both ends in one process: the software verbs fabric routes
//! queue pairs in-process and the bootstrap listener binds an ephemeral port.

// Test utilities may not all be used in every test file
#![allow(dead_code)]

use std::sync::Arc;

use tokio::task::JoinHandle;

use rcrpc::verbs::{Device, ProtectionDomain};
use rcrpc::{
    Acceptor, Client, ConnConfig, Connector, Endpoint, HandlerRegistry, Result, RpcConfig, Server,
    TypedRpcConfig,
};

/// Loopback host used for every bootstrap connection.
pub const HOST: &str = "127.0.0.1";

/// Open a fresh software device and allocate a protection domain on it.
pub fn open_pd() -> Arc<ProtectionDomain> {
    Device::open(0, 1)
        .and_then(|device| device.alloc_pd())
        .expect("open device")
}

/// Connection configuration able to carry `rpc.max_inflight` calls.
pub fn conn_config(rpc: &RpcConfig) -> ConnConfig {
    TypedRpcConfig::new().with_rpc(*rpc).to_conn_config()
}

/// Establish one endpoint pair over a loopback bootstrap connection.
///
/// Returns `(client_side, server_side)`.
pub async fn connect_pair(rpc: &RpcConfig) -> (Endpoint, Endpoint) {
    let conn = conn_config(rpc);
    let acceptor = Acceptor::new(0, open_pd(), conn);
    let port = acceptor.local_addr().port();
    let connector = Connector::new(open_pd(), conn);

    let (client_side, server_side) = tokio::join!(
        connector.connect(HOST, port, &[]),
        acceptor.accept()
    );
    (
        client_side.expect("connect"),
        server_side.expect("accept"),
    )
}

/// A server running in a background task.
pub struct TestServer {
    pub server: Arc<Server>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    /// Start `server` on a background task.
    pub fn spawn(server: Server) -> Self {
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });
        Self { server, task }
    }

    /// Wait for `run` to return on its own.
    pub async fn join(self) -> Result<()> {
        self.task.await.expect("server task")
    }

    /// Stop the workers and wait for `run` to return.
    pub async fn stop(self) -> Result<()> {
        self.server.shutdown_handle().shutdown();
        self.task.await.expect("server task")
    }
}

/// Test context with one connected client and a running server.
pub struct TestContext {
    /// Client side of the connection
    pub client: Client,
    /// Running server
    pub server: TestServer,
}

impl TestContext {
    /// Connect a client to a server with `threads` workers, after `register`
    /// installed the handlers.
    pub async fn new<F>(rpc: RpcConfig, threads: usize, register: F) -> Self
    where
        F: FnOnce(&HandlerRegistry),
    {
        let (client_side, server_side) = connect_pair(&rpc).await;
        let registry = Arc::new(HandlerRegistry::new());
        register(&registry);

        let server = Server::new(server_side, rpc, registry, threads).expect("server");
        let client = Client::new(client_side, rpc).expect("client");
        Self {
            client,
            server: TestServer::spawn(server),
        }
    }

    /// Stop the server, then drop the client.
    pub async fn shutdown(self) {
        let result = self.server.stop().await;
        drop(self.client);
        result.expect("server run");
    }
}

/// Handler copying the request into the response.
pub fn echo(request: &[u8], response: &mut [u8]) -> usize {
    let n = request.len().min(response.len());
    response[..n].copy_from_slice(&request[..n]);
    n
}
