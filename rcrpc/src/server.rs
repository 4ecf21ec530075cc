//! RPC server over one endpoint.
//!
//! [`Server::run`] starts `thread_count` workers on tokio's blocking pool.
//! Each worker owns whichever request buffer its receive completion names,
//! builds the response in the send slot with the same index, sends it, and
//! only then reposts the buffer. Because a buffer is reposted strictly after
//! its response was sent, request buffer `j` and response slot `j` never have
//! two users.
//!
//! Handlers run synchronously on the worker thread; a slow handler occupies
//! one worker until it returns.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::client::FN_ID_LEN;
use crate::config::RpcConfig;
use crate::conn::Endpoint;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::registry::HandlerRegistry;

struct ServerInner {
    endpoint: Endpoint,
    registry: Arc<HandlerRegistry>,
    recv_pool: BufferPool,
    send_pool: BufferPool,
}

impl ServerInner {
    fn repost(&self, buffer: usize) -> Result<()> {
        self.endpoint.post_recv(
            buffer as u64,
            self.recv_pool.mr(),
            self.recv_pool.slot_offset(buffer),
            self.recv_pool.slot_size(),
        )
    }
}

/// Stops the workers of a [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask every worker to exit after its current request.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Triggers shutdown when `run` returns or is cancelled.
struct ShutdownOnDrop(ShutdownHandle);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Serves calls arriving on one endpoint.
pub struct Server {
    inner: Arc<ServerInner>,
    thread_count: usize,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Register the buffer pools and post every request buffer.
    pub fn new(
        endpoint: Endpoint,
        config: RpcConfig,
        registry: Arc<HandlerRegistry>,
        thread_count: usize,
    ) -> Result<Self> {
        config.validate()?;
        endpoint.config().check_capacity(&config)?;
        if thread_count == 0 {
            return Err(Error::Config("server needs at least one worker".into()));
        }

        let pd = Arc::clone(endpoint.pd());
        let n = config.max_inflight;
        let recv_pool = BufferPool::new(&pd, n, config.request_slot_size())?;
        let send_pool = BufferPool::new(&pd, n, config.max_response_payload.max(1))?;
        let inner = Arc::new(ServerInner {
            endpoint,
            registry,
            recv_pool,
            send_pool,
        });
        for buffer in 0..n {
            inner.repost(buffer)?;
        }

        Ok(Self {
            inner,
            thread_count,
            shutdown: ShutdownHandle {
                tx: Arc::new(watch::Sender::new(false)),
            },
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Shorthand for `registry().register_handler(..)`.
    pub fn register_handler<F>(&self, fn_id: u32, handler: F)
    where
        F: Fn(&[u8], &mut [u8]) -> usize + Send + Sync + 'static,
    {
        self.inner.registry.register_handler(fn_id, handler);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the workers until shutdown or the first worker failure.
    ///
    /// Returns `Ok(())` after [`ShutdownHandle::shutdown`]. A worker error
    /// (including [`Error::ConnectionClosed`] when the peer goes away) or
    /// panic stops the other workers and is returned.
    pub async fn run(&self) -> Result<()> {
        let handle = Handle::current();
        let qpn = self.inner.endpoint.qp_num();
        let _stop = ShutdownOnDrop(self.shutdown.clone());

        let mut workers = JoinSet::new();
        for worker in 0..self.thread_count {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown.tx.subscribe();
            let handle = handle.clone();
            workers.spawn_blocking(move || {
                let span = tracing::info_span!("rpc_worker", qpn, worker);
                let _enter = span.enter();
                let res = panic::catch_unwind(AssertUnwindSafe(|| {
                    handle.block_on(worker_loop(&inner, shutdown))
                }));
                (worker, res.unwrap_or(Err(Error::WorkerPanicked(worker))))
            });
        }
        tracing::debug!(qpn, workers = self.thread_count, "server running");

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((worker, Err(e))) => {
                    match &e {
                        Error::ConnectionClosed => tracing::debug!(qpn, worker, "peer disconnected"),
                        Error::WorkerPanicked(_) => tracing::error!(qpn, worker, "worker panicked"),
                        e => tracing::error!(qpn, worker, error = %e, "worker failed"),
                    }
                    Some(e)
                }
                Err(join_err) => Some(Error::Io(std::io::Error::other(join_err))),
            };
            if let Some(e) = failure {
                self.shutdown.shutdown();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// Resolve `fut` unless shutdown is requested first.
async fn unless_shutdown<F: Future>(
    fut: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<F::Output> {
    tokio::select! {
        out = fut => Some(out),
        _ = shutdown.wait_for(|stop| *stop) => None,
    }
}

async fn worker_loop(inner: &ServerInner, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
        let Some(wc) = unless_shutdown(inner.endpoint.next_recv(), &mut shutdown).await else {
            return Ok(());
        };
        let wc = wc?;
        let buffer = wc.wr_id as usize;

        let Some(imm) = wc.imm else {
            tracing::warn!(buffer, "request without slot index dropped");
            inner.repost(buffer)?;
            continue;
        };

        let len = wc.byte_len as usize;
        // SAFETY: buffer `buffer` and response slot `buffer` belong to this
        // worker until the buffer is reposted below.
        let (request, response) = unsafe {
            (
                &inner.recv_pool.slot(buffer)[..len],
                inner.send_pool.slot_mut(buffer),
            )
        };
        let written = if len < FN_ID_LEN {
            tracing::warn!(len, "request shorter than function id");
            0
        } else {
            let mut fn_id = [0u8; FN_ID_LEN];
            fn_id.copy_from_slice(&request[..FN_ID_LEN]);
            let fn_id = u32::from_le_bytes(fn_id);
            inner
                .registry
                .dispatch(fn_id, &request[FN_ID_LEN..], response)
        };

        let sent = unless_shutdown(
            inner
                .endpoint
                .send(inner.send_pool.mr(), inner.send_pool.slot_offset(buffer), written, Some(imm)),
            &mut shutdown,
        )
        .await;
        match sent {
            Some(res) => res?,
            None => return Ok(()),
        }
        inner.repost(buffer)?;
    }
}
