//! Connection establishment and endpoints.
//!
//! An [`Endpoint`] is one connected queue pair together with the tasks that
//! poll its completion queues. [`Acceptor`] and [`Connector`] produce
//! endpoints by running the bootstrap handshake over TCP.
//!
//! ```text
//!            CompletionQueue ──notified──▶ CqPoller task
//!                                             │
//!                    ┌────────────────────────┴─────────────────┐
//!                    ▼ Send completion                           ▼ Recv completion
//!        oneshot registered under wr_id                 arrival-ordered channel
//!        (resumes Endpoint::send)                      (drained by next_recv)
//! ```

mod acceptor;
mod connector;

pub use acceptor::Acceptor;
pub use connector::Connector;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;
use verbs::{
    CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair, RecvWr, SendWr, WcOpcode,
    WorkCompletion,
};

use crate::config::ConnConfig;
use crate::error::{Error, Result};

/// Completions polled per batch.
const POLL_BATCH: usize = 64;

/// Destination of the completions of one endpoint.
struct Router {
    pending_sends: Mutex<Slab<oneshot::Sender<WorkCompletion>>>,
    recv_tx: mpsc::UnboundedSender<WorkCompletion>,
}

impl Router {
    fn route(&self, wc: WorkCompletion) {
        match wc.opcode {
            WcOpcode::Send => {
                let waiter = self.pending_sends.lock().try_remove(wc.wr_id as usize);
                match waiter {
                    // The waiter may have been dropped; nothing to resume then.
                    Some(tx) => {
                        let _ = tx.send(wc);
                    }
                    None => tracing::warn!(wr_id = wc.wr_id, "send completion without waiter"),
                }
            }
            WcOpcode::Recv => {
                let _ = self.recv_tx.send(wc);
            }
        }
    }
}

/// Task draining one completion queue. Aborted on drop.
struct CqPoller {
    task: JoinHandle<()>,
}

impl CqPoller {
    fn spawn(cq: Arc<CompletionQueue>, router: Arc<Router>, qp_num: u32) -> Self {
        let span = tracing::debug_span!("cq_poller", qpn = qp_num);
        let task = tokio::spawn(
            async move {
                let mut batch = Vec::with_capacity(POLL_BATCH);
                loop {
                    if cq.poll(&mut batch, POLL_BATCH) == 0 {
                        cq.notified().await;
                        continue;
                    }
                    for wc in batch.drain(..) {
                        tracing::trace!(
                            wr_id = wc.wr_id,
                            opcode = ?wc.opcode,
                            status = %wc.status,
                            byte_len = wc.byte_len,
                            "completion"
                        );
                        router.route(wc);
                    }
                }
            }
            .instrument(span),
        );
        Self { task }
    }
}

impl Drop for CqPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Create a queue pair with either one shared or two dedicated completion
/// queues.
pub(crate) fn create_queue_pair(
    pd: &Arc<ProtectionDomain>,
    config: &ConnConfig,
    shared_cq: bool,
) -> Result<(QueuePair, Vec<Arc<CompletionQueue>>)> {
    let device = pd.device();
    if shared_cq {
        let cq = device.create_cq(config.cq_depth)?;
        let qp = QueuePair::create(pd, &cq, &cq, &config.qp)?;
        Ok((qp, vec![cq]))
    } else {
        let send_cq = device.create_cq(config.cq_depth)?;
        let recv_cq = device.create_cq(config.cq_depth)?;
        let qp = QueuePair::create(pd, &send_cq, &recv_cq, &config.qp)?;
        Ok((qp, vec![send_cq, recv_cq]))
    }
}

fn post_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotConnected {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// One established reliable-connected endpoint.
pub struct Endpoint {
    // Dropped first: the queue pair flushes its peer before pollers stop.
    qp: QueuePair,
    _pollers: Vec<CqPoller>,
    router: Arc<Router>,
    recv_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkCompletion>>,
    pd: Arc<ProtectionDomain>,
    config: ConnConfig,
    user_data: Vec<u8>,
    session_id: Option<u64>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("qp_num", &self.qp.qp_num())
            .field("session_id", &self.session_id)
            .field("user_data_len", &self.user_data.len())
            .finish()
    }
}

impl Endpoint {
    /// Wrap a connected queue pair and start polling its completion queues.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn new(
        qp: QueuePair,
        cqs: Vec<Arc<CompletionQueue>>,
        pd: Arc<ProtectionDomain>,
        config: ConnConfig,
        user_data: Vec<u8>,
        session_id: Option<u64>,
    ) -> Self {
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router {
            pending_sends: Mutex::new(Slab::new()),
            recv_tx,
        });
        let qp_num = qp.qp_num();
        let pollers = cqs
            .into_iter()
            .map(|cq| CqPoller::spawn(cq, Arc::clone(&router), qp_num))
            .collect();

        Self {
            qp,
            _pollers: pollers,
            router,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            pd,
            config,
            user_data,
            session_id,
        }
    }

    /// Local queue pair number.
    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    /// User data the peer sent during the handshake.
    pub fn user_data(&self) -> &[u8] {
        &self.user_data
    }

    /// Session id of a multi-endpoint connection.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Configuration the endpoint was created with.
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Protection domain buffers used with this endpoint must be registered in.
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// Send `len` bytes at `offset` of `mr` and wait for the send completion.
    ///
    /// The buffer must not be modified until this returns.
    pub async fn send(
        &self,
        mr: &MemoryRegion,
        offset: usize,
        len: usize,
        imm: Option<u32>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let wr_id = self.router.pending_sends.lock().insert(tx) as u64;
        let wr = SendWr {
            wr_id,
            sge: mr.sge(offset, len),
            imm,
        };
        if let Err(e) = self.qp.post_send(wr) {
            self.router.pending_sends.lock().try_remove(wr_id as usize);
            return Err(post_error(e));
        }

        let wc = rx.await.map_err(|_| Error::ConnectionClosed)?;
        if !wc.status.is_success() {
            return Err(Error::from_completion(wc.status, wc.wr_id));
        }
        Ok(())
    }

    /// Post a receive of up to `len` bytes at `offset` of `mr`.
    pub fn post_recv(&self, wr_id: u64, mr: &MemoryRegion, offset: usize, len: usize) -> Result<()> {
        self.qp
            .post_recv(RecvWr {
                wr_id,
                sge: mr.sge(offset, len),
            })
            .map_err(post_error)
    }

    /// Wait for the next receive completion, in arrival order.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the peer is gone.
    pub async fn next_recv(&self) -> Result<WorkCompletion> {
        let wc = self
            .recv_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        if !wc.status.is_success() {
            return Err(Error::from_completion(wc.status, wc.wr_id));
        }
        Ok(wc)
    }
}
