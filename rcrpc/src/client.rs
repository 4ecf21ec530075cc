//! RPC client over one endpoint.
//!
//! ## Framing
//!
//! A request occupies one send slot as `fn_id (u32 LE) | payload` and is sent
//! with the slot index as immediate data. The server answers with the same
//! immediate value, which is how a response finds its call no matter which
//! posted receive buffer it landed in.
//!
//! ## Slots
//!
//! A slot index stays held from acquisition until its response has arrived.
//! If the calling future is dropped in between, the slot is marked orphaned
//! and the response pump releases it once the late response shows up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::RpcConfig;
use crate::conn::Endpoint;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, SlotGuard, SlotPool};

/// Size of the function id prefix of a request.
pub(crate) const FN_ID_LEN: usize = 4;

/// A response that landed in receive buffer `buffer`.
struct Delivered {
    buffer: usize,
    len: usize,
}

enum SlotState {
    Idle,
    Waiting(oneshot::Sender<Delivered>),
    /// The caller is gone; release the slot when the response arrives.
    Orphaned,
}

struct ClientInner {
    endpoint: Endpoint,
    config: RpcConfig,
    send_pool: BufferPool,
    recv_pool: BufferPool,
    slots: SlotPool,
    pending: Mutex<Vec<SlotState>>,
    closed: AtomicBool,
    span: tracing::Span,
}

impl ClientInner {
    fn repost(&self, buffer: usize) -> Result<()> {
        self.endpoint.post_recv(
            buffer as u64,
            self.recv_pool.mr(),
            self.recv_pool.slot_offset(buffer),
            self.recv_pool.slot_size(),
        )
    }

    fn repost_logged(&self, buffer: usize) {
        if let Err(e) = self.repost(buffer) {
            tracing::warn!(buffer, error = %e, "failed to repost response buffer");
        }
    }

    /// Fail every waiting call and refuse new ones.
    fn fail_all(&self, err: &Error) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
        let mut failed = 0usize;
        for state in pending.iter_mut() {
            if matches!(state, SlotState::Waiting(_)) {
                *state = SlotState::Idle;
                failed += 1;
            }
        }
        drop(pending);
        self.slots.close();
        match err {
            Error::ConnectionClosed => tracing::debug!(failed, "connection closed"),
            err => tracing::error!(failed, error = %err, "response pump failed"),
        }
    }

    /// Route each response to the call waiting on its slot.
    async fn pump(self: Arc<Self>) {
        loop {
            let wc = match self.endpoint.next_recv().await {
                Ok(wc) => wc,
                Err(e) => {
                    self.fail_all(&e);
                    return;
                }
            };
            let buffer = wc.wr_id as usize;
            let index = match wc.imm {
                Some(imm) if (imm as usize) < self.slots.num_slots() => imm as usize,
                imm => {
                    tracing::warn!(?imm, "response without a valid slot index");
                    self.repost_logged(buffer);
                    continue;
                }
            };

            let delivered = Delivered {
                buffer,
                len: wc.byte_len as usize,
            };
            let mut pending = self.pending.lock();
            match std::mem::replace(&mut pending[index], SlotState::Idle) {
                SlotState::Waiting(tx) => {
                    if let Err(d) = tx.send(delivered) {
                        drop(pending);
                        self.repost_logged(d.buffer);
                    }
                }
                SlotState::Orphaned => {
                    drop(pending);
                    tracing::trace!(slot = index, "late response released orphaned slot");
                    self.repost_logged(buffer);
                    self.slots.release(index);
                }
                SlotState::Idle => {
                    drop(pending);
                    tracing::warn!(slot = index, "response for idle slot dropped");
                    self.repost_logged(buffer);
                }
            }
        }
    }
}

/// Owns a slot while a call is outstanding; orphans it if the call is
/// abandoned before its response was consumed.
struct Waiter<'a> {
    inner: &'a ClientInner,
    guard: Option<SlotGuard<'a>>,
    rx: oneshot::Receiver<Delivered>,
    done: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(guard) = self.guard.take() else {
            return;
        };
        let index = guard.index();
        let mut pending = self.inner.pending.lock();
        if matches!(pending[index], SlotState::Waiting(_)) {
            pending[index] = SlotState::Orphaned;
            drop(pending);
            guard.detach();
            tracing::trace!(slot = index, "call abandoned, slot orphaned");
        } else {
            drop(pending);
            // The response was routed to us but never read.
            if let Ok(d) = self.rx.try_recv() {
                self.inner.repost_logged(d.buffer);
            }
            drop(guard);
        }
    }
}

/// Issues calls over one endpoint, at most `max_inflight` at a time.
pub struct Client {
    inner: Arc<ClientInner>,
    pump: JoinHandle<()>,
}

impl Client {
    /// Register the slot pools, post every response buffer and start the
    /// response pump.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(endpoint: Endpoint, config: RpcConfig) -> Result<Self> {
        config.validate()?;
        endpoint.config().check_capacity(&config)?;

        let pd = Arc::clone(endpoint.pd());
        let n = config.max_inflight;
        let send_pool = BufferPool::new(&pd, n, config.request_slot_size())?;
        let recv_pool = BufferPool::new(&pd, n, config.max_response_payload.max(1))?;
        let span = tracing::info_span!("rpc_client", qpn = endpoint.qp_num());

        let inner = Arc::new(ClientInner {
            endpoint,
            config,
            send_pool,
            recv_pool,
            slots: SlotPool::new(n),
            pending: Mutex::new((0..n).map(|_| SlotState::Idle).collect()),
            closed: AtomicBool::new(false),
            span,
        });
        for buffer in 0..n {
            inner.repost(buffer)?;
        }

        let pump = tokio::spawn(Arc::clone(&inner).pump().instrument(inner.span.clone()));
        tracing::debug!(parent: &inner.span, max_inflight = n, "client ready");
        Ok(Self { inner, pump })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Slots not held by any call.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available()
    }

    /// Call `fn_id` with `request` and copy the response into `response`.
    ///
    /// Suspends while all slots are taken. Returns the response length.
    ///
    /// # Errors
    /// - [`Error::RequestTooLarge`] if `request` exceeds `max_request_payload`
    /// - [`Error::ResponseTooLarge`] if the response does not fit `response`;
    ///   the connection stays usable
    /// - [`Error::ConnectionClosed`] once the peer is gone
    pub async fn call(&self, fn_id: u32, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let inner = &*self.inner;
        if request.len() > inner.config.max_request_payload {
            return Err(Error::RequestTooLarge {
                len: request.len(),
                max: inner.config.max_request_payload,
            });
        }

        async {
            let guard = inner.slots.acquire().await?;
            let index = guard.index();
            let len = FN_ID_LEN + request.len();
            // SAFETY: the slot is held exclusively and its previous send
            // completed before it was released.
            unsafe {
                let slot = inner.send_pool.slot_mut(index);
                slot[..FN_ID_LEN].copy_from_slice(&fn_id.to_le_bytes());
                slot[FN_ID_LEN..len].copy_from_slice(request);
            }

            let (tx, rx) = oneshot::channel();
            {
                let mut pending = inner.pending.lock();
                if inner.closed.load(Ordering::Acquire) {
                    return Err(Error::ConnectionClosed);
                }
                pending[index] = SlotState::Waiting(tx);
            }
            let mut waiter = Waiter {
                inner,
                guard: Some(guard),
                rx,
                done: false,
            };

            tracing::trace!(slot = index, fn_id, len, "request");
            let sent = inner
                .endpoint
                .send(
                    inner.send_pool.mr(),
                    inner.send_pool.slot_offset(index),
                    len,
                    Some(index as u32),
                )
                .await;
            if let Err(e) = sent {
                // No response follows a failed send; the waiter's guard
                // hands the slot back.
                let mut pending = inner.pending.lock();
                if matches!(pending[index], SlotState::Waiting(_)) {
                    pending[index] = SlotState::Idle;
                }
                drop(pending);
                tracing::debug!(slot = index, error = %e, "request send failed");
                return Err(e);
            }

            let delivered = (&mut waiter.rx)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            waiter.done = true;

            let n = delivered.len;
            let outcome = if n > response.len() {
                Err(Error::ResponseTooLarge {
                    len: n,
                    capacity: response.len(),
                })
            } else {
                // SAFETY: the receive buffer is ours until it is reposted.
                let src = unsafe { &inner.recv_pool.slot(delivered.buffer)[..n] };
                response[..n].copy_from_slice(src);
                Ok(n)
            };
            inner.repost(delivered.buffer)?;
            tracing::trace!(slot = index, len = n, "response");
            outcome
        }
        .instrument(inner.span.clone())
        .await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
