//! Reliable-connected Queue Pair.
//!
//! A queue pair is created in the RESET state, becomes ready to send once
//! [`QueuePair::connect`] has been given the peer's [`QpInfo`], and moves to
//! the error state when its peer goes away.
//!
//! SEND semantics follow RC: the gathered bytes land in the peer's oldest
//! posted receive. When the peer has nothing posted the message is held in
//! the peer's backlog and the send completes only once it is placed, the
//! same observable behavior as an infinite RNR retry count.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cq::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
use crate::device::Gid;
use crate::fabric;
use crate::pd::ProtectionDomain;
use crate::transport::QpInfo;

static NEXT_QPN: AtomicU32 = AtomicU32::new(0x40);

/// Queue pair capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpConfig {
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Maximum inline data size.
    pub max_inline_data: u32,
}

impl Default for QpConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 256,
            max_recv_wr: 256,
            max_inline_data: 64,
        }
    }
}

impl QpConfig {
    pub fn with_max_send_wr(mut self, n: u32) -> Self {
        self.max_send_wr = n;
        self
    }

    pub fn with_max_recv_wr(mut self, n: u32) -> Self {
        self.max_recv_wr = n;
        self
    }

    pub fn with_max_inline_data(mut self, n: u32) -> Self {
        self.max_inline_data = n;
        self
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Created, not connected.
    Reset,
    /// Connected; sends and receives are processed.
    ReadyToSend,
    /// Peer gone; outstanding and future receives are flushed.
    Error,
}

/// Scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// SEND work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    /// Immediate data delivered with the receive completion.
    pub imm: Option<u32>,
}

/// RECV work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

/// A message waiting for a receive on the destination queue pair.
struct Inbound {
    data: Vec<u8>,
    imm: Option<u32>,
    sender: Weak<QpInner>,
    wr_id: u64,
}

struct QpShared {
    state: QpState,
    remote: Option<(u16, u32)>,
    recv_queue: VecDeque<RecvWr>,
    backlog: VecDeque<Inbound>,
}

pub(crate) struct QpInner {
    qp_num: u32,
    lid: u16,
    gid: Gid,
    psn: u32,
    config: QpConfig,
    pd: Arc<ProtectionDomain>,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
    outstanding_sends: AtomicUsize,
    shared: Mutex<QpShared>,
}

impl QpInner {
    fn complete_send(&self, wr_id: u64, status: WcStatus) {
        self.outstanding_sends.fetch_sub(1, Ordering::AcqRel);
        self.send_cq.push(WorkCompletion {
            wr_id,
            status,
            opcode: WcOpcode::Send,
            byte_len: 0,
            imm: None,
            qp_num: self.qp_num,
        });
    }

    fn complete_recv(&self, wr_id: u64, status: WcStatus, byte_len: u32, imm: Option<u32>) {
        self.recv_cq.push(WorkCompletion {
            wr_id,
            status,
            opcode: WcOpcode::Recv,
            byte_len,
            imm,
            qp_num: self.qp_num,
        });
    }

    /// Hand an inbound message to this queue pair.
    fn deliver(&self, msg: Inbound) {
        let mut shared = self.shared.lock();
        if shared.state == QpState::Error {
            drop(shared);
            fail_sender(msg, WcStatus::RetryExcErr);
            return;
        }
        if !shared.backlog.is_empty() {
            shared.backlog.push_back(msg);
            return;
        }
        match shared.recv_queue.pop_front() {
            Some(recv) => self.place(recv, msg),
            None => shared.backlog.push_back(msg),
        }
    }

    /// Copy `msg` into the buffer of `recv` and complete both sides.
    fn place(&self, recv: RecvWr, msg: Inbound) {
        let len = msg.data.len();
        if len > recv.sge.length as usize {
            tracing::debug!(
                qp_num = self.qp_num,
                len,
                capacity = recv.sge.length,
                "inbound message larger than posted receive"
            );
            self.complete_recv(recv.wr_id, WcStatus::LocLenErr, 0, None);
            fail_sender(msg, WcStatus::RemInvReqErr);
            return;
        }

        let target = Sge {
            addr: recv.sge.addr,
            length: len as u32,
            lkey: recv.sge.lkey,
        };
        let copied = self.pd.with_sge(&target, true, |dst| {
            // SAFETY: `with_sge` validated `dst..dst + len` against a live
            // registration; the source is an owned Vec.
            unsafe { std::ptr::copy_nonoverlapping(msg.data.as_ptr(), dst, len) };
        });

        match copied {
            Ok(()) => {
                self.complete_recv(recv.wr_id, WcStatus::Success, len as u32, msg.imm);
                if let Some(sender) = msg.sender.upgrade() {
                    sender.complete_send(msg.wr_id, WcStatus::Success);
                }
            }
            Err(e) => {
                tracing::debug!(qp_num = self.qp_num, error = %e, "receive buffer rejected");
                self.complete_recv(recv.wr_id, WcStatus::LocProtErr, 0, None);
                fail_sender(msg, WcStatus::RemInvReqErr);
            }
        }
    }

    /// Move into the error state and flush everything outstanding.
    fn enter_error(&self) {
        let (recvs, backlog) = {
            let mut shared = self.shared.lock();
            shared.state = QpState::Error;
            (
                std::mem::take(&mut shared.recv_queue),
                std::mem::take(&mut shared.backlog),
            )
        };
        for recv in recvs {
            self.complete_recv(recv.wr_id, WcStatus::WrFlushErr, 0, None);
        }
        for msg in backlog {
            fail_sender(msg, WcStatus::RetryExcErr);
        }
    }
}

fn fail_sender(msg: Inbound, status: WcStatus) {
    if let Some(sender) = msg.sender.upgrade() {
        sender.complete_send(msg.wr_id, status);
    }
}

/// Reliable-connected Queue Pair.
pub struct QueuePair {
    inner: Arc<QpInner>,
}

impl QueuePair {
    /// Create a queue pair in the RESET state.
    ///
    /// `send_cq` and `recv_cq` may be the same completion queue.
    pub fn create(
        pd: &Arc<ProtectionDomain>,
        send_cq: &Arc<CompletionQueue>,
        recv_cq: &Arc<CompletionQueue>,
        config: &QpConfig,
    ) -> io::Result<Self> {
        if config.max_send_wr == 0 || config.max_recv_wr == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue pair needs at least one send and one receive work request",
            ));
        }

        let device = pd.device();
        let qp_num = NEXT_QPN.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let inner = Arc::new(QpInner {
            qp_num,
            lid: device.lid(),
            gid: device.gid(),
            psn: qp_num.wrapping_mul(0x9E37_79B1) & 0x00FF_FFFF,
            config: *config,
            pd: Arc::clone(pd),
            send_cq: Arc::clone(send_cq),
            recv_cq: Arc::clone(recv_cq),
            outstanding_sends: AtomicUsize::new(0),
            shared: Mutex::new(QpShared {
                state: QpState::Reset,
                remote: None,
                recv_queue: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
        });
        fabric::attach(inner.lid, qp_num, Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    /// Queue pair number.
    pub fn qp_num(&self) -> u32 {
        self.inner.qp_num
    }

    /// Current state.
    pub fn state(&self) -> QpState {
        self.inner.shared.lock().state
    }

    /// Connection information to hand to the peer.
    pub fn local_info(&self) -> QpInfo {
        QpInfo {
            lid: self.inner.lid,
            qp_num: self.inner.qp_num,
            psn: self.inner.psn,
            gid: self.inner.gid,
        }
    }

    /// Connect to the remote queue pair (RESET → RTS).
    ///
    /// # Errors
    /// `InvalidInput` unless the queue pair is in RESET, `ConnectionRefused`
    /// when no queue pair with the remote address exists.
    pub fn connect(&self, remote: &QpInfo) -> io::Result<()> {
        if fabric::lookup(remote.lid, remote.qp_num).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no queue pair {:#x} at lid {}", remote.qp_num, remote.lid),
            ));
        }

        let mut shared = self.inner.shared.lock();
        if shared.state != QpState::Reset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot connect queue pair in state {:?}", shared.state),
            ));
        }
        shared.remote = Some((remote.lid, remote.qp_num));
        shared.state = QpState::ReadyToSend;
        tracing::trace!(
            qp_num = self.inner.qp_num,
            remote_lid = remote.lid,
            remote_qpn = remote.qp_num,
            "queue pair ready to send"
        );
        Ok(())
    }

    /// Post a receive work request.
    ///
    /// On a queue pair in the error state the request completes immediately
    /// with [`WcStatus::WrFlushErr`].
    ///
    /// # Errors
    /// `OutOfMemory` when `max_recv_wr` receives are already outstanding.
    pub fn post_recv(&self, wr: RecvWr) -> io::Result<()> {
        let mut shared = self.inner.shared.lock();
        match shared.state {
            QpState::Error => {
                drop(shared);
                self.inner
                    .complete_recv(wr.wr_id, WcStatus::WrFlushErr, 0, None);
                return Ok(());
            }
            QpState::Reset | QpState::ReadyToSend => {}
        }
        if let Some(msg) = shared.backlog.pop_front() {
            self.inner.place(wr, msg);
            return Ok(());
        }
        if shared.recv_queue.len() >= self.inner.config.max_recv_wr as usize {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "receive queue full",
            ));
        }
        shared.recv_queue.push_back(wr);
        Ok(())
    }

    /// Post a SEND work request.
    ///
    /// Transport failures are reported as completions on the send CQ; the
    /// returned error only covers requests the queue could not accept.
    ///
    /// # Errors
    /// `NotConnected` unless the queue pair is ready to send, `OutOfMemory`
    /// when `max_send_wr` sends are already outstanding.
    pub fn post_send(&self, wr: SendWr) -> io::Result<()> {
        let remote = {
            let shared = self.inner.shared.lock();
            match (shared.state, shared.remote) {
                (QpState::ReadyToSend, Some(remote)) => remote,
                (state, _) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        format!("cannot post send in state {:?}", state),
                    ));
                }
            }
        };

        let prev = self.inner.outstanding_sends.fetch_add(1, Ordering::AcqRel);
        if prev >= self.inner.config.max_send_wr as usize {
            self.inner.outstanding_sends.fetch_sub(1, Ordering::AcqRel);
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "send queue full",
            ));
        }

        let len = wr.sge.length as usize;
        let gathered = self.inner.pd.with_sge(&wr.sge, false, |src| {
            let mut data = vec![0u8; len];
            // SAFETY: `with_sge` validated `src..src + len` against a live
            // registration.
            unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), len) };
            data
        });
        let data = match gathered {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(qp_num = self.inner.qp_num, error = %e, "send buffer rejected");
                self.inner.complete_send(wr.wr_id, WcStatus::LocProtErr);
                return Ok(());
            }
        };

        let msg = Inbound {
            data,
            imm: wr.imm,
            sender: Arc::downgrade(&self.inner),
            wr_id: wr.wr_id,
        };
        match fabric::lookup(remote.0, remote.1) {
            Some(peer) => peer.deliver(msg),
            None => fail_sender(msg, WcStatus::RetryExcErr),
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        fabric::detach(self.inner.lid, self.inner.qp_num);
        let remote = self.inner.shared.lock().remote;
        self.inner.enter_error();

        if let Some((lid, qp_num)) = remote
            && let Some(peer) = fabric::lookup(lid, qp_num)
        {
            let ours = Some((self.inner.lid, self.inner.qp_num));
            let bound_to_us = {
                let shared = peer.shared.lock();
                shared.remote == ours || shared.state == QpState::Reset
            };
            if bound_to_us {
                tracing::trace!(
                    qp_num = self.inner.qp_num,
                    peer_qpn = qp_num,
                    "peer queue pair moved to error state"
                );
                peer.enter_error();
            }
        }
    }
}
