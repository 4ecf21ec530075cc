//! Completion Queue (CQ) management.
//!
//! A Completion Queue notifies the application when work requests have
//! completed. `poll` drains entries without blocking; `notified` resolves once
//! at least one entry has been pushed since the last wakeup, the software
//! equivalent of a completion channel event.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::device::Device;

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// Operation completed successfully.
    Success,
    /// Inbound message did not fit the posted receive buffer.
    LocLenErr,
    /// Scatter/gather element failed the protection check.
    LocProtErr,
    /// Remote side rejected the request (e.g. receive too small).
    RemInvReqErr,
    /// Work request flushed because the queue pair entered the error state.
    WrFlushErr,
    /// Peer unreachable.
    RetryExcErr,
}

impl WcStatus {
    /// Whether the completion reports success.
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::RemInvReqErr => "remote invalid request error",
            WcStatus::WrFlushErr => "work request flushed",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
        };
        f.write_str(s)
    }
}

/// Operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Requester side of a SEND.
    Send,
    /// Responder side of a SEND (a consumed receive).
    Recv,
}

/// Work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Work request id given at post time.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Operation kind.
    pub opcode: WcOpcode,
    /// Bytes received (receive completions only).
    pub byte_len: u32,
    /// Immediate data carried by the SEND, if any.
    pub imm: Option<u32>,
    /// Queue pair the work request was posted on.
    pub qp_num: u32,
}

/// Completion Queue.
pub struct CompletionQueue {
    depth: usize,
    entries: Mutex<VecDeque<WorkCompletion>>,
    notify: Notify,
    overruns: AtomicU64,
}

impl Device {
    /// Create a completion queue holding up to `depth` entries.
    pub fn create_cq(&self, depth: usize) -> io::Result<Arc<CompletionQueue>> {
        if depth == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "completion queue depth must be positive",
            ));
        }
        Ok(Arc::new(CompletionQueue {
            depth,
            entries: Mutex::new(VecDeque::with_capacity(depth.min(4096))),
            notify: Notify::new(),
            overruns: AtomicU64::new(0),
        }))
    }
}

impl CompletionQueue {
    /// Maximum number of unpolled entries.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Move up to `max` completions into `out`. Returns the number moved.
    pub fn poll(&self, out: &mut Vec<WorkCompletion>, max: usize) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len().min(max);
        out.extend(entries.drain(..n));
        n
    }

    /// Wait until a completion is pushed.
    ///
    /// A push that happens while nobody waits is remembered, so a poll loop of
    /// the form `loop { poll(); notified().await }` never misses an entry.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Number of completions dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub(crate) fn push(&self, wc: WorkCompletion) {
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.depth {
                self.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    depth = self.depth,
                    wr_id = wc.wr_id,
                    qp_num = wc.qp_num,
                    "completion queue overrun, completion dropped"
                );
                return;
            }
            entries.push_back(wc);
        }
        self.notify.notify_one();
    }
}
