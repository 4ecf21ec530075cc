//! Software reliable-connected verbs.
//!
//! This crate provides the transport primitives rcrpc is written against:
//! devices, protection domains, registered memory regions, completion queues
//! and reliable-connected queue pairs with two-sided SEND/RECV and immediate
//! data. The device is implemented in software. Queue pairs are routed
//! through an in-process fabric, so two connected queue pairs must live in
//! the same process.
//!
//! ```text
//!   QueuePair A                         QueuePair B
//!   post_send(sge, imm) ──── copy ────▶ next posted RECV (FIFO)
//!        │                                   │
//!        ▼                                   ▼
//!   send CQ: Send completion           recv CQ: Recv completion
//!                                      (byte_len, imm)
//! ```
//!
//! Work requests complete in post order per queue. A message that arrives
//! while no receive is posted waits in the receiver's backlog until one is
//! (equivalent to infinite RNR retry).

pub mod cq;
pub mod device;
mod fabric;
pub mod pd;
pub mod qp;
pub mod transport;

pub use cq::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
pub use device::{Device, Gid, PortAttr};
pub use pd::{AccessFlags, MemoryRegion, ProtectionDomain};
pub use qp::{QpConfig, QpState, QueuePair, RecvWr, SendWr, Sge};
pub use transport::QpInfo;
