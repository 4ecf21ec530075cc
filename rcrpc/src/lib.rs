//! rcrpc - request/response RPC over reliable-connected verbs.
//!
//! # Architecture
//!
//! ```text
//!        Connector ──── TCP bootstrap (handshake + descriptors) ──── Acceptor
//!            │                                                          │
//!            ▼                                                          ▼
//!     Endpoint(s): RC QP + CQ pollers                    Endpoint(s): RC QP + CQ pollers
//!            │                                                          │
//!   ┌────────┴────────┐                                   ┌─────────────┴─────────┐
//!   │ Client          │  SEND fn_id|payload, imm = slot   │ Server                │
//!   │  send/recv pool │ ────────────────────────────────▶ │  N blocking workers   │
//!   │  SlotPool       │ ◀──────────────────────────────── │  HandlerRegistry      │
//!   └─────────────────┘  SEND response, imm = slot        └───────────────────────┘
//!            ▲
//!   ClientMux (round-robin over K clients)
//!            ▲
//!   TypedClient / TypedServer (postcard values, FNV-1a function ids)
//! ```
//!
//! - **Slots**: each connection has `max_inflight` request and response
//!   slots; a call holds one slot index until its response arrived, which is
//!   the only flow control.
//! - **Workers**: server handlers run synchronously on tokio's blocking pool.
//! - **Bootstrap**: endpoints are negotiated over TCP, one or many per
//!   bootstrap connection.
//!
//! Logging goes through `tracing`; binaries install a subscriber with
//! [`log::init`].

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod handshake;
pub mod log;
pub mod mux;
pub mod pool;
pub mod registry;
pub mod server;
pub mod spin_wait;
pub mod typed;

pub use client::Client;
pub use config::{ConnConfig, RpcConfig, TypedRpcConfig};
pub use conn::{Acceptor, Connector, Endpoint};
pub use error::{Direction, Error, Result};
pub use handshake::{EndpointDescriptor, Handshake};
pub use log::LogLevel;
pub use mux::ClientMux;
pub use pool::{BufferPool, SlotGuard, SlotPool};
pub use registry::{HandlerFn, HandlerRegistry};
pub use server::{Server, ShutdownHandle};
pub use spin_wait::block_until_complete;
pub use typed::{
    AsyncHandler, Handler, MethodHandler, RpcCaller, RpcFunction, TypedClient, TypedServer,
    function_id,
};

pub use verbs;
