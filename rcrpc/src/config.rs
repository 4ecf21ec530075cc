//! Configuration types for rcrpc.

use verbs::QpConfig;

use crate::error::{Error, Result};

/// Per-connection RPC configuration.
///
/// Sizes every pre-registered buffer slot and bounds the number of calls in
/// flight on one endpoint. Both ends of a connection must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    /// Largest request payload, excluding the 4-byte function id.
    /// Default: 4096
    pub max_request_payload: usize,
    /// Largest response payload.
    /// Default: 4096
    pub max_response_payload: usize,
    /// Number of slots, i.e. concurrent calls per connection.
    /// Default: 64
    pub max_inflight: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_request_payload: 4096,
            max_response_payload: 4096,
            max_inflight: 64,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum request payload.
    pub fn with_max_request_payload(mut self, bytes: usize) -> Self {
        self.max_request_payload = bytes;
        self
    }

    /// Set the maximum response payload.
    pub fn with_max_response_payload(mut self, bytes: usize) -> Self {
        self.max_response_payload = bytes;
        self
    }

    /// Set the number of concurrent calls.
    pub fn with_max_inflight(mut self, n: usize) -> Self {
        self.max_inflight = n;
        self
    }

    /// Bytes of one request slot (function id + payload).
    pub(crate) fn request_slot_size(&self) -> usize {
        crate::client::FN_ID_LEN + self.max_request_payload
    }

    /// Check that the configuration describes a usable connection.
    pub fn validate(&self) -> Result<()> {
        if self.max_inflight == 0 {
            return Err(Error::Config("max_inflight must be at least 1".into()));
        }
        if self.max_inflight > u32::MAX as usize {
            return Err(Error::Config("max_inflight must fit in immediate data".into()));
        }
        if self.max_response_payload > u32::MAX as usize
            || self.request_slot_size() > u32::MAX as usize
        {
            return Err(Error::Config("payload limits must fit in 32 bits".into()));
        }
        Ok(())
    }
}

/// Endpoint and completion queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnConfig {
    /// Entries per completion queue.
    /// Default: 2048
    pub cq_depth: usize,
    /// Queue pair capabilities.
    pub qp: QpConfig,
    /// Use one completion queue for both directions of a single endpoint.
    /// Multi-endpoint exchanges always share one queue per endpoint.
    /// Default: false
    pub shared_cq: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            cq_depth: 2048,
            qp: QpConfig::default(),
            shared_cq: false,
        }
    }
}

impl ConnConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the completion queue depth.
    pub fn with_cq_depth(mut self, depth: usize) -> Self {
        self.cq_depth = depth;
        self
    }

    /// Set the queue pair capabilities.
    pub fn with_qp(mut self, qp: QpConfig) -> Self {
        self.qp = qp;
        self
    }

    /// Share one completion queue between sends and receives.
    pub fn with_shared_cq(mut self, shared: bool) -> Self {
        self.shared_cq = shared;
        self
    }

    /// Check that an endpoint built with this configuration can carry
    /// `rpc.max_inflight` concurrent calls without dropping completions.
    pub fn check_capacity(&self, rpc: &RpcConfig) -> Result<()> {
        let need = rpc.max_inflight;
        // A shared queue sees both the send and the receive of every call.
        let cq_need = if self.shared_cq { 2 * need } else { need };
        if self.cq_depth < cq_need {
            return Err(Error::Config(format!(
                "cq_depth {} below required {}",
                self.cq_depth, cq_need
            )));
        }
        if (self.qp.max_recv_wr as usize) < need || (self.qp.max_send_wr as usize) < need {
            return Err(Error::Config(format!(
                "queue pair depth (send {}, recv {}) below max_inflight {}",
                self.qp.max_send_wr, self.qp.max_recv_wr, need
            )));
        }
        Ok(())
    }
}

/// Configuration of the typed layer: RPC sizing plus device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedRpcConfig {
    pub rpc: RpcConfig,
    /// Device index.
    /// Default: 0
    pub device_nr: u32,
    /// Port number.
    /// Default: 1
    pub port_nr: u8,
}

impl Default for TypedRpcConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            device_nr: 0,
            port_nr: 1,
        }
    }
}

impl TypedRpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_device(mut self, device_nr: u32, port_nr: u8) -> Self {
        self.device_nr = device_nr;
        self.port_nr = port_nr;
        self
    }

    /// Connection configuration sized for `rpc.max_inflight`.
    pub fn to_conn_config(&self) -> ConnConfig {
        let depth = (2 * self.rpc.max_inflight).max(1);
        let wr = u32::try_from(depth).unwrap_or(u32::MAX);
        ConnConfig {
            cq_depth: depth,
            qp: QpConfig::default()
                .with_max_send_wr(wr)
                .with_max_recv_wr(wr),
            shared_cq: false,
        }
    }
}
