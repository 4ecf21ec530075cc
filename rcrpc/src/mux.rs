//! Round-robin fan-out over several clients.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::client::Client;
use crate::config::RpcConfig;
use crate::conn::Endpoint;
use crate::error::{Error, Result};

/// Spreads calls over K independently connected clients.
///
/// Call `i` (in selector order) goes to client `i mod K`. The selector is a
/// single relaxed atomic counter: concurrent callers get an even spread but
/// no ordering between them.
pub struct ClientMux {
    clients: Vec<Client>,
    selector: AtomicU32,
}

impl ClientMux {
    pub fn new(clients: Vec<Client>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::Config("client mux needs at least one client".into()));
        }
        Ok(Self {
            clients,
            selector: AtomicU32::new(0),
        })
    }

    /// Build one [`Client`] per endpoint, all with `config`.
    pub fn from_endpoints(endpoints: Vec<Endpoint>, config: RpcConfig) -> Result<Self> {
        let clients = endpoints
            .into_iter()
            .map(|endpoint| Client::new(endpoint, config))
            .collect::<Result<Vec<_>>>()?;
        Self::new(clients)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn client(&self, index: usize) -> Option<&Client> {
        self.clients.get(index)
    }

    pub fn config(&self) -> &RpcConfig {
        self.clients[0].config()
    }

    /// Index of the client the next call goes to. Advances the selector.
    pub fn next_index(&self) -> usize {
        let ticket = self.selector.fetch_add(1, Ordering::Relaxed);
        ticket as usize % self.clients.len()
    }

    /// Forward a call to the next client in turn.
    pub async fn call(&self, fn_id: u32, request: &[u8], response: &mut [u8]) -> Result<usize> {
        let index = self.next_index();
        self.clients[index].call(fn_id, request, response).await
    }
}
