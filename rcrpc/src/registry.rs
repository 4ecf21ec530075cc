//! Function id → handler registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A raw handler: reads the request payload, writes the response into the
/// scratch buffer and returns the number of bytes written.
pub type HandlerFn = Arc<dyn Fn(&[u8], &mut [u8]) -> usize + Send + Sync>;

/// Handlers keyed by function id.
///
/// Registration is expected to finish before serving starts; lookups take a
/// read lock only long enough to clone the handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<u32, HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `fn_id`.
    ///
    /// Registering a second handler for the same id is a programming error:
    /// it is logged and the process aborts.
    pub fn register_handler<F>(&self, fn_id: u32, handler: F)
    where
        F: Fn(&[u8], &mut [u8]) -> usize + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&fn_id) {
            tracing::error!(fn_id = format_args!("{:#010x}", fn_id), "duplicate handler registration");
            std::process::abort();
        }
        handlers.insert(fn_id, Arc::new(handler));
        tracing::debug!(fn_id = format_args!("{:#010x}", fn_id), "handler registered");
    }

    /// Run the handler for `fn_id`.
    ///
    /// Returns 0 without failing when no handler is registered, since the id
    /// comes from the peer.
    pub fn dispatch(&self, fn_id: u32, payload: &[u8], response: &mut [u8]) -> usize {
        let handler = self.handlers.read().get(&fn_id).cloned();
        let Some(handler) = handler else {
            tracing::error!(fn_id = format_args!("{:#010x}", fn_id), "no handler registered");
            return 0;
        };

        let written = handler(payload, response);
        if written > response.len() {
            tracing::error!(
                fn_id = format_args!("{:#010x}", fn_id),
                written,
                capacity = response.len(),
                "handler reported more bytes than the response buffer holds"
            );
            return 0;
        }
        written
    }

    pub fn contains(&self, fn_id: u32) -> bool {
        self.handlers.read().contains_key(&fn_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
