//! Typed calls.
//!
//! A remotely callable function is a marker type implementing
//! [`RpcFunction`]: its signature text, request type and response type. The
//! function id is the 32-bit FNV-1a hash of the signature text, so client and
//! server binaries built separately agree on it as long as the declaration
//! is the same. Values travel postcard-encoded.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct EchoRequest { msg: String }
//! #[derive(Serialize, Deserialize)]
//! struct EchoResponse { msg: String }
//!
//! fn echo(req: EchoRequest) -> EchoResponse {
//!     EchoResponse { msg: format!("Echo: {}", req.msg) }
//! }
//! rcrpc::rpc_handler!(pub Echo, echo, EchoRequest => EchoResponse);
//!
//! server.register_handler::<Echo>();
//! let resp = client.call::<Echo>(&EchoRequest { msg: "Hello".into() }).await?;
//! ```

mod client;
mod server;

pub use client::{RpcCaller, TypedClient};
pub use server::TypedServer;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use verbs::{Device, ProtectionDomain};

use crate::config::TypedRpcConfig;
use crate::error::{Direction, Error, Result};

/// FNV-1a 32-bit offset basis.
pub const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
/// FNV-1a 32-bit prime.
pub const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a hash of `signature`, folding each byte as an unsigned value.
pub const fn function_id(signature: &str) -> u32 {
    let bytes = signature.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// A remotely callable function.
pub trait RpcFunction: 'static {
    /// Fully qualified declaration, e.g. `app::echo(EchoRequest) -> EchoResponse`.
    const SIGNATURE: &'static str;
    /// Function id on the wire.
    const ID: u32 = function_id(Self::SIGNATURE);

    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// A function implemented by a free function.
pub trait Handler: RpcFunction {
    fn call(request: Self::Request) -> Self::Response;
}

/// A function implemented by a method of a shared receiver.
pub trait MethodHandler: RpcFunction {
    type Receiver: Send + Sync + 'static;

    fn call(receiver: &Self::Receiver, request: Self::Request) -> Self::Response;
}

/// A function implemented by an `async fn`.
///
/// Declarable so client and server share one definition, but servers reject
/// it at registration: handlers run synchronously on worker threads.
pub trait AsyncHandler: RpcFunction {
    fn call(request: Self::Request) -> impl Future<Output = Self::Response> + Send;
}

/// Declare a marker type for a free-function handler.
///
/// ```ignore
/// rpc_handler!(pub Echo, echo, EchoRequest => EchoResponse);
/// rpc_handler!(pub EchoLater, async echo_later, EchoRequest => EchoResponse);
/// ```
#[macro_export]
macro_rules! rpc_handler {
    (@function $vis:vis $name:ident, $func:path, $req:ty => $resp:ty) => {
        $vis struct $name;

        impl $crate::typed::RpcFunction for $name {
            const SIGNATURE: &'static str = concat!(
                module_path!(),
                "::",
                stringify!($func),
                "(",
                stringify!($req),
                ") -> ",
                stringify!($resp)
            );
            type Request = $req;
            type Response = $resp;
        }
    };
    ($vis:vis $name:ident, async $func:path, $req:ty => $resp:ty) => {
        $crate::rpc_handler!(@function $vis $name, $func, $req => $resp);

        impl $crate::typed::AsyncHandler for $name {
            fn call(request: $req) -> impl ::std::future::Future<Output = $resp> + Send {
                $func(request)
            }
        }
    };
    ($vis:vis $name:ident, $func:path, $req:ty => $resp:ty) => {
        $crate::rpc_handler!(@function $vis $name, $func, $req => $resp);

        impl $crate::typed::Handler for $name {
            fn call(request: $req) -> $resp {
                $func(request)
            }
        }
    };
}

/// Declare a marker type for a method handler.
///
/// ```ignore
/// rpc_method!(pub Add, Calculator, add, AddRequest => AddResponse);
/// ```
#[macro_export]
macro_rules! rpc_method {
    ($vis:vis $name:ident, $receiver:ty, $method:ident, $req:ty => $resp:ty) => {
        $vis struct $name;

        impl $crate::typed::RpcFunction for $name {
            const SIGNATURE: &'static str = concat!(
                module_path!(),
                "::",
                stringify!($receiver),
                "::",
                stringify!($method),
                "(",
                stringify!($req),
                ") -> ",
                stringify!($resp)
            );
            type Request = $req;
            type Response = $resp;
        }

        impl $crate::typed::MethodHandler for $name {
            type Receiver = $receiver;

            fn call(receiver: &$receiver, request: $req) -> $resp {
                receiver.$method(request)
            }
        }
    };
}

/// Open the device named by `config` and allocate a protection domain.
pub(crate) fn open_pd(config: &TypedRpcConfig) -> Result<Arc<ProtectionDomain>> {
    let device = Device::open(config.device_nr, config.port_nr)?;
    Ok(device.alloc_pd()?)
}

pub(crate) fn encode<T: Serialize>(value: &T, buf: &mut [u8], direction: Direction) -> Result<usize> {
    postcard::to_slice(value, buf)
        .map(|used| used.len())
        .map_err(|source| Error::Encode { direction, source })
}

pub(crate) fn decode<T: DeserializeOwned>(buf: &[u8], direction: Direction) -> Result<T> {
    postcard::from_bytes(buf).map_err(|source| Error::Decode { direction, source })
}
