//! The networking core: wire buffers and pools, the frame codec, transports, dispatch and RPC.
//!
//! Transports (`udp`, `ws`, `punch`) move frames on a background thread. Endpoints pair a
//! transport with a dispatch `Channel` and an `RpcEndpoint` and are driven by calling `poll`.
pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod punch;
pub mod rpc;
pub mod security;
pub mod shared;
pub mod udp;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
