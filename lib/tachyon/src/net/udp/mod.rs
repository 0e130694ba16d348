//! Reliable, ordered messaging over UDP.
//!
//! Datagrams are `[category: u8][connection: u32]` followed by a category specific body, all
//! big endian. Connections are established with a cookie checked `Connect`/`Accept` exchange and
//! payloads are acknowledged individually and retransmitted until acknowledged.
pub mod client;
pub mod connection;
pub mod frame;
pub mod host;
pub mod server;

pub use self::client::UdpClientPeer;
pub use self::host::{Host, HostConfig};
pub use self::server::UdpServerPeer;
