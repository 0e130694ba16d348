pub use crate::config::{ClientConfig, NetConfig, PeerTimeouts, PunchConfig, RpcConfig, ServerConfig};
pub use crate::message;
pub use crate::net::buffer::{Buffer, Reader};
pub use crate::net::codec::{command_id, Message, WireArgs};
pub use crate::net::endpoint::{Client, Server};
pub use crate::net::peer::{ClientTransport, Outbox, PeerState, ServerTransport};
pub use crate::net::punch::{PunchPeer, RendezvousServer};
pub use crate::net::rpc::{Reply, RpcCall};
pub use crate::net::security::{Blacklist, MemoryBlacklist};
pub use crate::net::shared::{ErrorType, NetworkError, NetworkResult, PeerId, HOST_PEER};
pub use crate::net::udp::{UdpClientPeer, UdpServerPeer};
pub use crate::net::ws::{WsClientPeer, WsServerPeer};
pub use serde_derive::{Deserialize, Serialize};
