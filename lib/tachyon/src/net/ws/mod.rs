//! WebSocket transport. Frames travel as binary messages, one frame per message, capped at the
//! frame size limit. After the upgrade the client's first message must be the 4 byte cookie.
use crate::config::PeerTimeouts;
use crate::net::peer::{Link, PeerEvent};
use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult, PeerId, MAX_FRAME_SIZE};
use flux::logging;
use mio::net::TcpStream;
use std::io;
use std::time::Instant;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

pub mod client;
pub mod handshake;
pub mod server;

pub use self::client::WsClientPeer;
pub use self::server::WsServerPeer;

pub(crate) type Socket = WebSocket<TcpStream>;

/// Caps every message and frame at the frame size limit.
pub(crate) fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config.max_frame_size = Some(MAX_FRAME_SIZE);
    config
}

#[inline]
pub(crate) fn cookie_message(cookie: u32) -> Message {
    Message::Binary(cookie.to_le_bytes().to_vec())
}

/// Extracts the cookie from the first message of a session.
pub(crate) fn read_cookie(data: &[u8]) -> NetworkResult<u32> {
    match <[u8; 4]>::try_from(data) {
        Ok(bytes) => Ok(u32::from_le_bytes(bytes)),
        Err(_) => fatal(ErrorType::MalformedHandshake),
    }
}

/// Result of one read attempt.
pub(crate) enum Ingress {
    Frame(Vec<u8>),
    /// Ping, pong or a partial frame, handled by the socket itself.
    Control,
    /// Nothing more to read right now.
    Idle,
    Closed,
    Violation(NetworkError),
}

pub(crate) fn ingest(socket: &mut Socket) -> Ingress {
    match socket.read() {
        Ok(Message::Binary(data)) => Ingress::Frame(data),
        Ok(Message::Text(_)) => Ingress::Violation(NetworkError::Fatal(ErrorType::IncorrectCategory)),
        Ok(Message::Close(_)) => Ingress::Closed,
        Ok(_) => Ingress::Control,
        Err(tungstenite::Error::Io(ref err)) if err.kind() == io::ErrorKind::WouldBlock => Ingress::Idle,
        Err(tungstenite::Error::Capacity(_)) => Ingress::Violation(NetworkError::Fatal(ErrorType::PayloadTooLarge)),
        Err(tungstenite::Error::Protocol(_)) => Ingress::Violation(NetworkError::Fatal(ErrorType::IncorrectCategory)),
        Err(_) => Ingress::Closed,
    }
}

/// Reads everything available on an established socket, emitting data events as `peer`. Fails
/// with the reason the socket has to go.
pub(crate) fn drain(socket: &mut Socket, peer: PeerId, liveness: &mut Liveness, link: &Link, now: Instant) -> NetworkResult<()> {
    loop {
        match ingest(socket) {
            Ingress::Frame(data) => {
                liveness.touch(now);
                deliver(peer, &data, link);
            }
            Ingress::Control => liveness.touch(now),
            Ingress::Idle => return Ok(()),
            Ingress::Closed => return fatal(ErrorType::Closed),
            Ingress::Violation(err) => return Err(err),
        }
    }
}

/// Turns a received frame into a data event. Undecodable frames are dropped, the connection
/// stays up.
fn deliver(peer: PeerId, data: &[u8], link: &Link) {
    let mut packet = link.pools.packets.rent();

    match packet.fill(data) {
        Ok(()) => link.emit(PeerEvent::Data(peer, packet)),
        Err(err) => {
            logging::debug!(link.log, "Dropped undecodable frame"; "peer" => peer, "error" => %err);
            link.release_packet(packet);
        }
    }
}

/// Queues a binary frame. A full socket keeps it buffered until the next flush.
pub(crate) fn write_frame(socket: &mut Socket, frame: &[u8]) -> NetworkResult<()> {
    match socket.write(Message::Binary(frame.to_vec())) {
        Ok(()) => Ok(()),
        Err(tungstenite::Error::Io(ref err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(tungstenite::Error::Capacity(_)) => fatal(ErrorType::PayloadTooLarge),
        Err(_) => fatal(ErrorType::Closed),
    }
}

/// Pushes buffered output to the stream.
pub(crate) fn flush(socket: &mut Socket) -> NetworkResult<()> {
    match socket.flush() {
        Ok(()) => Ok(()),
        Err(tungstenite::Error::Io(ref err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(_) => fatal(ErrorType::Closed),
    }
}

/// Keep-alive bookkeeping for an established socket.
pub(crate) struct Liveness {
    last_ingress: Instant,
    last_ping: Instant,
}

impl Liveness {
    pub fn new(now: Instant) -> Liveness {
        Liveness {
            last_ingress: now,
            last_ping: now,
        }
    }

    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_ingress = now;
    }

    /// Pings when due. Fails once the remote has been silent past the idle timeout.
    pub fn check(&mut self, socket: &mut Socket, timeouts: &PeerTimeouts, now: Instant) -> NetworkResult<()> {
        if now.duration_since(self.last_ingress) >= timeouts.idle_timeout() {
            return fatal(ErrorType::Timeout);
        }

        if now.duration_since(self.last_ping) >= timeouts.ping_interval() {
            self.last_ping = now;
            drop(socket.write(Message::Ping(Vec::new())));
        }

        Ok(())
    }
}
