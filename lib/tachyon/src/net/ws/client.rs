use crate::config::{ClientConfig, PeerTimeouts};
use crate::net::peer::{Cadence, ClientTransport, Command, Link, Outbox, PeerCore, PeerEvent, PeerState, Pump};
use crate::net::pool::Pools;
use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult, HOST_PEER, SESSION_COOKIE};
use crate::net::ws::handshake::{client_request, find_terminator, parse_response, MAX_REQUEST_SIZE};
use crate::net::ws::{cookie_message, drain, flush, websocket_config, write_frame, Liveness, Socket};
use crossbeam_channel::Receiver;
use flux::logging;
use mio::net::TcpStream;
use mio::{Interest, Poll, Registry, Token, Waker};
use std::io::{Read, Write};
use std::net::{self, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tungstenite::handshake::client::generate_key;
use tungstenite::protocol::Role;
use tungstenite::WebSocket;

const SOCKET_TOKEN: Token = Token(0);

/// WebSocket client transport. The upgrade and the cookie are sent during `start`, so the link
/// counts as connected as soon as the I/O thread runs.
pub struct WsClientPeer {
    core: PeerCore,
    config: ClientConfig,
    cookie: u32,
}

impl WsClientPeer {
    pub fn new(config: ClientConfig, log: &logging::Logger) -> WsClientPeer {
        WsClientPeer {
            core: PeerCore::new(&log.new(logging::o!("transport" => "ws-client"))),
            config,
            cookie: SESSION_COOKIE,
        }
    }

    pub fn with_cookie(mut self, cookie: u32) -> WsClientPeer {
        self.cookie = cookie;
        self
    }

    fn open(&mut self, address: SocketAddr) -> NetworkResult<(ClientPump, Poll, Arc<Waker>)> {
        let mut stream = net::TcpStream::connect_timeout(&address, self.config.connect_timeout())?;
        stream.set_read_timeout(Some(self.config.handshake_timeout()))?;
        stream.set_write_timeout(Some(self.config.handshake_timeout()))?;
        stream.set_nodelay(true)?;

        let key = generate_key();
        stream.write_all(client_request(&address.to_string(), &key).as_bytes())?;

        let mut head = Vec::new();
        let mut chunk = [0u8; 1024];

        let end = loop {
            if let Some(end) = find_terminator(&head) {
                break end;
            }

            if head.len() > MAX_REQUEST_SIZE {
                return fatal(ErrorType::MalformedHandshake);
            }

            match stream.read(&mut chunk)? {
                0 => return fatal(ErrorType::Closed),
                count => head.extend_from_slice(&chunk[..count]),
            }
        };

        parse_response(&head[..end], &key)?;
        let rest = head.split_off(end);

        stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(stream);

        let (poll, waker) = PeerCore::poll()?;
        poll.registry().register(&mut stream, SOCKET_TOKEN, Interest::READABLE)?;

        let mut socket = WebSocket::from_partially_read(stream, rest, Role::Client, Some(websocket_config()));
        socket
            .write(cookie_message(self.cookie))
            .map_err(|_| NetworkError::Fatal(ErrorType::Closed))?;
        flush(&mut socket)?;

        let now = Instant::now();

        Ok((
            ClientPump {
                socket: Some(socket),
                address,
                timeouts: self.config.timeouts,
                liveness: Liveness::new(now),
                announced: false,
            },
            poll,
            waker,
        ))
    }
}

impl ClientTransport for WsClientPeer {
    fn start(&mut self, address: SocketAddr) -> bool {
        if !self.core.can_start() {
            return false;
        }

        self.core.state.set(PeerState::Connecting);

        let (pump, poll, waker) = match self.open(address) {
            Ok(opened) => opened,
            Err(err) => {
                logging::error!(self.core.log, "Failed to connect"; "address" => %address, "error" => %err);
                self.core.state.set(PeerState::Idle);
                return false;
            }
        };

        let cadence = Cadence::new(self.config.tick_interval_ms, self.config.no_delay);
        self.core.launch("ws-client", pump, poll, waker, cadence)
    }

    #[inline]
    fn state(&self) -> PeerState {
        self.core.state.get()
    }

    #[inline]
    fn outbox(&self) -> Outbox {
        self.core.outbox()
    }

    #[inline]
    fn events(&self) -> &Receiver<PeerEvent> {
        self.core.events()
    }

    #[inline]
    fn pools(&self) -> &Arc<Pools> {
        &self.core.pools
    }

    #[inline]
    fn round_trip_time(&self) -> u32 {
        0
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

struct ClientPump {
    // None once the link is down
    socket: Option<Socket>,
    address: SocketAddr,
    timeouts: PeerTimeouts,
    liveness: Liveness,
    announced: bool,
}

impl ClientPump {
    /// Closes the socket and reports the link as gone.
    fn hang_up(&mut self, link: &Link, reason: NetworkError) {
        if let Some(mut socket) = self.socket.take() {
            drop(socket.close(None));
            drop(flush(&mut socket));

            logging::info!(link.log, "Disconnected"; "reason" => %reason);
            link.state.set(PeerState::Disconnecting);
            link.emit(PeerEvent::Disconnected(HOST_PEER));
            link.stop();
        }
    }
}

impl Pump for ClientPump {
    fn route(&mut self, command: Command, link: &Link, _now: Instant) {
        match command {
            Command::Send(HOST_PEER, buffer) | Command::Broadcast(buffer) => {
                if let Some(socket) = self.socket.as_mut() {
                    if let Err(err) = write_frame(socket, buffer.as_slice()) {
                        logging::debug!(link.log, "Dropped outgoing frame"; "error" => %err);
                    }
                }
                link.release_buffer(buffer);
            }
            Command::Send(peer, buffer) => {
                logging::debug!(link.log, "Dropped frame for unknown peer"; "peer" => peer);
                link.release_buffer(buffer);
            }
            Command::Disconnect(HOST_PEER) => self.hang_up(link, NetworkError::Fatal(ErrorType::Closed)),
            Command::Disconnect(_) => (),
        }
    }

    fn tick(&mut self, _registry: &Registry, link: &Link, now: Instant) {
        if !self.announced {
            self.announced = true;
            link.state.set(PeerState::Connected);
            link.emit(PeerEvent::Connected(HOST_PEER, self.address));
            logging::info!(link.log, "Connected"; "address" => %self.address);
        }

        let result = match self.socket.as_mut() {
            Some(socket) => drain(socket, HOST_PEER, &mut self.liveness, link, now)
                .and_then(|()| self.liveness.check(socket, &self.timeouts, now))
                .and_then(|()| flush(socket)),
            None => return,
        };

        if let Err(err) = result {
            self.hang_up(link, err);
        }
    }

    fn close(&mut self, _link: &Link) {
        if let Some(mut socket) = self.socket.take() {
            drop(socket.close(None));
            drop(flush(&mut socket));
        }
    }
}
