use crate::config::ServerConfig;
use crate::net::peer::{Cadence, Command, Link, Outbox, PeerCore, PeerEvent, PeerState, Pump, ServerTransport};
use crate::net::pool::Pools;
use crate::net::security::{verify_cookie, Blacklist, Lifecycle, MemoryBlacklist};
use crate::net::shared::{ErrorType, NetworkError, NetworkResult, PeerId, SESSION_COOKIE};
use crate::net::ws::handshake::{accept_response, find_terminator, parse_request, MAX_REQUEST_SIZE};
use crate::net::ws::{drain, flush, ingest, read_cookie, websocket_config, write_frame, Ingress, Liveness, Socket};
use crossbeam_channel::Receiver;
use flux::logging;
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Poll, Registry, Token, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tungstenite::protocol::Role;
use tungstenite::WebSocket;

const LISTENER_TOKEN: Token = Token(0);
/// How long a locally closed session may take to finish the close handshake.
const LINGER: Duration = Duration::from_secs(1);

enum Stage {
    /// Reading the HTTP upgrade request.
    Upgrade { stream: TcpStream, head: Vec<u8> },
    /// Upgraded, waiting for the cookie message.
    Authenticating(Socket),
    Established(Socket, Liveness),
    /// Closed locally, finishing the close handshake.
    Closing(Socket, Instant),
}

struct Session {
    address: SocketAddr,
    // Taken out while the session transitions
    stage: Option<Stage>,
    opened: Instant,
}

/// What to do with a session after servicing it.
enum Verdict {
    Keep,
    Authenticated,
    /// Drop silently, the session was never reported.
    Abort,
    /// Drop and blacklist the address.
    Ban(NetworkError),
    /// Drop and report the disconnect.
    Lost(NetworkError),
    /// Teardown of an already reported session is complete.
    Finished,
}

/// WebSocket server transport. Round trip times are not measured and report as 0.
pub struct WsServerPeer {
    core: PeerCore,
    config: ServerConfig,
    cookie: u32,
    blacklist: Arc<dyn Blacklist>,
    local: Option<SocketAddr>,
}

impl WsServerPeer {
    pub fn new(config: ServerConfig, log: &logging::Logger) -> WsServerPeer {
        WsServerPeer {
            core: PeerCore::new(&log.new(logging::o!("transport" => "ws-server"))),
            config,
            cookie: SESSION_COOKIE,
            blacklist: Arc::new(MemoryBlacklist::new()),
            local: None,
        }
    }

    /// Replaces the cookie clients must present.
    pub fn with_cookie(mut self, cookie: u32) -> WsServerPeer {
        self.cookie = cookie;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn Blacklist>) -> WsServerPeer {
        self.blacklist = blacklist;
        self
    }

    #[inline]
    pub fn blacklist(&self) -> &Arc<dyn Blacklist> {
        &self.blacklist
    }

    fn open(&mut self, address: SocketAddr) -> NetworkResult<(ServerPump, Poll, Arc<Waker>)> {
        let mut listener = TcpListener::bind(address)?;
        let (poll, waker) = PeerCore::poll()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.local = Some(listener.local_addr()?);

        Ok((
            ServerPump {
                listener,
                config: self.config.clone(),
                cookie: self.cookie,
                blacklist: self.blacklist.clone(),
                lifecycle: Lifecycle::new(),
                sessions: HashMap::new(),
                next_id: 1,
                verdicts: Vec::new(),
            },
            poll,
            waker,
        ))
    }
}

impl ServerTransport for WsServerPeer {
    fn start(&mut self, address: SocketAddr) -> bool {
        if !self.core.can_start() {
            return false;
        }

        let (pump, poll, waker) = match self.open(address) {
            Ok(opened) => opened,
            Err(err) => {
                logging::error!(self.core.log, "Failed to bind"; "address" => %address, "error" => %err);
                return false;
            }
        };

        logging::info!(self.core.log, "Listening"; "address" => ?self.local);
        self.core.state.set(PeerState::Listening);

        let cadence = Cadence::new(self.config.tick_interval_ms, self.config.no_delay);
        self.core.launch("ws-server", pump, poll, waker, cadence)
    }

    #[inline]
    fn state(&self) -> PeerState {
        self.core.state.get()
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
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
    fn round_trip_time(&self, _peer: PeerId) -> u32 {
        0
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

struct ServerPump {
    listener: TcpListener,
    config: ServerConfig,
    cookie: u32,
    blacklist: Arc<dyn Blacklist>,
    lifecycle: Lifecycle,
    sessions: HashMap<PeerId, Session>,
    next_id: PeerId,
    verdicts: Vec<(PeerId, Verdict)>,
}

impl ServerPump {
    fn accept(&mut self, registry: &Registry, link: &Link, now: Instant) {
        loop {
            let (mut stream, address) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        logging::warn!(link.log, "Accept failed"; "error" => %err);
                    }
                    return;
                }
            };

            if self.blacklist.contains(&address.ip()) {
                continue;
            }

            if self.lifecycle.active_count() >= usize::from(self.config.max_clients) {
                logging::warn!(link.log, "Connection refused, host is full"; "address" => %address);
                continue;
            }

            let id = self.allocate();

            if let Err(err) = registry.register(&mut stream, Token(id as usize), Interest::READABLE) {
                logging::warn!(link.log, "Stream registration failed"; "error" => %err);
                continue;
            }

            drop(stream.set_nodelay(true));
            self.lifecycle.begin(id);
            self.sessions.insert(
                id,
                Session {
                    address,
                    stage: Some(Stage::Upgrade {
                        stream,
                        head: Vec::new(),
                    }),
                    opened: now,
                },
            );
        }
    }

    fn allocate(&mut self) -> PeerId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);

            if !self.sessions.contains_key(&id) && !self.lifecycle.is_removed(id) {
                return id;
            }
        }
    }

    fn send(&mut self, peer: PeerId, frame: &[u8], link: &Link) {
        match self.sessions.get_mut(&peer).and_then(|session| session.stage.as_mut()) {
            Some(Stage::Established(socket, _)) => {
                if let Err(err) = write_frame(socket, frame) {
                    logging::debug!(link.log, "Dropped outgoing frame"; "peer" => peer, "error" => %err);
                }
            }
            _ => logging::debug!(link.log, "Dropped frame for unknown peer"; "peer" => peer),
        }
    }

    fn broadcast(&mut self, frame: &[u8]) {
        for session in self.sessions.values_mut() {
            if let Some(Stage::Established(socket, _)) = session.stage.as_mut() {
                drop(write_frame(socket, frame));
            }
        }
    }

    /// Starts the close handshake and reports the disconnect right away.
    fn disconnect(&mut self, peer: PeerId, link: &Link, now: Instant) {
        let session = match self.sessions.get_mut(&peer) {
            Some(session) => session,
            None => return,
        };

        match session.stage.take() {
            Some(Stage::Established(mut socket, _)) => {
                drop(socket.close(None));
                drop(flush(&mut socket));
                session.stage = Some(Stage::Closing(socket, now));

                self.lifecycle.remove(peer, now);
                link.emit(PeerEvent::Disconnected(peer));
                logging::info!(link.log, "Disconnected"; "peer" => peer);
            }
            other => session.stage = other,
        }
    }

    fn conclude(&mut self, id: PeerId, verdict: Verdict, link: &Link, now: Instant) {
        let address = match self.sessions.get(&id) {
            Some(session) => session.address,
            None => return,
        };

        match verdict {
            Verdict::Keep => return,
            Verdict::Authenticated => {
                self.lifecycle.establish(id);
                link.emit(PeerEvent::Connected(id, address));
                logging::info!(link.log, "Accepted connection"; "peer" => id, "address" => %address);
                return;
            }
            Verdict::Abort => {
                logging::debug!(link.log, "Dropped stream"; "peer" => id, "address" => %address);
            }
            Verdict::Ban(err) => {
                self.blacklist.insert(address.ip());
                logging::warn!(link.log, "Blacklisted address"; "address" => %address.ip(), "reason" => %err);
            }
            Verdict::Lost(err) => {
                link.emit(PeerEvent::Disconnected(id));
                logging::info!(link.log, "Connection lost"; "peer" => id, "reason" => %err);
            }
            Verdict::Finished => (),
        }

        self.sessions.remove(&id);
        self.lifecycle.remove(id, now);
        self.lifecycle.acknowledge(id);
    }
}

impl Pump for ServerPump {
    fn route(&mut self, command: Command, link: &Link, now: Instant) {
        match command {
            Command::Send(peer, buffer) => {
                self.send(peer, buffer.as_slice(), link);
                link.release_buffer(buffer);
            }
            Command::Broadcast(buffer) => {
                self.broadcast(buffer.as_slice());
                link.release_buffer(buffer);
            }
            Command::Disconnect(peer) => self.disconnect(peer, link, now),
        }
    }

    fn tick(&mut self, registry: &Registry, link: &Link, now: Instant) {
        self.accept(registry, link, now);

        let context = Context {
            cookie: self.cookie,
            config: &self.config,
            link,
            now,
        };

        for (id, session) in self.sessions.iter_mut() {
            let verdict = context.service(*id, session);

            if !matches!(verdict, Verdict::Keep) {
                self.verdicts.push((*id, verdict));
            }
        }

        while let Some((id, verdict)) = self.verdicts.pop() {
            self.conclude(id, verdict, link, now);
        }
    }

    fn close(&mut self, _link: &Link) {
        for (_, session) in self.sessions.drain() {
            if let Some(Stage::Established(mut socket, _)) = session.stage {
                drop(socket.close(None));
                drop(flush(&mut socket));
            }
        }

        self.lifecycle = Lifecycle::new();
    }
}

/// Per tick state shared by every session.
struct Context<'a> {
    cookie: u32,
    config: &'a ServerConfig,
    link: &'a Link,
    now: Instant,
}

impl<'a> Context<'a> {
    fn service(&self, id: PeerId, session: &mut Session) -> Verdict {
        let (stage, verdict) = match session.stage.take() {
            Some(Stage::Upgrade { stream, head }) => self.upgrade(stream, head),
            Some(Stage::Authenticating(socket)) => self.authenticate(socket),
            Some(Stage::Established(socket, liveness)) => self.exchange(id, socket, liveness),
            Some(Stage::Closing(socket, since)) => self.linger(socket, since),
            None => (None, Verdict::Abort),
        };

        let handshaking = matches!(stage, Some(Stage::Upgrade { .. }) | Some(Stage::Authenticating(_)));
        session.stage = stage;

        if handshaking
            && matches!(verdict, Verdict::Keep)
            && self.now.duration_since(session.opened) >= self.config.handshake_timeout()
        {
            return Verdict::Abort;
        }

        verdict
    }

    fn upgrade(&self, mut stream: TcpStream, mut head: Vec<u8>) -> (Option<Stage>, Verdict) {
        let mut chunk = [0u8; 1024];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return (None, Verdict::Abort),
                Ok(count) => head.extend_from_slice(&chunk[..count]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return (None, Verdict::Abort),
            }

            if head.len() > MAX_REQUEST_SIZE || find_terminator(&head).is_some() {
                break;
            }
        }

        let end = match find_terminator(&head) {
            Some(end) => end,
            None if head.len() > MAX_REQUEST_SIZE => {
                return (None, Verdict::Ban(NetworkError::Fatal(ErrorType::MalformedHandshake)))
            }
            None => return (Some(Stage::Upgrade { stream, head }), Verdict::Keep),
        };

        let key = match parse_request(&head[..end]) {
            Ok(key) => key,
            Err(err) => return (None, Verdict::Ban(err)),
        };

        if stream.write_all(accept_response(&key).as_bytes()).is_err() {
            return (None, Verdict::Abort);
        }

        let rest = head.split_off(end);
        let socket = WebSocket::from_partially_read(stream, rest, Role::Server, Some(websocket_config()));

        self.authenticate(socket)
    }

    fn authenticate(&self, mut socket: Socket) -> (Option<Stage>, Verdict) {
        loop {
            match ingest(&mut socket) {
                Ingress::Frame(data) => {
                    return match read_cookie(&data).and_then(|cookie| verify_cookie(self.cookie, cookie)) {
                        Ok(()) => (Some(Stage::Established(socket, Liveness::new(self.now))), Verdict::Authenticated),
                        Err(err) => (None, Verdict::Ban(err)),
                    };
                }
                Ingress::Control => continue,
                Ingress::Idle => return (Some(Stage::Authenticating(socket)), Verdict::Keep),
                Ingress::Closed => return (None, Verdict::Abort),
                Ingress::Violation(_) => {
                    return (None, Verdict::Ban(NetworkError::Fatal(ErrorType::MalformedHandshake)))
                }
            }
        }
    }

    fn exchange(&self, id: PeerId, mut socket: Socket, mut liveness: Liveness) -> (Option<Stage>, Verdict) {
        let result = drain(&mut socket, id, &mut liveness, self.link, self.now)
            .and_then(|()| liveness.check(&mut socket, &self.config.timeouts, self.now))
            .and_then(|()| flush(&mut socket));

        match result {
            Ok(()) => (Some(Stage::Established(socket, liveness)), Verdict::Keep),
            Err(err) => {
                drop(socket.close(None));
                drop(flush(&mut socket));
                (None, Verdict::Lost(err))
            }
        }
    }

    fn linger(&self, mut socket: Socket, since: Instant) -> (Option<Stage>, Verdict) {
        loop {
            match ingest(&mut socket) {
                Ingress::Idle => break,
                Ingress::Closed | Ingress::Violation(_) => return (None, Verdict::Finished),
                Ingress::Frame(_) | Ingress::Control => continue,
            }
        }

        if self.now.duration_since(since) >= LINGER || flush(&mut socket).is_err() {
            return (None, Verdict::Finished);
        }

        (Some(Stage::Closing(socket, since)), Verdict::Keep)
    }
}
