//! NAT punch-through.
//!
//! Two peers that cannot reach each other directly both connect to a rendezvous host and
//! register the same session key. The host introduces them: the first to register becomes the
//! listener, which accepts and sends punches toward the other's public endpoint; the second
//! becomes the dialer, which connects straight to the listener. Both sides use one UDP socket
//! for the rendezvous link and the data link so the NAT mapping the host observed is the one
//! the data link travels through.
use crate::config::{PeerTimeouts, PunchConfig, ServerConfig};
use crate::net::buffer::Buffer;
use crate::net::codec::{write_message, Message};
use crate::net::endpoint::Server;
use crate::net::packet::Packet;
use crate::net::peer::{Cadence, ClientTransport, Command, Link, Outbox, PeerCore, PeerEvent, PeerState, Pump};
use crate::net::pool::Pools;
use crate::net::security::MemoryBlacklist;
use crate::net::shared::{NetworkResult, PeerId, HOST_PEER, RENDEZVOUS_COOKIE, SESSION_COOKIE};
use crate::net::udp::client::unspecified;
use crate::net::udp::host::{Host, HostConfig};
use crate::net::udp::server::RTT_PUBLISH_INTERVAL;
use crate::net::udp::UdpServerPeer;
use crossbeam_channel::Receiver;
use flux::logging;
use hashbrown::HashMap;
use mio::{Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOCKET_TOKEN: Token = Token(0);
/// Frames held back until the data link is up.
const BACKLOG_LIMIT: usize = 64;

/// Asks the rendezvous host to pair us with whoever registers the same session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PunchRegister {
    pub session: u64,
}

crate::message!(PunchRegister, "tachyon::punch::PunchRegister");

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Listener,
    Dialer,
}

/// Sent by the rendezvous host to both sides of a pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PunchIntroduce {
    pub session: u64,
    /// Public endpoint of the other side.
    pub address: SocketAddr,
    pub role: Role,
}

crate::message!(PunchIntroduce, "tachyon::punch::PunchIntroduce");

#[derive(Default)]
struct Sessions {
    addresses: HashMap<PeerId, SocketAddr>,
    waiting: HashMap<u64, PeerId>,
}

impl Sessions {
    fn pair(&mut self, peer: PeerId, session: u64, outbox: &Outbox, log: &logging::Logger) {
        let address = match self.addresses.get(&peer) {
            Some(address) => *address,
            None => return,
        };

        let waiting = match self.waiting.remove(&session) {
            Some(waiting) if waiting != peer => waiting,
            _ => {
                self.waiting.insert(session, peer);
                logging::debug!(log, "Peer waiting"; "peer" => peer, "session" => session);
                return;
            }
        };

        let waiting_address = match self.addresses.get(&waiting) {
            Some(address) => *address,
            None => {
                self.waiting.insert(session, peer);
                return;
            }
        };

        let listener = PunchIntroduce {
            session,
            address,
            role: Role::Listener,
        };
        let dialer = PunchIntroduce {
            session,
            address: waiting_address,
            role: Role::Dialer,
        };

        // The listener hears first so it is accepting by the time the dialer knocks.
        let result = outbox
            .send_message(waiting, &listener)
            .and_then(|()| outbox.send_message(peer, &dialer));

        match result {
            Ok(()) => logging::info!(log, "Introduced peers";
                                     "session" => session, "listener" => %waiting_address, "dialer" => %address),
            Err(err) => logging::warn!(log, "Introduction failed"; "session" => session, "error" => %err),
        }
    }

    fn forget(&mut self, peer: PeerId) {
        self.addresses.remove(&peer);
        self.waiting.retain(|_, waiting| *waiting != peer);
    }
}

/// Pairs punch peers registering the same session key. Only accepts the rendezvous cookie.
pub struct RendezvousServer {
    server: Server<UdpServerPeer>,
    sessions: Arc<Mutex<Sessions>>,
}

impl RendezvousServer {
    pub fn new(config: ServerConfig, log: &logging::Logger) -> NetworkResult<RendezvousServer> {
        let log = log.new(logging::o!("service" => "rendezvous"));
        let transport = UdpServerPeer::new(config, &log).with_cookie(RENDEZVOUS_COOKIE);
        let mut server = Server::new(transport, &log);
        let sessions = Arc::new(Mutex::new(Sessions::default()));

        let outbox = server.outbox();
        let pairing = sessions.clone();
        server.register::<PunchRegister, _>(move |peer, PunchRegister { session }| {
            pairing.lock().pair(peer, session, &outbox, &log);
        })?;

        let connected = sessions.clone();
        server.on_connected(move |peer, address| {
            connected.lock().addresses.insert(peer, address);
        });

        let disconnected = sessions.clone();
        server.on_disconnected(move |peer| disconnected.lock().forget(peer));

        Ok(RendezvousServer { server, sessions })
    }

    #[inline]
    pub fn start(&mut self, address: SocketAddr) -> bool {
        self.server.start(address)
    }

    #[inline]
    pub fn poll(&mut self) -> usize {
        self.server.poll()
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Sessions with one registered peer still waiting for its partner.
    pub fn waiting(&self) -> usize {
        self.sessions.lock().waiting.len()
    }

    #[inline]
    pub fn server(&self) -> &Server<UdpServerPeer> {
        &self.server
    }

    pub fn shutdown(&mut self) {
        self.server.shutdown();
    }
}

/// Client transport whose remote is found through a rendezvous host. `start` takes the
/// rendezvous address; `Connected` fires once the direct data link to the paired peer is up.
pub struct PunchPeer {
    core: PeerCore,
    config: PunchConfig,
}

impl PunchPeer {
    pub fn new(config: PunchConfig, log: &logging::Logger) -> PunchPeer {
        PunchPeer {
            core: PeerCore::new(&log.new(logging::o!("transport" => "punch", "session" => config.session))),
            config,
        }
    }

    fn open(&mut self, rendezvous: SocketAddr) -> NetworkResult<(PunchPump, Poll, Arc<Waker>)> {
        let config = HostConfig {
            timeouts: self.config.data_timeouts,
            ..HostConfig::default()
        };

        let mut host = Host::bind(
            unspecified(&rendezvous),
            config,
            self.core.pools.clone(),
            Arc::new(MemoryBlacklist::new()),
            &self.core.log,
        )?;

        let (poll, waker) = PeerCore::poll()?;
        host.register(poll.registry(), SOCKET_TOKEN)?;

        let now = Instant::now();
        let rendezvous = host.connect(
            rendezvous,
            RENDEZVOUS_COOKIE,
            self.config.rendezvous_timeouts,
            self.config.connect_timeout(),
            now,
        );

        Ok((
            PunchPump {
                host,
                rendezvous,
                session: self.config.session,
                data_timeouts: self.config.data_timeouts,
                connect_timeout: self.config.connect_timeout(),
                punch_interval: self.config.punch_interval(),
                punch_timeout: self.config.punch_timeout(),
                stage: Stage::Waiting,
                backlog: Vec::new(),
                events: Vec::new(),
                closing: false,
                published: now,
            },
            poll,
            waker,
        ))
    }
}

impl ClientTransport for PunchPeer {
    fn start(&mut self, address: SocketAddr) -> bool {
        if !self.core.can_start() {
            return false;
        }

        let (pump, poll, waker) = match self.open(address) {
            Ok(opened) => opened,
            Err(err) => {
                logging::error!(self.core.log, "Failed to open socket"; "rendezvous" => %address, "error" => %err);
                return false;
            }
        };

        logging::info!(self.core.log, "Contacting rendezvous host"; "address" => %address);
        self.core.state.set(PeerState::Connecting);

        let cadence = Cadence::new(self.config.tick_interval_ms, false);
        self.core.launch("punch", pump, poll, waker, cadence)
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
        self.core.round_trip_time(HOST_PEER)
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

#[derive(Debug, Copy, Clone)]
enum Stage {
    /// Registered with the rendezvous host, waiting for a partner.
    Waiting,
    Punching {
        remote: SocketAddr,
        since: Instant,
        punched: Instant,
    },
    Dialing {
        data: PeerId,
    },
    Linked {
        data: PeerId,
    },
}

struct PunchPump {
    host: Host,
    rendezvous: PeerId,
    session: u64,
    data_timeouts: PeerTimeouts,
    connect_timeout: Duration,
    punch_interval: Duration,
    punch_timeout: Duration,
    stage: Stage,
    backlog: Vec<Buffer>,
    events: Vec<PeerEvent>,
    /// A local disconnect of the data link is lingering until acknowledged.
    closing: bool,
    published: Instant,
}

impl PunchPump {
    fn handle(&mut self, event: PeerEvent, link: &Link, now: Instant) {
        match event {
            PeerEvent::Connected(id, _) if id == self.rendezvous => self.register(link),
            PeerEvent::Connected(id, address) => self.link_up(id, address, link, now),
            PeerEvent::Data(id, packet) if id == self.rendezvous => {
                self.introduced(&packet, link, now);
                link.release_packet(packet);
            }
            PeerEvent::Data(id, packet) => match self.stage {
                Stage::Linked { data } if data == id => link.emit(PeerEvent::Data(HOST_PEER, packet)),
                _ => link.release_packet(packet),
            },
            PeerEvent::Disconnected(id) if id == self.rendezvous => {
                if let Stage::Waiting = self.stage {
                    logging::warn!(link.log, "Rendezvous host unreachable");
                    self.fail(link);
                }
            }
            PeerEvent::Disconnected(id) => match self.stage {
                Stage::Linked { data } if data == id => {
                    logging::info!(link.log, "Data link closed");
                    link.emit(PeerEvent::Disconnected(HOST_PEER));

                    if !self.closing {
                        self.fail(link);
                    }
                }
                Stage::Dialing { data } if data == id => {
                    logging::warn!(link.log, "Remote peer unreachable");
                    self.fail(link);
                }
                _ => (),
            },
        }
    }

    fn register(&mut self, link: &Link) {
        let mut buffer = link.pools.buffers.rent();
        let result = write_message(&PunchRegister { session: self.session }, &mut buffer)
            .and_then(|()| self.host.send(self.rendezvous, buffer.as_slice()));
        link.release_buffer(buffer);

        match result {
            Ok(()) => logging::debug!(link.log, "Registered with rendezvous host"),
            Err(err) => logging::warn!(link.log, "Failed to register"; "error" => %err),
        }
    }

    fn introduced(&mut self, packet: &Packet, link: &Link, now: Instant) {
        if packet.command() != PunchIntroduce::ID {
            logging::debug!(link.log, "Unexpected rendezvous message"; "command" => packet.command());
            return;
        }

        let introduction = match PunchIntroduce::decode(&mut packet.reader()) {
            Ok(introduction) => introduction,
            Err(err) => {
                logging::warn!(link.log, "Undecodable introduction"; "error" => %err);
                return;
            }
        };

        if introduction.session != self.session || !matches!(self.stage, Stage::Waiting) {
            return;
        }

        logging::info!(link.log, "Introduced"; "remote" => %introduction.address, "role" => ?introduction.role);

        self.stage = match introduction.role {
            Role::Listener => {
                self.host.listen(Some(SESSION_COOKIE), self.data_timeouts);
                self.host.punch(introduction.address);

                Stage::Punching {
                    remote: introduction.address,
                    since: now,
                    punched: now,
                }
            }
            Role::Dialer => Stage::Dialing {
                data: self.host.connect(
                    introduction.address,
                    SESSION_COOKIE,
                    self.data_timeouts,
                    self.connect_timeout,
                    now,
                ),
            },
        };
    }

    fn link_up(&mut self, id: PeerId, address: SocketAddr, link: &Link, now: Instant) {
        let expected = match self.stage {
            Stage::Dialing { data } => data == id,
            Stage::Punching { .. } => true,
            _ => false,
        };

        if !expected {
            self.host.disconnect(id, now);
            return;
        }

        self.stage = Stage::Linked { data: id };
        self.host.listen(None, self.data_timeouts);

        for buffer in self.backlog.drain(..) {
            if let Err(err) = self.host.send(id, buffer.as_slice()) {
                logging::debug!(link.log, "Dropped outgoing frame"; "error" => %err);
            }
            link.release_buffer(buffer);
        }

        self.host.disconnect(self.rendezvous, now);

        link.state.set(PeerState::Connected);
        link.emit(PeerEvent::Connected(HOST_PEER, address));
        logging::info!(link.log, "Data link up"; "address" => %address);
    }

    fn punch(&mut self, link: &Link, now: Instant) {
        if let Stage::Punching { remote, since, punched } = self.stage {
            if now.duration_since(since) >= self.punch_timeout {
                logging::warn!(link.log, "Punch timed out"; "remote" => %remote);
                self.fail(link);
            } else if now.duration_since(punched) >= self.punch_interval {
                self.host.punch(remote);
                self.stage = Stage::Punching {
                    remote,
                    since,
                    punched: now,
                };
            }
        }
    }

    fn fail(&mut self, link: &Link) {
        link.state.set(PeerState::Disconnecting);
        link.stop();
    }

    fn enqueue(&mut self, buffer: Buffer, link: &Link) {
        match self.stage {
            Stage::Linked { data } => {
                if let Err(err) = self.host.send(data, buffer.as_slice()) {
                    logging::debug!(link.log, "Dropped outgoing frame"; "error" => %err);
                }
                link.release_buffer(buffer);
            }
            _ if self.backlog.len() < BACKLOG_LIMIT => self.backlog.push(buffer),
            _ => {
                logging::debug!(link.log, "Backlog full, dropped outgoing frame");
                link.release_buffer(buffer);
            }
        }
    }
}

impl Pump for PunchPump {
    fn route(&mut self, command: Command, link: &Link, now: Instant) {
        match command {
            Command::Send(HOST_PEER, buffer) | Command::Broadcast(buffer) => self.enqueue(buffer, link),
            Command::Send(peer, buffer) => {
                logging::debug!(link.log, "Dropped frame for unknown peer"; "peer" => peer);
                link.release_buffer(buffer);
            }
            Command::Disconnect(HOST_PEER) => match self.stage {
                Stage::Linked { data } => {
                    link.state.set(PeerState::Disconnecting);
                    self.closing = self.host.disconnect(data, now);
                }
                _ => self.fail(link),
            },
            Command::Disconnect(_) => (),
        }
    }

    fn tick(&mut self, _registry: &Registry, link: &Link, now: Instant) {
        self.host.service(now);

        let mut events = mem::take(&mut self.events);
        events.extend(self.host.changes());

        for event in events.drain(..) {
            self.handle(event, link, now);
        }

        self.events = events;
        self.punch(link, now);

        if let Stage::Linked { data } = self.stage {
            if self.closing && !self.host.holds(data) {
                link.stop();
            }

            if now.duration_since(self.published) >= RTT_PUBLISH_INTERVAL {
                if let Some(time) = self.host.round_trip_time(data) {
                    link.rtt.write().insert(HOST_PEER, time);
                }
                self.published = now;
            }
        }
    }

    fn close(&mut self, link: &Link) {
        for buffer in self.backlog.drain(..) {
            link.release_buffer(buffer);
        }

        self.host.shutdown();
    }
}
