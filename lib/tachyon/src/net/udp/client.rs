use crate::config::ClientConfig;
use crate::net::peer::{Cadence, ClientTransport, Command, Link, Outbox, PeerCore, PeerEvent, PeerState, Pump};
use crate::net::pool::Pools;
use crate::net::security::MemoryBlacklist;
use crate::net::shared::{NetworkResult, PeerId, HOST_PEER, SESSION_COOKIE};
use crate::net::udp::host::{Host, HostConfig};
use crate::net::udp::server::RTT_PUBLISH_INTERVAL;
use crossbeam_channel::Receiver;
use flux::logging;
use mio::{Poll, Registry, Token, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

const SOCKET_TOKEN: Token = Token(0);

/// Wildcard local address of the same family as `remote`.
pub(crate) fn unspecified(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// Reliable UDP client transport. The single remote is addressed as `HOST_PEER`.
pub struct UdpClientPeer {
    core: PeerCore,
    config: ClientConfig,
    cookie: u32,
}

impl UdpClientPeer {
    pub fn new(config: ClientConfig, log: &logging::Logger) -> UdpClientPeer {
        UdpClientPeer {
            core: PeerCore::new(&log.new(logging::o!("transport" => "udp-client"))),
            config,
            cookie: SESSION_COOKIE,
        }
    }

    /// Replaces the handshake cookie presented to the server.
    pub fn with_cookie(mut self, cookie: u32) -> UdpClientPeer {
        self.cookie = cookie;
        self
    }

    fn open(&mut self, address: SocketAddr) -> NetworkResult<(ClientPump, Poll, Arc<Waker>)> {
        let mut host = Host::bind(
            unspecified(&address),
            HostConfig::default(),
            self.core.pools.clone(),
            Arc::new(MemoryBlacklist::new()),
            &self.core.log,
        )?;

        let (poll, waker) = PeerCore::poll()?;
        host.register(poll.registry(), SOCKET_TOKEN)?;

        let now = Instant::now();
        let remote = host.connect(
            address,
            self.cookie,
            self.config.timeouts,
            self.config.connect_timeout(),
            now,
        );

        Ok((
            ClientPump {
                host,
                remote,
                connected: false,
                closing: false,
                published: now,
            },
            poll,
            waker,
        ))
    }
}

impl ClientTransport for UdpClientPeer {
    fn start(&mut self, address: SocketAddr) -> bool {
        if !self.core.can_start() {
            return false;
        }

        let (pump, poll, waker) = match self.open(address) {
            Ok(opened) => opened,
            Err(err) => {
                logging::error!(self.core.log, "Failed to open socket"; "address" => %address, "error" => %err);
                return false;
            }
        };

        logging::info!(self.core.log, "Connecting"; "address" => %address);
        self.core.state.set(PeerState::Connecting);

        let cadence = Cadence::new(self.config.tick_interval_ms, self.config.no_delay);
        self.core.launch("udp-client", pump, poll, waker, cadence)
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

/// Drives a host holding a single outgoing connection and presents it as `HOST_PEER`.
struct ClientPump {
    host: Host,
    remote: PeerId,
    connected: bool,
    /// A local disconnect is lingering until the server acknowledges it.
    closing: bool,
    published: Instant,
}

impl Pump for ClientPump {
    fn route(&mut self, command: Command, link: &Link, now: Instant) {
        match command {
            Command::Send(HOST_PEER, buffer) | Command::Broadcast(buffer) => {
                if let Err(err) = self.host.send(self.remote, buffer.as_slice()) {
                    logging::debug!(link.log, "Dropped outgoing frame"; "error" => %err);
                }
                link.release_buffer(buffer);
            }
            Command::Send(peer, buffer) => {
                logging::debug!(link.log, "Dropped frame for unknown peer"; "peer" => peer);
                link.release_buffer(buffer);
            }
            Command::Disconnect(HOST_PEER) => {
                link.state.set(PeerState::Disconnecting);
                self.closing = self.host.disconnect(self.remote, now);
            }
            Command::Disconnect(_) => (),
        }
    }

    fn tick(&mut self, _registry: &Registry, link: &Link, now: Instant) {
        self.host.service(now);

        for event in self.host.changes() {
            match event {
                PeerEvent::Connected(_, address) => {
                    self.connected = true;
                    link.state.set(PeerState::Connected);
                    link.emit(PeerEvent::Connected(HOST_PEER, address));
                }
                PeerEvent::Data(_, packet) => link.emit(PeerEvent::Data(HOST_PEER, packet)),
                PeerEvent::Disconnected(_) => {
                    if self.connected {
                        link.emit(PeerEvent::Disconnected(HOST_PEER));
                    } else {
                        logging::warn!(link.log, "Connection failed");
                    }

                    self.connected = false;
                    link.state.set(PeerState::Disconnecting);

                    if !self.closing {
                        link.stop();
                    }
                }
            }
        }

        if self.closing && !self.host.holds(self.remote) {
            link.stop();
        }

        if self.connected && now.duration_since(self.published) >= RTT_PUBLISH_INTERVAL {
            if let Some(time) = self.host.round_trip_time(self.remote) {
                link.rtt.write().insert(HOST_PEER, time);
            }
            self.published = now;
        }
    }

    fn close(&mut self, _link: &Link) {
        self.host.shutdown();
    }
}
