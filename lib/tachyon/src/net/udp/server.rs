use crate::config::ServerConfig;
use crate::net::peer::{Cadence, Command, Link, Outbox, PeerCore, PeerEvent, PeerState, Pump, ServerTransport};
use crate::net::pool::Pools;
use crate::net::security::{Blacklist, MemoryBlacklist};
use crate::net::shared::{NetworkResult, PeerId, SESSION_COOKIE};
use crate::net::udp::host::{Host, HostConfig};
use crossbeam_channel::Receiver;
use flux::logging;
use mio::{Poll, Registry, Token, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SOCKET_TOKEN: Token = Token(0);
/// How often the I/O thread publishes round trip times.
pub(crate) const RTT_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Reliable UDP server transport.
pub struct UdpServerPeer {
    core: PeerCore,
    config: ServerConfig,
    cookie: u32,
    blacklist: Arc<dyn Blacklist>,
    local: Option<SocketAddr>,
}

impl UdpServerPeer {
    pub fn new(config: ServerConfig, log: &logging::Logger) -> UdpServerPeer {
        UdpServerPeer {
            core: PeerCore::new(&log.new(logging::o!("transport" => "udp-server"))),
            config,
            cookie: SESSION_COOKIE,
            blacklist: Arc::new(MemoryBlacklist::new()),
            local: None,
        }
    }

    /// Replaces the handshake cookie clients must present.
    pub fn with_cookie(mut self, cookie: u32) -> UdpServerPeer {
        self.cookie = cookie;
        self
    }

    /// Shares a blacklist, e.g. between several listeners.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn Blacklist>) -> UdpServerPeer {
        self.blacklist = blacklist;
        self
    }

    #[inline]
    pub fn blacklist(&self) -> &Arc<dyn Blacklist> {
        &self.blacklist
    }

    fn open(&mut self, address: SocketAddr) -> NetworkResult<(ServerPump, Poll, Arc<Waker>)> {
        let config = HostConfig {
            accept: Some(self.cookie),
            max_connections: usize::from(self.config.max_clients),
            timeouts: self.config.timeouts,
        };

        let mut host = Host::bind(
            address,
            config,
            self.core.pools.clone(),
            self.blacklist.clone(),
            &self.core.log,
        )?;

        let (poll, waker) = PeerCore::poll()?;
        host.register(poll.registry(), SOCKET_TOKEN)?;
        self.local = Some(host.local_addr()?);

        Ok((
            ServerPump {
                host,
                published: Instant::now(),
            },
            poll,
            waker,
        ))
    }
}

impl ServerTransport for UdpServerPeer {
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
        self.core.launch("udp-server", pump, poll, waker, cadence)
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
    fn round_trip_time(&self, peer: PeerId) -> u32 {
        self.core.round_trip_time(peer)
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }
}

struct ServerPump {
    host: Host,
    published: Instant,
}

impl Pump for ServerPump {
    fn route(&mut self, command: Command, link: &Link, now: Instant) {
        match command {
            Command::Send(peer, buffer) => {
                if let Err(err) = self.host.send(peer, buffer.as_slice()) {
                    logging::debug!(link.log, "Dropped outgoing frame"; "peer" => peer, "error" => %err);
                }
                link.release_buffer(buffer);
            }
            Command::Broadcast(buffer) => {
                if let Err(err) = self.host.broadcast(buffer.as_slice()) {
                    logging::debug!(link.log, "Dropped broadcast frame"; "error" => %err);
                }
                link.release_buffer(buffer);
            }
            Command::Disconnect(peer) => {
                self.host.disconnect(peer, now);
            }
        }
    }

    fn tick(&mut self, _registry: &Registry, link: &Link, now: Instant) {
        self.host.service(now);

        for event in self.host.changes() {
            link.emit(event);
        }

        if now.duration_since(self.published) >= RTT_PUBLISH_INTERVAL {
            let mut rtt = link.rtt.write();
            rtt.clear();

            for peer in self.host.established() {
                if let Some(time) = self.host.round_trip_time(peer) {
                    rtt.insert(peer, time);
                }
            }

            self.published = now;
        }
    }

    fn close(&mut self, _link: &Link) {
        self.host.shutdown();
    }
}
