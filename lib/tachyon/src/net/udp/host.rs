use crate::config::PeerTimeouts;
use crate::net::packet::Packet;
use crate::net::peer::PeerEvent;
use crate::net::pool::Pools;
use crate::net::security::{verify_cookie, Blacklist, Lifecycle};
use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult, PeerId};
use crate::net::udp::connection::{send_control, Connection, LinkState, LINGER};
use crate::net::udp::frame::Datagram;
use flux::logging;
use flux::time::timestamp_secs;
use hashbrown::HashMap;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HostConfig {
    /// Cookie required from unknown addresses asking to connect. `None` refuses to accept.
    pub accept: Option<u32>,
    pub max_connections: usize,
    /// Keep-alive tuning for accepted connections.
    pub timeouts: PeerTimeouts,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            accept: None,
            max_connections: 256,
            timeouts: PeerTimeouts::default(),
        }
    }
}

/// A UDP socket multiplexing any number of reliable connections, both accepted and initiated.
///
/// All traffic is driven by `service`, which drains the socket and runs connection timers.
/// Connection changes and delivered packets queue up until drained with `changes`.
pub struct Host {
    socket: UdpSocket,
    config: HostConfig,
    pools: Arc<Pools>,
    blacklist: Arc<dyn Blacklist>,

    // Storage
    lifecycle: Lifecycle,
    connections: HashMap<PeerId, Connection>,
    addresses: HashMap<SocketAddr, PeerId>,
    next_id: PeerId,

    changes: Vec<PeerEvent>,
    delivered: Vec<Packet>,
    expired: Vec<(PeerId, NetworkError)>,

    epoch: Instant,
    housekeeping_time: Instant,
    log: logging::Logger,
}

impl Host {
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

    pub fn bind(
        address: SocketAddr,
        config: HostConfig,
        pools: Arc<Pools>,
        blacklist: Arc<dyn Blacklist>,
        log: &logging::Logger,
    ) -> NetworkResult<Host> {
        let socket = UdpSocket::bind(address)?;
        let local = socket.local_addr()?;
        let now = Instant::now();

        Ok(Host {
            socket,
            config,
            pools,
            blacklist,
            lifecycle: Lifecycle::new(),
            connections: HashMap::new(),
            addresses: HashMap::new(),
            next_id: 1,
            changes: Vec::new(),
            delivered: Vec::new(),
            expired: Vec::new(),
            epoch: now,
            housekeeping_time: now,
            log: log.new(logging::o!("host" => local.to_string())),
        })
    }

    #[inline]
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[inline]
    pub fn blacklist(&self) -> &Arc<dyn Blacklist> {
        &self.blacklist
    }

    /// Starts or stops accepting connections from unknown addresses.
    pub fn listen(&mut self, cookie: Option<u32>, timeouts: PeerTimeouts) {
        self.config.accept = cookie;
        self.config.timeouts = timeouts;
    }

    /// Initiates a connection. The returned id reports `Connected` once the remote accepts, or
    /// `Disconnected` if it refuses or `timeout` runs out.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        cookie: u32,
        timeouts: PeerTimeouts,
        timeout: Duration,
        now: Instant,
    ) -> PeerId {
        if let Some(previous) = self.addresses.get(&address).copied() {
            self.terminate(previous, true, now);
        }

        let id = self.allocate();
        let nonce = nonce(id);
        let connection = Connection::outgoing(id, address, cookie, nonce, timeouts, now + timeout, now);

        self.lifecycle.begin(id);
        self.connections.insert(id, connection);
        self.addresses.insert(address, id);

        logging::debug!(self.log, "Connecting"; "peer" => id, "address" => %address);
        id
    }

    /// Queues a frame on the connection. Frames queued while connecting go out once accepted.
    pub fn send(&mut self, peer: PeerId, frame: &[u8]) -> NetworkResult<()> {
        match self.connections.get_mut(&peer) {
            Some(connection) => connection.queue(frame, &self.pools.chunks),
            None => fatal(ErrorType::NotConnected),
        }
    }

    /// Queues a frame on every established connection.
    pub fn broadcast(&mut self, frame: &[u8]) -> NetworkResult<()> {
        let connections = &mut self.connections;
        let chunks = &self.pools.chunks;

        for id in self.lifecycle.established() {
            if let Some(connection) = connections.get_mut(&id) {
                connection.queue(frame, chunks)?;
            }
        }

        Ok(())
    }

    /// Gracefully closes the connection. `Disconnected` is reported right away; the remote keeps
    /// being notified in the background until it acknowledges. `holds` stays true until then, so
    /// the socket must keep being serviced.
    pub fn disconnect(&mut self, peer: PeerId, now: Instant) -> bool {
        let state = match self.connections.get(&peer) {
            Some(connection) => connection.state(),
            None => return false,
        };

        match state {
            LinkState::Disconnecting { .. } => false,
            LinkState::Connecting { .. } => {
                self.terminate(peer, false, now);
                true
            }
            LinkState::Connected => {
                if let Some(connection) = self.connections.get_mut(&peer) {
                    connection.close(&self.socket, &self.pools, now);
                }

                self.lifecycle.remove(peer, now);
                self.changes.push(PeerEvent::Disconnected(peer));
                logging::info!(self.log, "Disconnected"; "peer" => peer);
                true
            }
        }
    }

    /// Sends a punch datagram, opening a mapping in any NAT between us and `address`.
    #[inline]
    pub fn punch(&self, address: SocketAddr) {
        send_control(&self.socket, address, 0, Datagram::Punch);
    }

    #[inline]
    pub fn round_trip_time(&self, peer: PeerId) -> Option<u32> {
        self.connections.get(&peer).and_then(Connection::round_trip_time)
    }

    /// True while any state for the connection remains, including a disconnect in progress.
    #[inline]
    pub fn holds(&self, peer: PeerId) -> bool {
        self.connections.contains_key(&peer)
    }

    #[inline]
    pub fn is_established(&self, peer: PeerId) -> bool {
        self.lifecycle.is_established(peer)
    }

    pub fn established(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.lifecycle.established()
    }

    /// Drains the socket and runs all connection timers.
    pub fn service(&mut self, now: Instant) {
        self.receive(now);
        self.update(now);

        if now.duration_since(self.housekeeping_time) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }
    }

    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.changes.drain(..)
    }

    /// Notifies every remote once and releases all connections. Nothing is reported.
    pub fn shutdown(&mut self) {
        for (_, connection) in self.connections.drain() {
            if connection.is_connected() {
                send_control(&self.socket, connection.address(), connection.remote(), Datagram::Disconnect);
            }
            connection.release(&self.pools);
        }

        for event in self.changes.drain(..) {
            if let PeerEvent::Data(_, packet) = event {
                drop(self.pools.packets.give_back(packet));
            }
        }

        self.addresses.clear();
        self.lifecycle = Lifecycle::new();
    }

    fn receive(&mut self, now: Instant) {
        let mut chunk = self.pools.chunks.rent();

        loop {
            chunk.clear();

            let (len, address) = match self.socket.recv_from(&mut chunk) {
                Ok(received) => received,
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        logging::debug!(self.log, "Receive failed"; "error" => %err);
                    }
                    break;
                }
            };

            chunk.expand(len);
            self.process(&chunk, address, now);
        }

        drop(self.pools.chunks.give_back(chunk));
    }

    fn process(&mut self, raw: &[u8], address: SocketAddr, now: Instant) {
        if self.blacklist.contains(&address.ip()) {
            return;
        }

        let known = self.addresses.get(&address).copied();

        match (known, Datagram::read(raw)) {
            (Some(id), Ok((wire, datagram))) => self.handle(id, wire, datagram, address, now),
            (Some(id), Err(err)) => self.violation(id, err, now),
            (None, Ok((_, Datagram::Connect { cookie, nonce }))) => self.accept(address, cookie, nonce, now),
            (None, Ok(_)) => (),
            (None, Err(err)) => {
                if self.config.accept.is_some() {
                    self.ban(address, err);
                }
            }
        }
    }

    fn accept(&mut self, address: SocketAddr, cookie: u32, nonce: u32, now: Instant) {
        let expected = match self.config.accept {
            Some(expected) => expected,
            None => return,
        };

        if let Err(err) = verify_cookie(expected, cookie) {
            self.ban(address, err);
            return;
        }

        if self.lifecycle.active_count() >= self.config.max_connections {
            logging::warn!(self.log, "Connection refused, host is full"; "address" => %address);
            send_control(&self.socket, address, 0, Datagram::Disconnect);
            return;
        }

        let id = self.allocate();
        let mut connection = Connection::incoming(id, address, nonce, self.config.timeouts, now);
        connection.control(&self.socket, Datagram::Accept { nonce }, now);

        self.lifecycle.begin(id);
        self.lifecycle.establish(id);
        self.connections.insert(id, connection);
        self.addresses.insert(address, id);
        self.changes.push(PeerEvent::Connected(id, address));

        logging::info!(self.log, "Accepted connection"; "peer" => id, "address" => %address);
    }

    fn handle(&mut self, id: PeerId, wire: u32, datagram: Datagram, address: SocketAddr, now: Instant) {
        let stamp = self.stamp(now);

        let connection = match self.connections.get_mut(&id) {
            Some(connection) => connection,
            None => return,
        };

        match connection.state() {
            LinkState::Disconnecting { .. } => {
                match datagram {
                    Datagram::Disconnect => {
                        send_control(&self.socket, address, wire, Datagram::DisconnectAck);
                        self.purge(id);
                    }
                    Datagram::DisconnectAck => self.purge(id),
                    Datagram::Connect { cookie, nonce } => {
                        self.purge(id);
                        self.accept(address, cookie, nonce, now);
                    }
                    _ => (),
                }
                return;
            }
            LinkState::Connecting { .. } => {
                match datagram {
                    Datagram::Accept { nonce } if nonce == connection.nonce() => {
                        connection.accepted(wire, now);
                        self.lifecycle.establish(id);
                        self.changes.push(PeerEvent::Connected(id, address));
                        logging::info!(self.log, "Connected"; "peer" => id, "address" => %address);
                    }
                    Datagram::Disconnect => {
                        logging::info!(self.log, "Connection refused"; "peer" => id, "address" => %address);
                        self.terminate(id, false, now);
                    }
                    _ => (),
                }
                return;
            }
            LinkState::Connected => (),
        }

        if let Datagram::Connect { cookie, nonce } = datagram {
            if nonce == connection.nonce() {
                // Our accept got lost
                connection.control(&self.socket, Datagram::Accept { nonce }, now);
            } else if self.config.accept.is_some() {
                logging::debug!(self.log, "Remote restarted its session"; "peer" => id);
                self.terminate(id, false, now);
                self.accept(address, cookie, nonce, now);
            }
            return;
        }

        if wire != connection.remote() {
            return;
        }

        connection.touch(now);

        match datagram {
            Datagram::Payload { sequence, frame } => {
                connection.control(&self.socket, Datagram::Ack { sequence }, now);
                connection.receive(sequence, frame, &self.pools.packets, &mut self.delivered);

                for packet in self.delivered.drain(..) {
                    self.changes.push(PeerEvent::Data(id, packet));
                }
            }
            Datagram::Ack { sequence } => {
                if let Some(chunk) = connection.acknowledge(sequence, now) {
                    drop(self.pools.chunks.give_back(chunk));
                }
            }
            Datagram::Ping { stamp: remote } => connection.control(&self.socket, Datagram::Pong { stamp: remote }, now),
            Datagram::Pong { stamp: sent } => {
                connection.sample(Duration::from_millis(u64::from(stamp.wrapping_sub(sent))));
            }
            Datagram::Disconnect => {
                send_control(&self.socket, address, wire, Datagram::DisconnectAck);
                logging::info!(self.log, "Remote disconnected"; "peer" => id);
                self.terminate(id, false, now);
            }
            Datagram::Connect { .. } | Datagram::Accept { .. } | Datagram::DisconnectAck | Datagram::Punch => (),
        }
    }

    /// Malformed traffic on a known connection ends it. The address is not banned: a peer that
    /// completed the handshake has already proven it speaks the protocol.
    fn violation(&mut self, id: PeerId, err: NetworkError, now: Instant) {
        logging::warn!(self.log, "Protocol violation"; "peer" => id, "error" => %err);

        if let Some(LinkState::Connecting { .. }) = self.connections.get(&id).map(Connection::state) {
            self.terminate(id, false, now);
        } else {
            self.disconnect(id, now);
        }
    }

    fn ban(&mut self, address: SocketAddr, err: NetworkError) {
        if self.blacklist.insert(address.ip()) {
            logging::warn!(self.log, "Blacklisted address"; "address" => %address.ip(), "reason" => %err);
        }
    }

    fn update(&mut self, now: Instant) {
        let stamp = self.stamp(now);
        let socket = &self.socket;
        let expired = &mut self.expired;

        for (id, connection) in self.connections.iter_mut() {
            if let Err(err) = connection.service(socket, now, stamp) {
                expired.push((*id, err));
            }
        }

        while let Some((id, err)) = self.expired.pop() {
            let state = match self.connections.get(&id) {
                Some(connection) => connection.state(),
                None => continue,
            };

            match state {
                LinkState::Disconnecting { .. } => self.purge(id),
                LinkState::Connecting { .. } => {
                    logging::info!(self.log, "Connect timed out"; "peer" => id);
                    self.terminate(id, false, now);
                }
                LinkState::Connected => {
                    logging::info!(self.log, "Connection lost"; "peer" => id, "error" => %err);
                    self.terminate(id, true, now);
                }
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        // Ids whose connection is long gone but never acknowledged.
        for id in self.lifecycle.purge(now, LINGER * 2) {
            logging::trace!(self.log, "Purged lingering id"; "peer" => id);
        }
    }

    /// Drops the connection immediately and reports it.
    fn terminate(&mut self, id: PeerId, notify: bool, now: Instant) {
        if let Some(connection) = self.connections.remove(&id) {
            if notify {
                send_control(&self.socket, connection.address(), connection.remote(), Datagram::Disconnect);
            }

            self.forget(&connection);
            connection.release(&self.pools);

            self.lifecycle.remove(id, now);
            self.lifecycle.acknowledge(id);
            self.changes.push(PeerEvent::Disconnected(id));
        }
    }

    /// Drops a connection whose disconnect was already reported.
    fn purge(&mut self, id: PeerId) {
        if let Some(connection) = self.connections.remove(&id) {
            self.forget(&connection);
            connection.release(&self.pools);
        }

        self.lifecycle.acknowledge(id);
    }

    fn forget(&mut self, connection: &Connection) {
        if self.addresses.get(&connection.address()) == Some(&connection.id()) {
            self.addresses.remove(&connection.address());
        }
    }

    fn allocate(&mut self) -> PeerId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);

            if !self.connections.contains_key(&id) && !self.lifecycle.is_removed(id) {
                return id;
            }
        }
    }

    /// Millisecond clock carried by pings.
    #[inline]
    fn stamp(&self, now: Instant) -> u32 {
        now.duration_since(self.epoch).as_millis() as u32
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Session nonce distinguishing reconnects from the same address.
fn nonce(id: PeerId) -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);

    nanos ^ (timestamp_secs() as u32) ^ id.rotate_left(16)
}
