use crate::config::PeerTimeouts;
use crate::net::chunk::Chunk;
use crate::net::packet::Packet;
use crate::net::pool::{Pool, Pools};
use crate::net::shared::{fatal, ErrorType, NetworkResult, PeerId, MAX_FRAME_SIZE};
use crate::net::udp::frame::{Datagram, CONTROL_SIZE, HEADER_SIZE};
use byteorder::{BigEndian, ByteOrder};
use mio::net::UdpSocket;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unacknowledged payloads transmitted at once. Anything beyond waits its turn.
pub const WINDOW: usize = 256;
/// Transmissions of a single payload before the link is declared dead.
pub const MAX_ATTEMPTS: u32 = 12;
/// Interval between connect requests and between disconnect notices.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// How long a locally closed connection waits for the remote to acknowledge.
pub const LINGER: Duration = Duration::from_secs(1);

const MIN_RTO: Duration = Duration::from_millis(50);
const MAX_RTO: Duration = Duration::from_millis(2000);
const INITIAL_RTO: Duration = Duration::from_millis(200);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    /// Outgoing connection waiting for `Accept`.
    Connecting { cookie: u32, deadline: Instant },
    Connected,
    /// Closed locally, waiting for `DisconnectAck` until the linger runs out.
    Disconnecting { since: Instant },
}

struct InFlight {
    sequence: u32,
    datagram: Chunk,
    sent_at: Option<Instant>,
    attempts: u32,
}

/// Reliable, ordered stream of frames over a shared UDP socket.
///
/// Every payload datagram carries a sequence number and is retransmitted until acknowledged.
/// Frames arriving ahead of the expected sequence are parked and released in order once the
/// gap closes; duplicates are acknowledged again but never delivered twice.
pub struct Connection {
    id: PeerId,
    // Wire id the acceptor assigned, carried in every datagram header.
    remote: u32,
    address: SocketAddr,
    nonce: u32,
    state: LinkState,
    timeouts: PeerTimeouts,

    send_sequence: u32,
    recv_sequence: u32,
    unacked: VecDeque<InFlight>,
    early: BTreeMap<u32, Option<Packet>>,

    last_ingress: Instant,
    last_egress: Option<Instant>,
    last_ping: Instant,

    // Smoothed round trip time in milliseconds
    srtt: Option<u32>,
}

impl Connection {
    /// Connection created by accepting a remote `Connect`. The local id doubles as the wire id.
    pub fn incoming(id: PeerId, address: SocketAddr, nonce: u32, timeouts: PeerTimeouts, now: Instant) -> Connection {
        Connection::new(id, id, address, nonce, LinkState::Connected, timeouts, now)
    }

    /// Connection initiated locally. Stays in `Connecting` until the remote accepts or the
    /// deadline passes.
    pub fn outgoing(
        id: PeerId,
        address: SocketAddr,
        cookie: u32,
        nonce: u32,
        timeouts: PeerTimeouts,
        deadline: Instant,
        now: Instant,
    ) -> Connection {
        Connection::new(
            id,
            0,
            address,
            nonce,
            LinkState::Connecting { cookie, deadline },
            timeouts,
            now,
        )
    }

    fn new(
        id: PeerId,
        remote: u32,
        address: SocketAddr,
        nonce: u32,
        state: LinkState,
        timeouts: PeerTimeouts,
        now: Instant,
    ) -> Connection {
        Connection {
            id,
            remote,
            address,
            nonce,
            state,
            timeouts,
            send_sequence: 0,
            recv_sequence: 0,
            unacked: VecDeque::new(),
            early: BTreeMap::new(),
            last_ingress: now,
            last_egress: None,
            last_ping: now,
            srtt: None,
        }
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn remote(&self) -> u32 {
        self.remote
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    #[inline]
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Smoothed round trip time in milliseconds, if a sample exists.
    #[inline]
    pub fn round_trip_time(&self) -> Option<u32> {
        self.srtt
    }

    /// Payloads waiting for an acknowledgement, sent or not.
    #[inline]
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_ingress = now;
    }

    /// The remote accepted our `Connect` and assigned `remote` as the wire id. Payloads queued
    /// while connecting are restamped with it.
    pub fn accepted(&mut self, remote: u32, now: Instant) {
        self.remote = remote;
        self.state = LinkState::Connected;
        self.last_ingress = now;
        self.last_ping = now;

        for flight in self.unacked.iter_mut() {
            BigEndian::write_u32(&mut flight.datagram.filled_mut()[1..HEADER_SIZE], remote);
        }
    }

    /// Wraps the frame into a payload datagram and queues it for transmission.
    pub fn queue(&mut self, frame: &[u8], chunks: &Pool<Chunk>) -> NetworkResult<()> {
        if frame.is_empty() {
            return fatal(ErrorType::EmptyPayload);
        }

        if frame.len() > MAX_FRAME_SIZE {
            return fatal(ErrorType::PayloadTooLarge);
        }

        if let LinkState::Disconnecting { .. } = self.state {
            return fatal(ErrorType::NotConnected);
        }

        let sequence = self.send_sequence;
        let mut datagram = chunks.rent();

        match (Datagram::Payload { sequence, frame }).write(self.remote, &mut datagram) {
            Ok(len) => datagram.expand(len),
            Err(err) => {
                drop(chunks.give_back(datagram));
                return Err(err);
            }
        }

        self.send_sequence = sequence.wrapping_add(1);
        self.unacked.push_back(InFlight {
            sequence,
            datagram,
            sent_at: None,
            attempts: 0,
        });

        Ok(())
    }

    /// Drops the acknowledged payload and hands back its datagram for recycling. A first-attempt
    /// acknowledgement also feeds the round trip estimate.
    pub fn acknowledge(&mut self, sequence: u32, now: Instant) -> Option<Chunk> {
        let index = self.unacked.iter().position(|flight| flight.sequence == sequence)?;
        let flight = self.unacked.remove(index)?;

        if let (1, Some(sent_at)) = (flight.attempts, flight.sent_at) {
            self.sample(now.duration_since(sent_at));
        }

        Some(flight.datagram)
    }

    /// Feeds a round trip sample into the smoothed estimate.
    pub fn sample(&mut self, rtt: Duration) {
        let sample = rtt.as_millis().min(u128::from(u32::MAX)) as u32;

        self.srtt = Some(match self.srtt {
            Some(srtt) => ((u64::from(srtt) * 7 + u64::from(sample)) / 8) as u32,
            None => sample,
        });
    }

    /// Accepts an incoming payload. Frames are pushed to `out` strictly in sequence order;
    /// anything ahead of the expected sequence waits until the gap fills. Returns false for
    /// duplicates and for frames too far ahead to buffer.
    pub fn receive(&mut self, sequence: u32, frame: &[u8], packets: &Pool<Packet>, out: &mut Vec<Packet>) -> bool {
        let offset = sequence.wrapping_sub(self.recv_sequence);

        if offset == 0 {
            if let Some(packet) = packetize(frame, packets) {
                out.push(packet);
            }
            self.recv_sequence = self.recv_sequence.wrapping_add(1);

            while let Some(parked) = self.early.remove(&self.recv_sequence) {
                if let Some(packet) = parked {
                    out.push(packet);
                }
                self.recv_sequence = self.recv_sequence.wrapping_add(1);
            }

            return true;
        }

        if offset as usize >= WINDOW || self.early.contains_key(&sequence) {
            return false;
        }

        self.early.insert(sequence, packetize(frame, packets));
        true
    }

    /// Drives timers: connect retries, retransmission, keep-alive pings and the disconnect
    /// linger. Fails with `Timeout` when the link is dead and `Closed` once a local disconnect
    /// ran its course.
    pub fn service(&mut self, socket: &UdpSocket, now: Instant, stamp: u32) -> NetworkResult<()> {
        match self.state {
            LinkState::Connecting { cookie, deadline } => {
                if now >= deadline {
                    return fatal(ErrorType::Timeout);
                }

                if self.retry_due(now) {
                    let nonce = self.nonce;
                    self.control(socket, Datagram::Connect { cookie, nonce }, now);
                }
            }
            LinkState::Connected => {
                if now.duration_since(self.last_ingress) >= self.timeouts.idle_timeout() {
                    return fatal(ErrorType::Timeout);
                }

                self.transmit(socket, now)?;

                if now.duration_since(self.last_ping) >= self.timeouts.ping_interval() {
                    self.last_ping = now;
                    self.control(socket, Datagram::Ping { stamp }, now);
                }
            }
            LinkState::Disconnecting { since } => {
                if now.duration_since(since) >= LINGER {
                    return fatal(ErrorType::Closed);
                }

                if self.retry_due(now) {
                    self.control(socket, Datagram::Disconnect, now);
                }
            }
        }

        Ok(())
    }

    /// Sends every due payload within the window.
    fn transmit(&mut self, socket: &UdpSocket, now: Instant) -> NetworkResult<()> {
        let srtt = self.srtt;
        let address = self.address;
        let mut sent = false;

        for flight in self.unacked.iter_mut().take(WINDOW) {
            let due = match flight.sent_at {
                None => true,
                Some(at) => now.duration_since(at) >= retransmit_timeout(srtt, flight.attempts),
            };

            if !due {
                continue;
            }

            if flight.attempts >= MAX_ATTEMPTS {
                return fatal(ErrorType::Timeout);
            }

            match socket.send_to(&flight.datagram, address) {
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                // Anything else is a lost datagram as far as the protocol is concerned.
                _ => (),
            }

            flight.sent_at = Some(now);
            flight.attempts += 1;
            sent = true;
        }

        if sent {
            self.last_egress = Some(now);
        }

        Ok(())
    }

    /// Fire and forget control datagram to the remote.
    pub fn control(&mut self, socket: &UdpSocket, datagram: Datagram, now: Instant) {
        send_control(socket, self.address, self.remote, datagram);
        self.last_egress = Some(now);
    }

    /// Begins a local disconnect: unsent and undelivered data is released, the remote is
    /// notified until it acknowledges or the linger runs out.
    pub fn close(&mut self, socket: &UdpSocket, pools: &Pools, now: Instant) {
        self.discard(pools);
        self.state = LinkState::Disconnecting { since: now };
        self.control(socket, Datagram::Disconnect, now);
    }

    /// Returns every pooled resource the connection holds.
    pub fn release(mut self, pools: &Pools) {
        self.discard(pools);
    }

    fn discard(&mut self, pools: &Pools) {
        for flight in self.unacked.drain(..) {
            drop(pools.chunks.give_back(flight.datagram));
        }

        for packet in std::mem::take(&mut self.early).into_values().flatten() {
            drop(pools.packets.give_back(packet));
        }
    }

    #[inline]
    fn retry_due(&self, now: Instant) -> bool {
        match self.last_egress {
            Some(at) => now.duration_since(at) >= RETRY_INTERVAL,
            None => true,
        }
    }
}

/// Sends a control datagram outside of any connection, e.g. refusals and punches.
pub fn send_control(socket: &UdpSocket, address: SocketAddr, connection: u32, datagram: Datagram) {
    let mut raw = [0u8; CONTROL_SIZE];

    if let Ok(len) = datagram.write(connection, &mut raw) {
        drop(socket.send_to(&raw[..len], address));
    }
}

/// Retransmission timeout after `attempts` transmissions, doubling with each attempt.
fn retransmit_timeout(srtt: Option<u32>, attempts: u32) -> Duration {
    let base = match srtt {
        Some(srtt) => Duration::from_millis(u64::from(srtt) * 2 + 10),
        None => INITIAL_RTO,
    };

    let backoff = 1u32 << attempts.saturating_sub(1).min(6);
    (base * backoff).clamp(MIN_RTO, MAX_RTO)
}

/// Frames that fail to form a packet still occupy their sequence slot but are not delivered.
fn packetize(frame: &[u8], packets: &Pool<Packet>) -> Option<Packet> {
    let mut packet = packets.rent();

    match packet.fill(frame) {
        Ok(()) => Some(packet),
        Err(_) => {
            drop(packets.give_back(packet));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(command: u32, body: u8) -> Vec<u8> {
        let mut frame = command.to_le_bytes().to_vec();
        frame.push(body);
        frame
    }

    fn connected(now: Instant) -> Connection {
        Connection::incoming(1, "127.0.0.1:9".parse().unwrap(), 77, PeerTimeouts::default(), now)
    }

    #[test]
    fn test_in_order_delivery() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        let mut out = Vec::new();

        assert!(connection.receive(0, &frame(5, 0), &pools.packets, &mut out));
        assert!(connection.receive(1, &frame(5, 1), &pools.packets, &mut out));

        let bodies: Vec<u8> = out.iter().map(|packet| packet.payload()[0]).collect();
        assert_eq!(bodies, vec![0, 1]);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        let mut out = Vec::new();

        connection.receive(2, &frame(5, 2), &pools.packets, &mut out);
        connection.receive(1, &frame(5, 1), &pools.packets, &mut out);
        assert!(out.is_empty());

        connection.receive(0, &frame(5, 0), &pools.packets, &mut out);

        let bodies: Vec<u8> = out.iter().map(|packet| packet.payload()[0]).collect();
        assert_eq!(bodies, vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicates_ignored() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        let mut out = Vec::new();

        connection.receive(0, &frame(5, 0), &pools.packets, &mut out);
        assert!(!connection.receive(0, &frame(5, 0), &pools.packets, &mut out));

        connection.receive(2, &frame(5, 2), &pools.packets, &mut out);
        assert!(!connection.receive(2, &frame(5, 2), &pools.packets, &mut out));

        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_far_ahead_dropped() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        let mut out = Vec::new();

        assert!(!connection.receive(WINDOW as u32, &frame(5, 0), &pools.packets, &mut out));
        assert_eq!(pools.packets.outstanding(), 0);
    }

    #[test]
    fn test_sequence_wraps() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        connection.recv_sequence = u32::MAX;
        let mut out = Vec::new();

        connection.receive(0, &frame(5, 1), &pools.packets, &mut out);
        connection.receive(u32::MAX, &frame(5, 0), &pools.packets, &mut out);

        let bodies: Vec<u8> = out.iter().map(|packet| packet.payload()[0]).collect();
        assert_eq!(bodies, vec![0, 1]);
    }

    #[test]
    fn test_undecodable_frame_keeps_order() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());
        let mut out = Vec::new();

        connection.receive(1, &frame(5, 1), &pools.packets, &mut out);
        connection.receive(0, &[1, 2], &pools.packets, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(connection.recv_sequence, 2);
    }

    #[test]
    fn test_queue_and_acknowledge() {
        let pools = Pools::new();
        let now = Instant::now();
        let mut connection = connected(now);

        connection.queue(&frame(5, 0), &pools.chunks).unwrap();
        connection.queue(&frame(5, 1), &pools.chunks).unwrap();
        assert_eq!(connection.unacked(), 2);

        let chunk = connection.acknowledge(1, now).unwrap();
        assert_eq!(Datagram::read(&chunk).unwrap().1, Datagram::Payload { sequence: 1, frame: &frame(5, 1) });
        assert!(connection.acknowledge(1, now).is_none());
        assert_eq!(connection.unacked(), 1);
    }

    #[test]
    fn test_queue_rejects_bad_frames() {
        let pools = Pools::new();
        let mut connection = connected(Instant::now());

        assert!(connection.queue(&[], &pools.chunks).is_err());
        assert!(connection.queue(&[0; MAX_FRAME_SIZE + 1], &pools.chunks).is_err());
        assert_eq!(pools.chunks.outstanding(), 0);
    }

    #[test]
    fn test_accepted_restamps_queued() {
        let pools = Pools::new();
        let now = Instant::now();
        let mut connection = Connection::outgoing(
            3,
            "127.0.0.1:9".parse().unwrap(),
            1,
            2,
            PeerTimeouts::default(),
            now + Duration::from_secs(5),
            now,
        );

        connection.queue(&frame(5, 0), &pools.chunks).unwrap();
        connection.accepted(42, now);

        assert!(connection.is_connected());
        let chunk = connection.acknowledge(0, now).unwrap();
        assert_eq!(Datagram::read(&chunk).unwrap().0, 42);
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut connection = connected(Instant::now());

        connection.sample(Duration::from_millis(80));
        assert_eq!(connection.round_trip_time(), Some(80));

        connection.sample(Duration::from_millis(160));
        assert_eq!(connection.round_trip_time(), Some(90));
    }

    #[test]
    fn test_retransmit_timeout_backoff() {
        assert_eq!(retransmit_timeout(None, 1), INITIAL_RTO);
        assert_eq!(retransmit_timeout(None, 2), INITIAL_RTO * 2);
        assert_eq!(retransmit_timeout(Some(0), 1), MIN_RTO);
        assert_eq!(retransmit_timeout(Some(1000), 5), MAX_RTO);
    }

    #[test]
    fn test_service_timeouts() {
        let pools = Pools::new();
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let now = Instant::now();

        let mut connection = connected(now);
        assert!(connection.service(&socket, now, 0).is_ok());
        assert_eq!(
            connection.service(&socket, now + PeerTimeouts::default().idle_timeout(), 0),
            fatal(ErrorType::Timeout)
        );

        connection.close(&socket, &pools, now);
        assert!(connection.service(&socket, now, 0).is_ok());
        assert_eq!(connection.service(&socket, now + LINGER, 0), fatal(ErrorType::Closed));
    }

    #[test]
    fn test_retransmission_exhausted() {
        let pools = Pools::new();
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut now = Instant::now();

        let mut connection = connected(now);
        connection.queue(&frame(5, 0), &pools.chunks).unwrap();

        let mut result = Ok(());
        for _ in 0..=MAX_ATTEMPTS {
            connection.touch(now);
            result = connection.service(&socket, now, 0);
            now += MAX_RTO;
        }

        assert_eq!(result, fatal(ErrorType::Timeout));
        connection.release(&pools);
        assert_eq!(pools.chunks.outstanding(), 0);
    }
}
