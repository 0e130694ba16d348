//! Transport peer plumbing shared by every transport.
//!
//! A transport owns one background thread running a tick loop over a `Pump`. Two queues bridge
//! that thread and the consumer: outbound `Command`s flow in through an `Outbox`, inbound
//! `PeerEvent`s flow out and are drained by the endpoint's `poll`.
use crate::net::buffer::Buffer;
use crate::net::codec::{write_args, write_message, Message, WireArgs};
use crate::net::packet::Packet;
use crate::net::pool::Pools;
use crate::net::shared::{fatal, ErrorType, NetworkResult, PeerId, MAX_FRAME_SIZE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use flux::choose;
use flux::logging;
use hashbrown::HashMap;
use mio::{Events, Poll, Registry, Waker};
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Token reserved for the waker on every transport poll.
pub(crate) const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX);

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    Idle = 0,
    Listening = 1,
    Connecting = 2,
    Accepting = 3,
    Connected = 4,
    Disconnecting = 5,
    Stopped = 6,
}

impl From<u8> for PeerState {
    fn from(value: u8) -> Self {
        match value {
            0 => PeerState::Idle,
            1 => PeerState::Listening,
            2 => PeerState::Connecting,
            3 => PeerState::Accepting,
            4 => PeerState::Connected,
            5 => PeerState::Disconnecting,
            _ => PeerState::Stopped,
        }
    }
}

/// Peer state readable from both sides of the queues.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> StateCell {
        StateCell(Arc::new(AtomicU8::new(PeerState::Idle as u8)))
    }

    #[inline]
    pub fn get(&self) -> PeerState {
        self.0.load(Ordering::Acquire).into()
    }

    #[inline]
    pub fn set(&self, state: PeerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Events surfaced by a transport.
#[derive(Debug)]
pub enum PeerEvent {
    Connected(PeerId, SocketAddr),
    Disconnected(PeerId),
    Data(PeerId, Packet),
}

/// Work queued for the I/O thread.
#[derive(Debug)]
pub(crate) enum Command {
    Send(PeerId, Buffer),
    Broadcast(Buffer),
    Disconnect(PeerId),
}

/// Producer side of a transport's outbound queue. Cheap to clone and never blocks.
#[derive(Clone)]
pub struct Outbox {
    sender: Sender<Command>,
    pools: Arc<Pools>,
}

impl Outbox {
    pub(crate) fn new(sender: Sender<Command>, pools: Arc<Pools>) -> Outbox {
        Outbox { sender, pools }
    }

    #[cfg(test)]
    pub(crate) fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    /// Rents an empty frame writer. Fill it with `[command][payload]` and pass it to `send`.
    #[inline]
    pub fn buffer(&self) -> Buffer {
        self.pools.buffers.rent()
    }

    /// Returns an unsent writer to its pool.
    #[inline]
    pub fn release(&self, buffer: Buffer) {
        drop(self.pools.buffers.give_back(buffer));
    }

    pub fn send(&self, peer: PeerId, buffer: Buffer) -> NetworkResult<()> {
        self.submit(buffer, |buffer| Command::Send(peer, buffer))
    }

    pub fn broadcast(&self, buffer: Buffer) -> NetworkResult<()> {
        self.submit(buffer, Command::Broadcast)
    }

    pub fn disconnect(&self, peer: PeerId) -> NetworkResult<()> {
        self.sender
            .send(Command::Disconnect(peer))
            .or_else(|_| fatal(ErrorType::Closed))
    }

    pub fn send_message<T: Message>(&self, peer: PeerId, message: &T) -> NetworkResult<()> {
        let mut buffer = self.buffer();

        match write_message(message, &mut buffer) {
            Ok(()) => self.send(peer, buffer),
            Err(err) => {
                self.release(buffer);
                Err(err)
            }
        }
    }

    pub fn broadcast_message<T: Message>(&self, message: &T) -> NetworkResult<()> {
        let mut buffer = self.buffer();

        match write_message(message, &mut buffer) {
            Ok(()) => self.broadcast(buffer),
            Err(err) => {
                self.release(buffer);
                Err(err)
            }
        }
    }

    pub fn send_args<A: WireArgs>(&self, peer: PeerId, command: u32, args: A) -> NetworkResult<()> {
        let mut buffer = self.buffer();

        match write_args(command, &args, &mut buffer) {
            Ok(()) => self.send(peer, buffer),
            Err(err) => {
                self.release(buffer);
                Err(err)
            }
        }
    }

    fn submit<F: FnOnce(Buffer) -> Command>(&self, buffer: Buffer, wrap: F) -> NetworkResult<()> {
        if buffer.position() > MAX_FRAME_SIZE {
            self.release(buffer);
            return fatal(ErrorType::PayloadTooLarge);
        }

        self.sender.send(wrap(buffer)).or_else(|err| {
            match err.into_inner() {
                Command::Send(_, buffer) | Command::Broadcast(buffer) => self.release(buffer),
                Command::Disconnect(_) => (),
            }
            fatal(ErrorType::Closed)
        })
    }
}

/// Server side transport.
pub trait ServerTransport {
    /// Binds and spawns the I/O thread. Returns false, with everything released, on failure.
    fn start(&mut self, address: SocketAddr) -> bool;
    fn state(&self) -> PeerState;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn outbox(&self) -> Outbox;
    fn events(&self) -> &Receiver<PeerEvent>;
    fn pools(&self) -> &Arc<Pools>;
    /// Smoothed round trip time in milliseconds, 0 when unknown or unsupported.
    fn round_trip_time(&self, peer: PeerId) -> u32;
    fn shutdown(&mut self);
}

/// Client side transport. The remote host is always `HOST_PEER`.
pub trait ClientTransport {
    /// Opens the connection to `address`. Returns false, with everything released, on failure.
    fn start(&mut self, address: SocketAddr) -> bool;
    fn state(&self) -> PeerState;
    fn outbox(&self) -> Outbox;
    fn events(&self) -> &Receiver<PeerEvent>;
    fn pools(&self) -> &Arc<Pools>;
    fn round_trip_time(&self) -> u32;
    fn shutdown(&mut self);
}

/// Tick loop timing.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Cadence {
    pub tick: Duration,
    pub no_delay: bool,
}

impl Cadence {
    pub fn new(tick_ms: u64, no_delay: bool) -> Cadence {
        Cadence {
            tick: Duration::from_millis(tick_ms.max(1)),
            no_delay,
        }
    }
}

/// Everything the I/O thread shares with the consumer side.
pub(crate) struct Link {
    pub running: Arc<AtomicBool>,
    pub state: StateCell,
    pub outbound: Receiver<Command>,
    pub inbound: Sender<PeerEvent>,
    pub pools: Arc<Pools>,
    pub rtt: Arc<RwLock<HashMap<PeerId, u32>>>,
    pub cadence: Cadence,
    pub log: logging::Logger,
}

impl Link {
    #[inline]
    pub fn emit(&self, event: PeerEvent) {
        if let Err(err) = self.inbound.send(event) {
            // Consumer is gone, nothing will ever read the packet.
            if let PeerEvent::Data(_, packet) = err.into_inner() {
                self.release_packet(packet);
            }
        }
    }

    #[inline]
    pub fn release_buffer(&self, buffer: Buffer) {
        if let Err(err) = self.pools.buffers.give_back(buffer) {
            logging::error!(self.log, "Buffer pool rejected return"; "error" => %err);
        }
    }

    #[inline]
    pub fn release_packet(&self, packet: Packet) {
        if let Err(err) = self.pools.packets.give_back(packet) {
            logging::error!(self.log, "Packet pool rejected return"; "error" => %err);
        }
    }

    pub fn release_command(&self, command: Command) {
        match command {
            Command::Send(_, buffer) | Command::Broadcast(buffer) => self.release_buffer(buffer),
            Command::Disconnect(_) => (),
        }
    }

    /// Ends the loop from inside the I/O thread.
    #[inline]
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Transport specific half of the I/O loop.
pub(crate) trait Pump: Send + 'static {
    /// Handles one outbound command.
    fn route(&mut self, command: Command, link: &Link, now: Instant);
    /// Runs incoming I/O and timers, then flushes pending output.
    fn tick(&mut self, registry: &Registry, link: &Link, now: Instant);
    /// Best effort teardown once the loop exits.
    fn close(&mut self, link: &Link);
}

/// The I/O thread body: outgoing, incoming, flush, then wait on the poll for up to one tick.
pub(crate) fn run<P: Pump>(mut pump: P, mut poll: Poll, link: Link) {
    let mut events = Events::with_capacity(256);
    let timeout = choose!(link.cadence.no_delay => Duration::from_millis(0), link.cadence.tick);

    while link.running.load(Ordering::Acquire) {
        let now = Instant::now();

        for command in link.outbound.try_iter() {
            pump.route(command, &link, now);
        }

        pump.tick(poll.registry(), &link, now);

        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                logging::error!(link.log, "Poll failed, stopping transport"; "error" => %err);
                break;
            }
        }
    }

    pump.close(&link);

    for command in link.outbound.try_iter() {
        link.release_command(command);
    }

    link.rtt.write().clear();
    link.state.set(PeerState::Stopped);
}

struct Worker {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: thread::JoinHandle<()>,
}

/// State common to every transport peer: the queues, pools, rtt snapshot and the I/O thread.
pub(crate) struct PeerCore {
    pub state: StateCell,
    pub pools: Arc<Pools>,
    inbound_tx: Sender<PeerEvent>,
    inbound_rx: Receiver<PeerEvent>,
    outbound_tx: Sender<Command>,
    outbound_rx: Option<Receiver<Command>>,
    rtt: Arc<RwLock<HashMap<PeerId, u32>>>,
    worker: Option<Worker>,
    pub log: logging::Logger,
}

impl PeerCore {
    pub fn new(log: &logging::Logger) -> PeerCore {
        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();

        PeerCore {
            state: StateCell::new(),
            pools: Pools::new(),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            rtt: Arc::new(RwLock::new(HashMap::new())),
            worker: None,
            log: log.clone(),
        }
    }

    #[inline]
    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.outbound_tx.clone(), self.pools.clone())
    }

    #[inline]
    pub fn events(&self) -> &Receiver<PeerEvent> {
        &self.inbound_rx
    }

    #[inline]
    pub fn round_trip_time(&self, peer: PeerId) -> u32 {
        self.rtt.read().get(&peer).copied().unwrap_or(0)
    }

    /// True when a start attempt is allowed.
    pub fn can_start(&self) -> bool {
        if self.state.get() != PeerState::Idle || self.outbound_rx.is_none() {
            logging::warn!(self.log, "Transport already started"; "state" => ?self.state.get());
            return false;
        }

        true
    }

    /// Creates the poll and its waker.
    pub fn poll() -> io::Result<(Poll, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok((poll, waker))
    }

    /// Spawns the I/O thread. Everything fallible about the transport must be done by now.
    pub fn launch<P: Pump>(&mut self, name: &str, pump: P, poll: Poll, waker: Arc<Waker>, cadence: Cadence) -> bool {
        let outbound = match self.outbound_rx.take() {
            Some(outbound) => outbound,
            None => return false,
        };

        let running = Arc::new(AtomicBool::new(true));

        let link = Link {
            running: running.clone(),
            state: self.state.clone(),
            outbound,
            inbound: self.inbound_tx.clone(),
            pools: self.pools.clone(),
            rtt: self.rtt.clone(),
            cadence,
            log: self.log.clone(),
        };

        match thread::Builder::new()
            .name(name.into())
            .spawn(move || run(pump, poll, link))
        {
            Ok(thread) => {
                self.worker = Some(Worker { running, waker, thread });
                true
            }
            Err(err) => {
                logging::error!(self.log, "Failed to spawn transport thread"; "error" => %err);
                self.state.set(PeerState::Stopped);
                false
            }
        }
    }

    /// Stops the I/O thread and releases everything still queued. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            drop(worker.waker.wake());

            if worker.thread.join().is_err() {
                logging::error!(self.log, "Transport thread panicked");
            }
        }

        for event in self.inbound_rx.try_iter() {
            if let PeerEvent::Data(_, packet) = event {
                drop(self.pools.packets.give_back(packet));
            }
        }

        if let Some(outbound) = self.outbound_rx.take() {
            for command in outbound.try_iter() {
                match command {
                    Command::Send(_, buffer) | Command::Broadcast(buffer) => drop(self.pools.buffers.give_back(buffer)),
                    Command::Disconnect(_) => (),
                }
            }
        }

        if self.state.get() != PeerState::Stopped {
            logging::debug!(self.log, "Transport stopped");
        }

        self.state.set(PeerState::Stopped);
    }
}

impl Drop for PeerCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
