//! Application facing endpoints.
//!
//! An endpoint binds a transport to a dispatch channel and an RPC endpoint. Handlers are
//! registered before `start`; afterwards the owning thread calls `poll` once per tick, which
//! fires the connection callbacks, dispatches received frames and times out stale calls.
use crate::net::buffer::Buffer;
use crate::net::codec::{Message, WireArgs};
use crate::net::dispatch::Channel;
use crate::net::peer::{ClientTransport, Outbox, PeerEvent, PeerState, ServerTransport};
use crate::net::pool::Pools;
use crate::net::rpc::{Reply, RpcCall, RpcEndpoint, REQUEST_ID, REQUEST_NAME, RESPONSE_ID, RESPONSE_NAME};
use crate::net::shared::{fatal, ErrorType, NetworkResult, PeerId, HOST_PEER};
use crossbeam_channel::Receiver;
use flux::logging;
use flux::time::{Clock, MonotonicClock};
use indexmap::IndexSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

type ConnectedCallback = Box<dyn FnMut(PeerId, SocketAddr) + Send>;
type DisconnectedCallback = Box<dyn FnMut(PeerId) + Send>;

/// Transport independent half of an endpoint.
struct Hub {
    channel: Channel,
    rpc: Arc<RpcEndpoint>,
    outbox: Outbox,
    peers: IndexSet<PeerId>,
    on_connected: Option<ConnectedCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    log: logging::Logger,
}

impl Hub {
    fn new(outbox: Outbox, clock: Arc<dyn Clock>, log: &logging::Logger) -> Hub {
        let rpc = Arc::new(RpcEndpoint::new(clock, log));
        let mut channel = Channel::new(log);

        let serving = rpc.clone();
        let replies = outbox.clone();
        channel.reserve(REQUEST_ID, REQUEST_NAME, move |peer, reader| {
            serving.serve(peer, reader, &replies)
        });

        let resolving = rpc.clone();
        channel.reserve(RESPONSE_ID, RESPONSE_NAME, move |peer, reader| {
            resolving.resolve(peer, reader)
        });

        Hub {
            channel,
            rpc,
            outbox,
            peers: IndexSet::new(),
            on_connected: None,
            on_disconnected: None,
            log: log.clone(),
        }
    }

    #[inline]
    fn ensure_unlocked(&self) -> NetworkResult<()> {
        if self.channel.is_locked() {
            return fatal(ErrorType::HandlerLocked);
        }

        Ok(())
    }

    /// Handles the events queued at entry. Events arriving meanwhile wait for the next call.
    fn poll(&mut self, events: &Receiver<PeerEvent>, pools: &Pools) -> usize {
        let count = events.len();

        for event in events.try_iter().take(count) {
            match event {
                PeerEvent::Connected(peer, address) => {
                    self.peers.insert(peer);
                    logging::debug!(self.log, "Peer connected"; "peer" => peer, "address" => %address);

                    if let Some(callback) = self.on_connected.as_mut() {
                        callback(peer, address);
                    }
                }
                PeerEvent::Disconnected(peer) => self.forget(peer),
                PeerEvent::Data(peer, packet) => {
                    self.channel.dispatch(peer, packet, &pools.packets);
                }
            }
        }

        self.rpc.expire();
        count
    }

    fn forget(&mut self, peer: PeerId) {
        if !self.peers.swap_remove(&peer) {
            return;
        }

        let failed = self.rpc.disconnect(peer);
        logging::debug!(self.log, "Peer disconnected"; "peer" => peer, "failed_calls" => failed);

        if let Some(callback) = self.on_disconnected.as_mut() {
            callback(peer);
        }
    }

    fn shutdown(&mut self) {
        self.rpc.shutdown();

        let peers: Vec<PeerId> = self.peers.drain(..).collect();
        if let Some(callback) = self.on_disconnected.as_mut() {
            for peer in peers {
                callback(peer);
            }
        }

        self.channel.set_locked(false);
    }
}

/// Accepts many peers, each addressed by the id the transport assigned it.
pub struct Server<T: ServerTransport> {
    transport: T,
    hub: Hub,
}

impl<T: ServerTransport> Server<T> {
    pub fn new(transport: T, log: &logging::Logger) -> Server<T> {
        Server::with_clock(transport, Arc::new(MonotonicClock), log)
    }

    /// Uses `clock` for RPC deadlines.
    pub fn with_clock(transport: T, clock: Arc<dyn Clock>, log: &logging::Logger) -> Server<T> {
        let hub = Hub::new(transport.outbox(), clock, &log.new(logging::o!("endpoint" => "server")));
        Server { transport, hub }
    }

    /// Starts listening on `address`. Handler registration is frozen from here until shutdown.
    pub fn start(&mut self, address: SocketAddr) -> bool {
        if !self.transport.start(address) {
            return false;
        }

        self.hub.channel.set_locked(true);
        true
    }

    pub fn on_connected<F>(&mut self, callback: F)
    where
        F: FnMut(PeerId, SocketAddr) + Send + 'static,
    {
        self.hub.on_connected = Some(Box::new(callback));
    }

    pub fn on_disconnected<F>(&mut self, callback: F)
    where
        F: FnMut(PeerId) + Send + 'static,
    {
        self.hub.on_disconnected = Some(Box::new(callback));
    }

    pub fn register<M, F>(&mut self, handler: F) -> NetworkResult<()>
    where
        M: Message,
        F: FnMut(PeerId, M) + Send + 'static,
    {
        self.hub.channel.register(handler)
    }

    /// Like `register`, but every packet decodes into one reused instance.
    pub fn register_pooled<M, F>(&mut self, handler: F) -> NetworkResult<()>
    where
        M: Message + Default + Send,
        F: FnMut(PeerId, &M) + Send + 'static,
    {
        self.hub.channel.register_pooled(handler)
    }

    pub fn register_args<A, F>(&mut self, command: u32, name: &'static str, handler: F) -> NetworkResult<()>
    where
        A: WireArgs + 'static,
        F: FnMut(PeerId, A) + Send + 'static,
    {
        self.hub.channel.register_args(command, name, handler)
    }

    /// Answers requests of type `Req` with the handler's return value.
    pub fn register_request<Req, Resp, F>(&mut self, handler: F) -> NetworkResult<()>
    where
        Req: Message,
        Resp: Message,
        F: FnMut(PeerId, Req) -> Resp + Send + 'static,
    {
        self.hub.ensure_unlocked()?;
        self.hub.rpc.respond(handler);
        Ok(())
    }

    pub fn unregister<M: Message>(&mut self) -> NetworkResult<bool> {
        self.hub.channel.unregister::<M>()
    }

    #[inline]
    pub fn send<M: Message>(&self, peer: PeerId, message: &M) -> NetworkResult<()> {
        self.hub.outbox.send_message(peer, message)
    }

    #[inline]
    pub fn send_args<A: WireArgs>(&self, peer: PeerId, command: u32, args: A) -> NetworkResult<()> {
        self.hub.outbox.send_args(peer, command, args)
    }

    #[inline]
    pub fn broadcast<M: Message>(&self, message: &M) -> NetworkResult<()> {
        self.hub.outbox.broadcast_message(message)
    }

    /// Rents a frame writer for hand-built frames.
    #[inline]
    pub fn buffer(&self) -> Buffer {
        self.hub.outbox.buffer()
    }

    #[inline]
    pub fn send_buffer(&self, peer: PeerId, buffer: Buffer) -> NetworkResult<()> {
        self.hub.outbox.send(peer, buffer)
    }

    /// Calls `peer`. Peers this endpoint does not know complete as disconnected right away.
    pub fn send_async<Req, Resp>(&self, peer: PeerId, request: &Req, timeout: Duration) -> RpcCall<Resp>
    where
        Req: Message,
        Resp: Message + Send,
    {
        if !self.hub.peers.contains(&peer) {
            return RpcCall::settled(Reply::Disconnected);
        }

        self.hub.rpc.call(peer, request, timeout, &self.hub.outbox)
    }

    /// Drops `peer`. The disconnected callback fires once the transport confirms.
    #[inline]
    pub fn disconnect(&self, peer: PeerId) -> NetworkResult<()> {
        self.hub.outbox.disconnect(peer)
    }

    #[inline]
    pub fn poll(&mut self) -> usize {
        self.hub.poll(self.transport.events(), self.transport.pools())
    }

    /// Sending handle for use inside handlers.
    #[inline]
    pub fn outbox(&self) -> Outbox {
        self.hub.outbox.clone()
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.hub.peers.iter().copied()
    }

    #[inline]
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.hub.peers.contains(&peer)
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        self.transport.state()
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    #[inline]
    pub fn round_trip_time(&self, peer: PeerId) -> u32 {
        self.transport.round_trip_time(peer)
    }

    #[inline]
    pub fn pending_calls(&self) -> usize {
        self.hub.rpc.pending()
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Stops the transport, fails outstanding calls and reports every known peer as gone.
    pub fn shutdown(&mut self) {
        self.transport.shutdown();
        self.hub.shutdown();
    }
}

impl<T: ServerTransport> Drop for Server<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Talks to a single remote host.
pub struct Client<T: ClientTransport> {
    transport: T,
    hub: Hub,
}

impl<T: ClientTransport> Client<T> {
    pub fn new(transport: T, log: &logging::Logger) -> Client<T> {
        Client::with_clock(transport, Arc::new(MonotonicClock), log)
    }

    pub fn with_clock(transport: T, clock: Arc<dyn Clock>, log: &logging::Logger) -> Client<T> {
        let hub = Hub::new(transport.outbox(), clock, &log.new(logging::o!("endpoint" => "client")));
        Client { transport, hub }
    }

    /// Connects to `address`. Handler registration is frozen from here until shutdown.
    pub fn start(&mut self, address: SocketAddr) -> bool {
        if !self.transport.start(address) {
            return false;
        }

        self.hub.channel.set_locked(true);
        true
    }

    pub fn on_connected<F>(&mut self, mut callback: F)
    where
        F: FnMut(SocketAddr) + Send + 'static,
    {
        self.hub.on_connected = Some(Box::new(move |_, address| callback(address)));
    }

    pub fn on_disconnected<F>(&mut self, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.hub.on_disconnected = Some(Box::new(move |_| callback()));
    }

    pub fn register<M, F>(&mut self, mut handler: F) -> NetworkResult<()>
    where
        M: Message,
        F: FnMut(M) + Send + 'static,
    {
        self.hub.channel.register(move |_, message: M| handler(message))
    }

    pub fn register_pooled<M, F>(&mut self, mut handler: F) -> NetworkResult<()>
    where
        M: Message + Default + Send,
        F: FnMut(&M) + Send + 'static,
    {
        self.hub.channel.register_pooled(move |_, message: &M| handler(message))
    }

    pub fn register_args<A, F>(&mut self, command: u32, name: &'static str, mut handler: F) -> NetworkResult<()>
    where
        A: WireArgs + 'static,
        F: FnMut(A) + Send + 'static,
    {
        self.hub.channel.register_args(command, name, move |_, args: A| handler(args))
    }

    pub fn register_request<Req, Resp, F>(&mut self, mut handler: F) -> NetworkResult<()>
    where
        Req: Message,
        Resp: Message,
        F: FnMut(Req) -> Resp + Send + 'static,
    {
        self.hub.ensure_unlocked()?;
        self.hub.rpc.respond(move |_, request: Req| handler(request));
        Ok(())
    }

    pub fn unregister<M: Message>(&mut self) -> NetworkResult<bool> {
        self.hub.channel.unregister::<M>()
    }

    #[inline]
    pub fn send<M: Message>(&self, message: &M) -> NetworkResult<()> {
        self.hub.outbox.send_message(HOST_PEER, message)
    }

    #[inline]
    pub fn send_args<A: WireArgs>(&self, command: u32, args: A) -> NetworkResult<()> {
        self.hub.outbox.send_args(HOST_PEER, command, args)
    }

    #[inline]
    pub fn buffer(&self) -> Buffer {
        self.hub.outbox.buffer()
    }

    #[inline]
    pub fn send_buffer(&self, buffer: Buffer) -> NetworkResult<()> {
        self.hub.outbox.send(HOST_PEER, buffer)
    }

    /// Calls the host. Allowed while the connection is still being set up; requests queue
    /// behind the handshake.
    pub fn send_async<Req, Resp>(&self, request: &Req, timeout: Duration) -> RpcCall<Resp>
    where
        Req: Message,
        Resp: Message + Send,
    {
        match self.transport.state() {
            PeerState::Connecting | PeerState::Connected => {
                self.hub.rpc.call(HOST_PEER, request, timeout, &self.hub.outbox)
            }
            _ => RpcCall::settled(Reply::Disconnected),
        }
    }

    #[inline]
    pub fn disconnect(&self) -> NetworkResult<()> {
        self.hub.outbox.disconnect(HOST_PEER)
    }

    pub fn poll(&mut self) -> usize {
        let count = self.hub.poll(self.transport.events(), self.transport.pools());

        // A connect attempt that never succeeded reports no disconnect of its own.
        if matches!(self.transport.state(), PeerState::Disconnecting | PeerState::Stopped) {
            self.hub.rpc.disconnect(HOST_PEER);
        }

        count
    }

    #[inline]
    pub fn outbox(&self) -> Outbox {
        self.hub.outbox.clone()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.hub.peers.contains(&HOST_PEER)
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        self.transport.state()
    }

    #[inline]
    pub fn round_trip_time(&self) -> u32 {
        self.transport.round_trip_time()
    }

    #[inline]
    pub fn pending_calls(&self) -> usize {
        self.hub.rpc.pending()
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn shutdown(&mut self) {
        self.transport.shutdown();
        self.hub.shutdown();
    }
}

impl<T: ClientTransport> Drop for Client<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
