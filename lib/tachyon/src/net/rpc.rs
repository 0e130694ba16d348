//! Request/response correlation on top of ordinary frames.
//!
//! A request travels as `[REQUEST_ID][serial][command][payload]` and its answer as
//! `[RESPONSE_ID][serial][payload]`. Callers get an `RpcCall` that resolves exactly once: with
//! the decoded response, or with a timeout/disconnect outcome. Deadlines are checked lazily every
//! time the owning endpoint polls.
use crate::net::buffer::{Buffer, Reader};
use crate::net::codec::{command_id, Message};
use crate::net::peer::Outbox;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult, PeerId, MAX_FRAME_SIZE};
use flux::logging;
use flux::time::Clock;
use futures::channel::oneshot;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

pub const REQUEST_NAME: &str = "tachyon::rpc::Request";
pub const RESPONSE_NAME: &str = "tachyon::rpc::Response";
pub const REQUEST_ID: u32 = command_id(REQUEST_NAME);
pub const RESPONSE_ID: u32 = command_id(RESPONSE_NAME);

/// Request envelope header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Request {
    pub serial: u32,
    pub command: u32,
}

impl Request {
    #[inline]
    pub fn write(&self, buffer: &mut Buffer) {
        buffer.write(self.serial);
        buffer.write(self.command);
    }

    #[inline]
    pub fn read(reader: &mut Reader) -> NetworkResult<Request> {
        Ok(Request {
            serial: reader.read()?,
            command: reader.read()?,
        })
    }
}

/// Response envelope header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Response {
    pub serial: u32,
}

impl Response {
    #[inline]
    pub fn write(&self, buffer: &mut Buffer) {
        buffer.write(self.serial);
    }

    #[inline]
    pub fn read(reader: &mut Reader) -> NetworkResult<Response> {
        Ok(Response { serial: reader.read()? })
    }
}

/// How a remote call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Value(T),
    TimedOut,
    Disconnected,
    /// The request could not be encoded or the response did not decode.
    Invalid,
}

impl<T> Reply<T> {
    #[inline]
    pub fn value(self) -> Option<T> {
        match self {
            Reply::Value(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        match self {
            Reply::Value(_) => true,
            _ => false,
        }
    }
}

/// Handle to an outstanding remote call. Either poll it with `try_reply` once per tick or await
/// it; the reply is yielded once.
#[derive(Debug)]
pub struct RpcCall<T> {
    serial: u32,
    receiver: oneshot::Receiver<Reply<T>>,
}

impl<T> RpcCall<T> {
    /// A call that never went out, already holding its outcome.
    pub(crate) fn settled(reply: Reply<T>) -> RpcCall<T> {
        let (sender, receiver) = oneshot::channel();
        drop(sender.send(reply));

        RpcCall { serial: 0, receiver }
    }

    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Non-blocking check. `None` while the call is still in flight.
    pub fn try_reply(&mut self) -> Option<Reply<T>> {
        match self.receiver.try_recv() {
            Ok(reply) => reply,
            Err(_) => Some(Reply::Disconnected),
        }
    }
}

impl<T> Future for RpcCall<T> {
    type Output = Reply<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply<T>> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Reply::Disconnected),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Settle<'a> {
    Response(&'a [u8]),
    TimedOut,
    Disconnected,
    Rejected,
}

type Completion = Box<dyn FnOnce(Settle) + Send>;
type Responder = Box<dyn FnMut(PeerId, &mut Reader, &mut Buffer) -> NetworkResult<()> + Send>;

struct Pending {
    peer: PeerId,
    deadline: Instant,
    complete: Completion,
}

/// Correlates outgoing requests with their responses and serves incoming requests.
pub struct RpcEndpoint {
    serial: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
    responders: Mutex<HashMap<u32, Responder>>,
    clock: Arc<dyn Clock>,
    log: logging::Logger,
}

impl RpcEndpoint {
    pub fn new(clock: Arc<dyn Clock>, log: &logging::Logger) -> RpcEndpoint {
        RpcEndpoint {
            serial: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            clock,
            log: log.new(logging::o!("component" => "rpc")),
        }
    }

    /// Number of calls still waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    #[inline]
    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Installs the handler answering requests of type `Req`. Replaces any previous handler for
    /// the same request type.
    pub fn respond<Req, Resp, F>(&self, mut handler: F)
    where
        Req: Message,
        Resp: Message,
        F: FnMut(PeerId, Req) -> Resp + Send + 'static,
    {
        let responder: Responder = Box::new(move |peer, reader, buffer| {
            let request = Req::decode(reader)?;
            handler(peer, request).encode(buffer)
        });

        self.responders.lock().insert(Req::ID, responder);
    }

    /// True if a handler answers requests of this command.
    pub fn responds_to(&self, command: u32) -> bool {
        self.responders.lock().contains_key(&command)
    }

    /// Sends `request` to `peer` and returns the handle its outcome arrives on.
    pub fn call<Req, Resp>(&self, peer: PeerId, request: &Req, timeout: Duration, outbox: &Outbox) -> RpcCall<Resp>
    where
        Req: Message,
        Resp: Message + Send,
    {
        let serial = self.next_serial();
        let (sender, receiver) = oneshot::channel::<Reply<Resp>>();

        let complete: Completion = Box::new(move |settle| {
            let reply = match settle {
                Settle::Response(bytes) => match Resp::decode(&mut Reader::new(bytes)) {
                    Ok(value) => Reply::Value(value),
                    Err(_) => Reply::Invalid,
                },
                Settle::TimedOut => Reply::TimedOut,
                Settle::Disconnected => Reply::Disconnected,
                Settle::Rejected => Reply::Invalid,
            };

            // The caller may have dropped the handle.
            drop(sender.send(reply));
        });

        let mut buffer = outbox.buffer();
        buffer.write(REQUEST_ID);
        Request { serial, command: Req::ID }.write(&mut buffer);

        if let Err(err) = request.encode(&mut buffer) {
            logging::warn!(self.log, "Failed to encode request"; "request" => Req::NAME, "error" => %err);
            outbox.release(buffer);
            complete(Settle::Rejected);
            return RpcCall { serial, receiver };
        }

        // Registered before sending so a fast response cannot overtake it.
        self.pending.lock().insert(
            serial,
            Pending {
                peer,
                deadline: self.clock.now() + timeout,
                complete,
            },
        );

        if let Err(err) = outbox.send(peer, buffer) {
            let settle = match err {
                NetworkError::Fatal(ErrorType::PayloadTooLarge) => Settle::Rejected,
                _ => Settle::Disconnected,
            };

            logging::debug!(self.log, "Request not sent"; "peer" => peer, "serial" => serial, "error" => %err);

            if let Some(pending) = self.pending.lock().remove(&serial) {
                (pending.complete)(settle);
            }
        }

        RpcCall { serial, receiver }
    }

    /// Answers a request frame. The reader is positioned right after the request command id.
    pub fn serve(&self, peer: PeerId, reader: &mut Reader, outbox: &Outbox) -> NetworkResult<()> {
        let request = Request::read(reader)?;

        // Taken out for the duration of the call so the handler may use this endpoint.
        let taken = self.responders.lock().remove(&request.command);
        let mut responder = match taken {
            Some(responder) => responder,
            None => {
                logging::warn!(self.log, "No responder for request"; "peer" => peer, "command" => request.command);
                return Ok(());
            }
        };

        let mut buffer = outbox.buffer();
        buffer.write(RESPONSE_ID);
        Response { serial: request.serial }.write(&mut buffer);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| responder(peer, reader, &mut buffer)));

        // A responder registered by the handler itself takes precedence.
        self.responders.lock().entry(request.command).or_insert(responder);

        match outcome {
            Ok(Ok(())) if buffer.position() > MAX_FRAME_SIZE => {
                logging::warn!(self.log, "Response exceeds frame limit"; "peer" => peer, "command" => request.command);
                outbox.release(buffer);
                Ok(())
            }
            Ok(Ok(())) => outbox.send(peer, buffer),
            Ok(Err(err)) => {
                outbox.release(buffer);
                Err(err)
            }
            Err(_) => {
                logging::error!(self.log, "Request handler panicked"; "peer" => peer, "command" => request.command);
                outbox.release(buffer);
                Ok(())
            }
        }
    }

    /// Completes the call a response frame belongs to. Responses with an unknown serial, or from
    /// a peer other than the one asked, are discarded.
    pub fn resolve(&self, peer: PeerId, reader: &mut Reader) -> NetworkResult<()> {
        let response = Response::read(reader)?;

        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&response.serial) {
                Some(record) if record.peer == peer => pending.remove(&response.serial),
                _ => None,
            }
        };

        match pending {
            Some(pending) => (pending.complete)(Settle::Response(reader.rest())),
            None => {
                logging::debug!(self.log, "Discarded stray response"; "peer" => peer, "serial" => response.serial)
            }
        }

        Ok(())
    }

    /// Times out every call whose deadline has passed. Returns how many were completed.
    pub fn expire(&self) -> usize {
        let now = self.clock.now();
        self.settle_where(|pending| pending.deadline <= now, || Settle::TimedOut)
    }

    /// Fails every call waiting on `peer`.
    pub fn disconnect(&self, peer: PeerId) -> usize {
        self.settle_where(|pending| pending.peer == peer, || Settle::Disconnected)
    }

    /// Fails every outstanding call.
    pub fn shutdown(&self) -> usize {
        self.settle_where(|_| true, || Settle::Disconnected)
    }

    fn settle_where<P, S>(&self, predicate: P, settle: S) -> usize
    where
        P: Fn(&Pending) -> bool,
        S: Fn() -> Settle<'static>,
    {
        let settled: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let serials: Vec<u32> = pending
                .iter()
                .filter(|(_, record)| predicate(record))
                .map(|(serial, _)| *serial)
                .collect();

            serials.iter().filter_map(|serial| pending.remove(serial)).collect()
        };

        let count = settled.len();
        for record in settled {
            (record.complete)(settle());
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::{Command, Outbox};
    use crate::net::pool::Pools;
    use crossbeam_channel::{unbounded, Receiver};
    use flux::time::ManualClock;
    use futures::executor::block_on;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Square(u32);

    crate::message!(Square);

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Squared(u64);

    crate::message!(Squared);

    struct Harness {
        clock: Arc<ManualClock>,
        rpc: RpcEndpoint,
        outbox: Outbox,
        queue: Receiver<Command>,
    }

    impl Harness {
        fn new() -> Harness {
            let clock = Arc::new(ManualClock::new());
            let (sender, queue) = unbounded();

            Harness {
                rpc: RpcEndpoint::new(clock.clone(), &logging::discard()),
                clock,
                outbox: Outbox::new(sender, Pools::new()),
                queue,
            }
        }

        /// Pops the next sent frame, checks its command and returns the bytes after it.
        fn sent(&self, command: u32) -> (PeerId, Vec<u8>) {
            match self.queue.try_recv() {
                Ok(Command::Send(peer, buffer)) => {
                    let mut reader = buffer.reader();
                    assert_eq!(reader.read::<u32>(), Ok(command));
                    let rest = reader.rest().to_vec();
                    self.outbox.release(buffer);
                    (peer, rest)
                }
                other => panic!("expected a sent frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_reserved_ids_differ() {
        assert_ne!(REQUEST_ID, RESPONSE_ID);
    }

    #[test]
    fn test_round_trip() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, Square(n)| Squared(u64::from(n) * u64::from(n)));

        let call = client.rpc.call::<Square, Squared>(1, &Square(12), Duration::from_secs(1), &client.outbox);
        assert_eq!(client.rpc.pending(), 1);

        let (peer, request) = client.sent(REQUEST_ID);
        assert_eq!(peer, 1);
        server.rpc.serve(5, &mut Reader::new(&request), &server.outbox).unwrap();

        let (peer, response) = server.sent(RESPONSE_ID);
        assert_eq!(peer, 5);
        client.rpc.resolve(1, &mut Reader::new(&response)).unwrap();

        assert_eq!(block_on(call), Reply::Value(Squared(144)));
        assert_eq!(client.rpc.pending(), 0);
    }

    #[test]
    fn test_out_of_order_responses() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, Square(n)| Squared(u64::from(n) * u64::from(n)));

        let mut first = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &client.outbox);
        let mut second = client.rpc.call::<Square, Squared>(1, &Square(3), Duration::from_secs(1), &client.outbox);
        assert_ne!(first.serial(), second.serial());

        let (_, first_request) = client.sent(REQUEST_ID);
        let (_, second_request) = client.sent(REQUEST_ID);

        server.rpc.serve(1, &mut Reader::new(&second_request), &server.outbox).unwrap();
        server.rpc.serve(1, &mut Reader::new(&first_request), &server.outbox).unwrap();

        let (_, second_response) = server.sent(RESPONSE_ID);
        client.rpc.resolve(1, &mut Reader::new(&second_response)).unwrap();

        assert_eq!(first.try_reply(), None);
        assert_eq!(second.try_reply(), Some(Reply::Value(Squared(9))));

        let (_, first_response) = server.sent(RESPONSE_ID);
        client.rpc.resolve(1, &mut Reader::new(&first_response)).unwrap();
        assert_eq!(first.try_reply(), Some(Reply::Value(Squared(4))));

        // A duplicate is discarded.
        client.rpc.resolve(1, &mut Reader::new(&first_response)).unwrap();
        assert_eq!(client.rpc.pending(), 0);
    }

    #[test]
    fn test_timeout() {
        let client = Harness::new();
        let mut call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_millis(100), &client.outbox);

        client.clock.advance(Duration::from_millis(99));
        assert_eq!(client.rpc.expire(), 0);
        assert_eq!(call.try_reply(), None);

        client.clock.advance(Duration::from_millis(1));
        assert_eq!(client.rpc.expire(), 1);
        assert_eq!(call.try_reply(), Some(Reply::TimedOut));
    }

    #[test]
    fn test_late_response_after_timeout() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, Square(n)| Squared(u64::from(n)));

        let call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_millis(10), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);

        client.clock.advance(Duration::from_millis(20));
        client.rpc.expire();

        server.rpc.serve(1, &mut Reader::new(&request), &server.outbox).unwrap();
        let (_, response) = server.sent(RESPONSE_ID);
        client.rpc.resolve(1, &mut Reader::new(&response)).unwrap();

        assert_eq!(block_on(call), Reply::TimedOut);
    }

    #[test]
    fn test_disconnect_fails_only_that_peer() {
        let client = Harness::new();
        let mut one = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(5), &client.outbox);
        let mut two = client.rpc.call::<Square, Squared>(2, &Square(2), Duration::from_secs(5), &client.outbox);

        assert_eq!(client.rpc.disconnect(1), 1);
        assert_eq!(one.try_reply(), Some(Reply::Disconnected));
        assert_eq!(two.try_reply(), None);

        assert_eq!(client.rpc.shutdown(), 1);
        assert_eq!(two.try_reply(), Some(Reply::Disconnected));
    }

    #[test]
    fn test_response_from_wrong_peer_discarded() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, Square(n)| Squared(u64::from(n)));

        let mut call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);
        server.rpc.serve(1, &mut Reader::new(&request), &server.outbox).unwrap();
        let (_, response) = server.sent(RESPONSE_ID);

        client.rpc.resolve(7, &mut Reader::new(&response)).unwrap();
        assert_eq!(call.try_reply(), None);

        client.rpc.resolve(1, &mut Reader::new(&response)).unwrap();
        assert_eq!(call.try_reply(), Some(Reply::Value(Squared(2))));
    }

    #[test]
    fn test_unknown_request_ignored() {
        let client = Harness::new();
        let server = Harness::new();

        let _call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);

        server.rpc.serve(1, &mut Reader::new(&request), &server.outbox).unwrap();
        assert!(server.queue.try_recv().is_err());
        assert_eq!(server.outbox.pools().buffers.outstanding(), 0);
    }

    #[test]
    fn test_responder_may_use_its_endpoint() {
        let client = Harness::new();
        let server = Harness::new();
        let endpoint = Arc::new(RpcEndpoint::new(server.clock.clone(), &logging::discard()));

        let weak = Arc::downgrade(&endpoint);
        endpoint.respond::<Square, Squared, _>(move |_, Square(n)| {
            if let Some(endpoint) = weak.upgrade() {
                assert!(!endpoint.responds_to(Squared::ID));
                endpoint.respond::<Squared, Square, _>(|_, Squared(n)| Square(n as u32));
                endpoint.respond::<Square, Squared, _>(|_, Square(n)| Squared(u64::from(n) + 1));
            }
            Squared(u64::from(n))
        });

        let first = client.rpc.call::<Square, Squared>(1, &Square(4), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);
        endpoint.serve(1, &mut Reader::new(&request), &server.outbox).unwrap();
        let (_, response) = server.sent(RESPONSE_ID);
        client.rpc.resolve(1, &mut Reader::new(&response)).unwrap();
        assert_eq!(block_on(first), Reply::Value(Squared(4)));

        assert!(endpoint.responds_to(Square::ID));
        assert!(endpoint.responds_to(Squared::ID));

        // The replacement installed from inside the handler is kept.
        let second = client.rpc.call::<Square, Squared>(1, &Square(4), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);
        endpoint.serve(1, &mut Reader::new(&request), &server.outbox).unwrap();
        let (_, response) = server.sent(RESPONSE_ID);
        client.rpc.resolve(1, &mut Reader::new(&response)).unwrap();
        assert_eq!(block_on(second), Reply::Value(Squared(5)));
    }

    #[test]
    fn test_responder_kept_after_panic() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, Square(n)| {
            assert!(n > 0);
            Squared(u64::from(n))
        });

        let _call = client.rpc.call::<Square, Squared>(1, &Square(0), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);
        assert!(server.rpc.serve(1, &mut Reader::new(&request), &server.outbox).is_ok());
        assert!(server.queue.try_recv().is_err());

        assert!(server.rpc.responds_to(Square::ID));
    }

    #[test]
    fn test_responder_panic_contained() {
        let client = Harness::new();
        let server = Harness::new();
        server.rpc.respond::<Square, Squared, _>(|_, _| panic!("boom"));

        let _call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &client.outbox);
        let (_, request) = client.sent(REQUEST_ID);

        assert!(server.rpc.serve(1, &mut Reader::new(&request), &server.outbox).is_ok());
        assert!(server.queue.try_recv().is_err());
    }

    #[test]
    fn test_send_failure_completes_immediately() {
        let clock = Arc::new(ManualClock::new());
        let rpc = RpcEndpoint::new(clock, &logging::discard());
        let (sender, queue) = unbounded();
        drop(queue);
        let outbox = Outbox::new(sender, Pools::new());

        let mut call = rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &outbox);
        assert_eq!(call.try_reply(), Some(Reply::Disconnected));
        assert_eq!(rpc.pending(), 0);
    }

    #[test]
    fn test_mismatched_response_type_is_invalid() {
        let client = Harness::new();

        let call = client.rpc.call::<Square, Squared>(1, &Square(2), Duration::from_secs(1), &client.outbox);

        let mut response = Buffer::new();
        Response { serial: call.serial() }.write(&mut response);
        response.write(1u8);
        client.rpc.resolve(1, &mut response.reader()).unwrap();

        assert_eq!(block_on(call), Reply::Invalid);
    }
}
