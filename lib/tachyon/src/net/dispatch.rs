use crate::net::buffer::Reader;
use crate::net::codec::{Message, WireArgs};
use crate::net::packet::Packet;
use crate::net::pool::Pool;
use crate::net::shared::{fatal, ErrorType, NetworkResult, PeerId};
use flux::logging;
use hashbrown::HashMap;
use std::panic::{self, AssertUnwindSafe};

type Handler = Box<dyn FnMut(PeerId, &mut Reader) -> NetworkResult<()> + Send>;

struct Entry {
    name: &'static str,
    handler: Handler,
}

/// Outcome of a single dispatch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispatch {
    Handled,
    /// No handler for the command, the packet was dropped.
    Unhandled,
    /// The payload failed to decode or the handler panicked.
    Failed,
}

/// Command id to handler table. Handlers are registered while the owning endpoint is offline and
/// the table stays fixed for the duration of a session.
pub struct Channel {
    handlers: HashMap<u32, Entry>,
    locked: bool,
    log: logging::Logger,
}

impl Channel {
    pub fn new(log: &logging::Logger) -> Channel {
        Channel {
            handlers: HashMap::new(),
            locked: false,
            log: log.new(logging::o!("component" => "channel")),
        }
    }

    /// Installs a handler receiving decoded messages of type `T`. Re-registering `T` replaces
    /// the previous handler.
    pub fn register<T, F>(&mut self, mut handler: F) -> NetworkResult<()>
    where
        T: Message,
        F: FnMut(PeerId, T) + Send + 'static,
    {
        self.install(
            T::ID,
            T::NAME,
            Box::new(move |peer, reader| {
                let message = T::decode(reader)?;
                handler(peer, message);
                Ok(())
            }),
        )
    }

    /// Installs a handler that decodes every message into the same instance instead of
    /// allocating a new one per packet.
    pub fn register_pooled<T, F>(&mut self, mut handler: F) -> NetworkResult<()>
    where
        T: Message + Default + Send,
        F: FnMut(PeerId, &T) + Send + 'static,
    {
        let mut slot = T::default();

        self.install(
            T::ID,
            T::NAME,
            Box::new(move |peer, reader| {
                if let Err(err) = slot.decode_in_place(reader) {
                    // A partial decode must not leak into the next packet.
                    slot = T::default();
                    return Err(err);
                }

                handler(peer, &slot);
                Ok(())
            }),
        )
    }

    /// Installs a handler for a positional argument frame.
    pub fn register_args<A, F>(&mut self, command: u32, name: &'static str, mut handler: F) -> NetworkResult<()>
    where
        A: WireArgs + 'static,
        F: FnMut(PeerId, A) + Send + 'static,
    {
        self.install(
            command,
            name,
            Box::new(move |peer, reader| {
                let args = A::read_args(reader)?;
                handler(peer, args);
                Ok(())
            }),
        )
    }

    /// Installs a handler that reads the payload itself.
    pub fn register_raw<F>(&mut self, command: u32, name: &'static str, handler: F) -> NetworkResult<()>
    where
        F: FnMut(PeerId, &mut Reader) -> NetworkResult<()> + Send + 'static,
    {
        self.install(command, name, Box::new(handler))
    }

    /// Removes the handler for `T`, returning whether one was installed.
    pub fn unregister<T: Message>(&mut self) -> NetworkResult<bool> {
        self.unregister_command(T::ID)
    }

    pub fn unregister_command(&mut self, command: u32) -> NetworkResult<bool> {
        if self.locked {
            return fatal(ErrorType::HandlerLocked);
        }

        Ok(self.handlers.remove(&command).is_some())
    }

    #[inline]
    pub fn contains(&self, command: u32) -> bool {
        self.handlers.contains_key(&command)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freezes or unfreezes the handler table.
    #[inline]
    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Inserts a handler bypassing the lock. Used for the protocol level commands an endpoint
    /// wires up on construction.
    pub(crate) fn reserve<F>(&mut self, command: u32, name: &'static str, handler: F)
    where
        F: FnMut(PeerId, &mut Reader) -> NetworkResult<()> + Send + 'static,
    {
        self.handlers.insert(
            command,
            Entry {
                name,
                handler: Box::new(handler),
            },
        );
    }

    /// Looks up the packet's command and runs its handler. Unknown commands are ignored; decode
    /// errors and panics are contained and logged.
    pub fn invoke(&mut self, peer: PeerId, packet: &Packet) -> Dispatch {
        let entry = match self.handlers.get_mut(&packet.command()) {
            Some(entry) => entry,
            None => {
                logging::trace!(self.log, "Unhandled command"; "peer" => peer, "command" => packet.command());
                return Dispatch::Unhandled;
            }
        };

        let mut reader = packet.reader();
        let handler = &mut entry.handler;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(peer, &mut reader))) {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(err)) => {
                logging::warn!(self.log, "Dropped undecodable packet";
                               "peer" => peer, "message" => entry.name, "error" => %err);
                Dispatch::Failed
            }
            Err(_) => {
                logging::error!(self.log, "Handler panicked"; "peer" => peer, "message" => entry.name);
                Dispatch::Failed
            }
        }
    }

    /// Invokes the handler and returns the packet to its pool whatever the outcome.
    pub fn dispatch(&mut self, peer: PeerId, packet: Packet, pool: &Pool<Packet>) -> Dispatch {
        let result = self.invoke(peer, &packet);

        if let Err(err) = pool.give_back(packet) {
            logging::error!(self.log, "Packet pool rejected return"; "error" => %err);
        }

        result
    }

    fn install(&mut self, command: u32, name: &'static str, handler: Handler) -> NetworkResult<()> {
        if self.locked {
            return fatal(ErrorType::HandlerLocked);
        }

        if let Some(existing) = self.handlers.get(&command) {
            if existing.name != name {
                logging::error!(self.log, "Command id collision";
                                "command" => command, "existing" => existing.name, "new" => name);
                return fatal(ErrorType::CommandCollision(command));
            }
        }

        self.handlers.insert(command, Entry { name, handler });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::Buffer;
    use crate::net::codec::{command_id, write_args, write_message, Message};
    use crate::net::shared::NetworkError;
    use parking_lot::Mutex;
    use serde_derive::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
    struct Chat {
        text: String,
    }

    crate::message!(Chat);

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
    struct Impostor;

    // Same id as `Chat`, different type.
    impl Message for Impostor {
        const NAME: &'static str = "impostor";
        const ID: u32 = Chat::ID;

        fn encode(&self, _: &mut crate::net::buffer::Buffer) -> NetworkResult<()> {
            Ok(())
        }

        fn decode(_: &mut Reader) -> NetworkResult<Self> {
            Ok(Impostor)
        }
    }

    /// Delta update: a flag byte selects which fields follow.
    #[derive(Debug, Clone, PartialEq, Default)]
    struct Patch {
        a: u32,
        b: u32,
    }

    impl Message for Patch {
        const NAME: &'static str = "dispatch::Patch";

        fn encode(&self, buffer: &mut Buffer) -> NetworkResult<()> {
            buffer.write(3u8);
            buffer.write(self.a);
            buffer.write(self.b);
            Ok(())
        }

        fn decode(reader: &mut Reader) -> NetworkResult<Self> {
            let mut patch = Patch::default();
            patch.decode_in_place(reader)?;
            Ok(patch)
        }

        fn decode_in_place(&mut self, reader: &mut Reader) -> NetworkResult<()> {
            let flags: u8 = reader.read()?;

            if flags & 1 != 0 {
                self.a = reader.read()?;
            }

            if flags & 2 != 0 {
                self.b = reader.read()?;
            }

            Ok(())
        }
    }

    fn packet_of<T: Message>(pool: &Pool<Packet>, message: &T) -> Packet {
        let mut buffer = Buffer::new();
        write_message(message, &mut buffer).unwrap();

        let mut packet = pool.rent();
        packet.fill(buffer.as_slice()).unwrap();
        packet
    }

    fn raw_packet(pool: &Pool<Packet>, frame: &[u8]) -> Packet {
        let mut packet = pool.rent();
        packet.fill(frame).unwrap();
        packet
    }

    #[test]
    fn test_register_and_dispatch() {
        let pool = Pool::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut channel = Channel::new(&logging::discard());

        let sink = seen.clone();
        channel
            .register::<Chat, _>(move |peer, chat| sink.lock().push((peer, chat.text)))
            .unwrap();

        let packet = packet_of(&pool, &Chat { text: "hello".into() });
        assert_eq!(channel.dispatch(3, packet, &pool), Dispatch::Handled);

        assert_eq!(*seen.lock(), vec![(3, "hello".to_string())]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unknown_command_ignored() {
        let pool = Pool::new();
        let mut channel = Channel::new(&logging::discard());

        let packet = raw_packet(&pool, &[1, 2, 3, 4, 5]);
        assert_eq!(channel.dispatch(1, packet, &pool), Dispatch::Unhandled);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_decode_failure_contained() {
        let pool = Pool::new();
        let mut channel = Channel::new(&logging::discard());
        channel.register::<Chat, _>(|_, _| panic!("must not run")).unwrap();

        let mut frame = Chat::ID.to_le_bytes().to_vec();
        frame.extend_from_slice(&[200, 0, 0, 0, 0, 0, 0, 0, 1]);

        let packet = raw_packet(&pool, &frame);
        assert_eq!(channel.dispatch(1, packet, &pool), Dispatch::Failed);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_handler_panic_contained() {
        let pool = Pool::new();
        let mut channel = Channel::new(&logging::discard());
        channel.register::<Chat, _>(|_, _| panic!("boom")).unwrap();

        let packet = packet_of(&pool, &Chat::default());
        assert_eq!(channel.dispatch(1, packet, &pool), Dispatch::Failed);

        // The channel keeps working after the panic.
        let packet = packet_of(&pool, &Chat::default());
        assert_eq!(channel.dispatch(1, packet, &pool), Dispatch::Failed);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pooled_handler_reuses_instance() {
        let pool = Pool::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut channel = Channel::new(&logging::discard());

        let sink = seen.clone();
        channel
            .register_pooled::<Chat, _>(move |_, chat| sink.lock().push(chat.text.clone()))
            .unwrap();

        for text in &["one", "two"] {
            let packet = packet_of(&pool, &Chat { text: text.to_string() });
            channel.dispatch(1, packet, &pool);
        }

        assert_eq!(*seen.lock(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_pooled_slot_reset_after_failed_decode() {
        let pool = Pool::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut channel = Channel::new(&logging::discard());

        let sink = seen.clone();
        channel
            .register_pooled::<Patch, _>(move |_, patch| sink.lock().push(patch.clone()))
            .unwrap();

        let frame = |parts: &dyn Fn(&mut Buffer)| {
            let mut buffer = Buffer::new();
            buffer.write(Patch::ID);
            parts(&mut buffer);
            buffer.to_vec()
        };

        // b only
        let only_b = frame(&|buffer: &mut Buffer| {
            buffer.write(2u8);
            buffer.write(5u32);
        });
        // a and b announced, truncated after a
        let truncated = frame(&|buffer: &mut Buffer| {
            buffer.write(3u8);
            buffer.write(7u32);
        });
        let next_b = frame(&|buffer: &mut Buffer| {
            buffer.write(2u8);
            buffer.write(6u32);
        });

        channel.dispatch(1, raw_packet(&pool, &only_b), &pool);
        channel.dispatch(1, raw_packet(&pool, &truncated), &pool);
        channel.dispatch(1, raw_packet(&pool, &next_b), &pool);

        assert_eq!(*seen.lock(), vec![Patch { a: 0, b: 5 }, Patch { a: 0, b: 6 }]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_args_handler() {
        let pool = Pool::new();
        let seen = Arc::new(Mutex::new(None));
        let mut channel = Channel::new(&logging::discard());
        let command = command_id("move");

        let sink = seen.clone();
        channel
            .register_args::<(u32, f32), _>(command, "move", move |peer, args| *sink.lock() = Some((peer, args)))
            .unwrap();

        let mut buffer = Buffer::new();
        write_args(command, &(7u32, 0.5f32), &mut buffer).unwrap();
        let packet = raw_packet(&pool, buffer.as_slice());

        assert_eq!(channel.dispatch(2, packet, &pool), Dispatch::Handled);
        assert_eq!(*seen.lock(), Some((2, (7, 0.5))));
    }

    #[test]
    fn test_locked_registration() {
        let mut channel = Channel::new(&logging::discard());
        channel.set_locked(true);

        assert_eq!(
            channel.register::<Chat, _>(|_, _| ()),
            Err(NetworkError::Fatal(ErrorType::HandlerLocked))
        );
        assert_eq!(
            channel.unregister::<Chat>(),
            Err(NetworkError::Fatal(ErrorType::HandlerLocked))
        );

        channel.set_locked(false);
        assert!(channel.register::<Chat, _>(|_, _| ()).is_ok());
        assert_eq!(channel.unregister::<Chat>(), Ok(true));
        assert_eq!(channel.unregister::<Chat>(), Ok(false));
    }

    #[test]
    fn test_command_collision() {
        let mut channel = Channel::new(&logging::discard());

        channel.register::<Chat, _>(|_, _| ()).unwrap();
        // Same type replaces.
        channel.register::<Chat, _>(|_, _| ()).unwrap();

        assert_eq!(
            channel.register::<Impostor, _>(|_, _| ()),
            Err(NetworkError::Fatal(ErrorType::CommandCollision(Chat::ID)))
        );
        assert_eq!(channel.len(), 1);
    }
}
