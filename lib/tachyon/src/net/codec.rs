//! Wire codec.
//!
//! Every frame on the wire is `[command id: u32][payload]`. The command id of a message type is
//! the FNV-1a hash of its fully qualified name, so both ends derive it independently without a
//! shared registry. Payloads of `Message` types go through bincode by default; positional
//! argument frames (`WireArgs`) are raw little endian primitives.
use crate::net::buffer::{Buffer, Primitive, Reader};
use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult, COMMAND_SIZE, MAX_FRAME_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable 32-bit command id for a type name.
pub const fn command_id(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET;
    let mut idx = 0;

    while idx < bytes.len() {
        hash ^= bytes[idx] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        idx += 1;
    }

    hash
}

/// A type that travels as the payload of a frame.
///
/// Implement it through the `message!` macro, which names the type after its module path and
/// uses bincode for the payload. Types needing a hand-tuned layout implement `encode`/`decode`
/// directly.
pub trait Message: Sized + 'static {
    const NAME: &'static str;
    const ID: u32 = command_id(Self::NAME);

    fn encode(&self, buffer: &mut Buffer) -> NetworkResult<()>;
    fn decode(reader: &mut Reader) -> NetworkResult<Self>;

    /// Decodes into an existing instance, letting pooled handlers reuse their allocations.
    fn decode_in_place(&mut self, reader: &mut Reader) -> NetworkResult<()> {
        *self = Self::decode(reader)?;
        Ok(())
    }
}

/// Implements `Message` for a serde type.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Ping { value: u32 }
/// message!(Ping);
/// ```
///
/// The second form pins the name explicitly, for types that must keep their command id across
/// module moves.
#[macro_export]
macro_rules! message {
    ($name:ident) => {
        $crate::message!($name, concat!(module_path!(), "::", stringify!($name)));
    };
    ($name:ident, $path:expr) => {
        impl $crate::net::codec::Message for $name {
            const NAME: &'static str = $path;

            #[inline]
            fn encode(&self, buffer: &mut $crate::net::buffer::Buffer) -> $crate::net::shared::NetworkResult<()> {
                $crate::net::codec::encode_serde(self, buffer)
            }

            #[inline]
            fn decode(reader: &mut $crate::net::buffer::Reader) -> $crate::net::shared::NetworkResult<Self> {
                $crate::net::codec::decode_serde(reader)
            }
        }
    };
}

#[inline]
pub fn encode_serde<T: Serialize>(value: &T, buffer: &mut Buffer) -> NetworkResult<()> {
    bincode::serialize_into(buffer, value).or_else(|_| fatal(ErrorType::Serialization))
}

#[inline]
pub fn decode_serde<T: DeserializeOwned>(reader: &mut Reader) -> NetworkResult<T> {
    bincode::deserialize_from(reader).map_err(NetworkError::from)
}

/// Writes a complete `[id][payload]` frame for the message, failing if it outgrows
/// `MAX_FRAME_SIZE`.
pub fn write_message<T: Message>(message: &T, buffer: &mut Buffer) -> NetworkResult<()> {
    let start = buffer.position();
    buffer.write(T::ID);
    message.encode(buffer)?;

    if buffer.position() - start > MAX_FRAME_SIZE {
        return fatal(ErrorType::PayloadTooLarge);
    }

    Ok(())
}

/// Owned frame, used where a frame has to outlive the buffer it was read from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub command: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn of<T: Message>(message: &T) -> NetworkResult<Frame> {
        let mut buffer = Buffer::new();
        message.encode(&mut buffer)?;

        Frame::check_size(buffer.position())?;

        Ok(Frame {
            command: T::ID,
            payload: buffer.to_vec(),
        })
    }

    pub fn serialize(&self, buffer: &mut Buffer) -> NetworkResult<()> {
        Frame::check_size(self.payload.len())?;

        buffer.write(self.command);
        buffer.write_slice(&self.payload);
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> NetworkResult<Frame> {
        if bytes.len() < COMMAND_SIZE {
            return fatal(ErrorType::EmptyPayload);
        }

        Frame::check_size(bytes.len() - COMMAND_SIZE)?;

        Ok(Frame {
            command: u32::load(&bytes[..COMMAND_SIZE]),
            payload: bytes[COMMAND_SIZE..].to_vec(),
        })
    }

    /// Decodes the payload as `T`, refusing frames tagged with another command.
    pub fn decode<T: Message>(&self) -> NetworkResult<T> {
        if self.command != T::ID {
            return fatal(ErrorType::CommandMismatch);
        }

        T::decode(&mut Reader::new(&self.payload))
    }

    #[inline]
    fn check_size(payload: usize) -> NetworkResult<()> {
        if payload + COMMAND_SIZE > MAX_FRAME_SIZE {
            return fatal(ErrorType::PayloadTooLarge);
        }

        Ok(())
    }
}

/// Positional argument lists sent without a message type: `send_args(command, (a, b, c))`.
pub trait WireArgs: Sized {
    fn write_args(&self, buffer: &mut Buffer);
    fn read_args(reader: &mut Reader) -> NetworkResult<Self>;
}

macro_rules! wire_args {
    ($($name:ident),+) => {
        impl<$($name: Primitive),+> WireArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            #[inline]
            fn write_args(&self, buffer: &mut Buffer) {
                let ($($name,)+) = *self;
                $(buffer.write($name);)+
            }

            #[inline]
            fn read_args(reader: &mut Reader) -> NetworkResult<Self> {
                Ok(($(reader.read::<$name>()?,)+))
            }
        }
    };
}

wire_args!(A);
wire_args!(A, B);
wire_args!(A, B, C);
wire_args!(A, B, C, D);
wire_args!(A, B, C, D, E);
wire_args!(A, B, C, D, E, F);
wire_args!(A, B, C, D, E, F, G);
wire_args!(A, B, C, D, E, F, G, H);
wire_args!(A, B, C, D, E, F, G, H, I);
wire_args!(A, B, C, D, E, F, G, H, I, J);
wire_args!(A, B, C, D, E, F, G, H, I, J, K);
wire_args!(A, B, C, D, E, F, G, H, I, J, K, L);
wire_args!(A, B, C, D, E, F, G, H, I, J, K, L, M);
wire_args!(A, B, C, D, E, F, G, H, I, J, K, L, M, N);
wire_args!(A, B, C, D, E, F, G, H, I, J, K, L, M, N, O);
wire_args!(A, B, C, D, E, F, G, H, I, J, K, L, M, N, O, P);

/// Writes a complete `[command][args..]` frame.
pub fn write_args<A: WireArgs>(command: u32, args: &A, buffer: &mut Buffer) -> NetworkResult<()> {
    let start = buffer.position();
    buffer.write(command);
    args.write_args(buffer);

    if buffer.position() - start > MAX_FRAME_SIZE {
        return fatal(ErrorType::PayloadTooLarge);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
    struct Position {
        entity: u64,
        x: f32,
        y: f32,
        tag: String,
        path: Vec<u16>,
    }

    crate::message!(Position);

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Pinned(u32);

    crate::message!(Pinned, "tachyon::tests::Pinned");

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Blob(Vec<u8>);

    crate::message!(Blob);

    #[test]
    fn test_command_id_known_values() {
        // Reference FNV-1a values.
        assert_eq!(command_id(""), 0x811C_9DC5);
        assert_eq!(command_id("a"), 0xE40C_292C);
        assert_eq!(command_id("foobar"), 0xBF9C_F968);
    }

    #[test]
    fn test_command_id_deterministic() {
        assert_eq!(Position::ID, command_id(Position::NAME));
        assert_eq!(Position::ID, command_id("tachyon::net::codec::tests::Position"));
        assert_eq!(Pinned::ID, command_id("tachyon::tests::Pinned"));
        assert_ne!(Position::ID, Pinned::ID);
    }

    #[test]
    fn test_message_roundtrip() {
        let position = Position {
            entity: 17,
            x: 1.5,
            y: -3.0,
            tag: "runner".into(),
            path: vec![1, 2, 3],
        };

        let mut buffer = Buffer::new();
        write_message(&position, &mut buffer).unwrap();

        let frame = Frame::deserialize(buffer.as_slice()).unwrap();
        assert_eq!(frame.command, Position::ID);
        assert_eq!(frame.decode::<Position>().unwrap(), position);
    }

    #[test]
    fn test_decode_in_place() {
        let mut buffer = Buffer::new();
        Pinned(5).encode(&mut buffer).unwrap();

        let mut target = Pinned(0);
        target.decode_in_place(&mut buffer.reader()).unwrap();
        assert_eq!(target, Pinned(5));
    }

    #[test]
    fn test_truncated_payload_fails() {
        let position = Position {
            tag: "truncate me".into(),
            ..Default::default()
        };

        let frame = Frame::of(&position).unwrap();
        let truncated = &frame.payload[..frame.payload.len() - 3];

        assert!(Position::decode(&mut Reader::new(truncated)).is_err());
    }

    #[test]
    fn test_decode_wrong_command() {
        let frame = Frame::of(&Pinned(1)).unwrap();
        assert_eq!(
            frame.decode::<Position>(),
            Err(NetworkError::Fatal(ErrorType::CommandMismatch))
        );
    }

    #[test]
    fn test_frame_size_limit() {
        // Eight bytes of length prefix plus the command id leave this much room.
        let fits = Blob(vec![7; MAX_FRAME_SIZE - COMMAND_SIZE - 8]);
        let too_big = Blob(vec![7; MAX_FRAME_SIZE - COMMAND_SIZE - 7]);

        let mut buffer = Buffer::new();
        assert!(write_message(&fits, &mut buffer).is_ok());
        assert_eq!(buffer.position(), MAX_FRAME_SIZE);

        buffer.flush();
        assert_eq!(
            write_message(&too_big, &mut buffer),
            Err(NetworkError::Fatal(ErrorType::PayloadTooLarge))
        );
        assert_eq!(
            Frame::of(&too_big),
            Err(NetworkError::Fatal(ErrorType::PayloadTooLarge))
        );
    }

    #[test]
    fn test_deserialize_short_frame() {
        assert_eq!(
            Frame::deserialize(&[1, 2, 3]),
            Err(NetworkError::Fatal(ErrorType::EmptyPayload))
        );
    }

    #[test]
    fn test_wire_args() {
        let mut buffer = Buffer::new();
        write_args(99, &(1u8, 2u16, -3i32, 4.5f32), &mut buffer).unwrap();

        assert_eq!(buffer.position(), 4 + 1 + 2 + 4 + 4);

        let mut reader = buffer.reader();
        assert_eq!(reader.read::<u32>(), Ok(99));
        assert_eq!(
            <(u8, u16, i32, f32)>::read_args(&mut reader),
            Ok((1, 2, -3, 4.5))
        );
    }

    #[test]
    fn test_wire_args_sixteen() {
        let args = (
            1u8, 2u8, 3u8, 4u8, 5u8, 6u8, 7u8, 8u8, 9u8, 10u8, 11u8, 12u8, 13u8, 14u8, 15u8, 16u64,
        );

        let mut buffer = Buffer::new();
        args.write_args(&mut buffer);
        assert_eq!(buffer.position(), 15 + 8);

        let decoded = <(u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u8, u64)>::read_args(
            &mut buffer.reader(),
        );
        assert_eq!(decoded, Ok(args));
    }

    #[test]
    fn test_wire_args_short_read() {
        let mut buffer = Buffer::new();
        buffer.write(1u16);

        assert_eq!(
            <(u16, u16)>::read_args(&mut buffer.reader()),
            Err(NetworkError::Fatal(ErrorType::EndOfSequence))
        );
    }
}
