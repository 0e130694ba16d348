use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult, MAX_FRAME_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// `[category: u8][connection: u32]`
pub const HEADER_SIZE: usize = 5;
/// Largest control datagram.
pub const CONTROL_SIZE: usize = HEADER_SIZE + 8;
/// Largest valid payload datagram.
pub const MAX_DATAGRAM_SIZE: usize = HEADER_SIZE + 4 + MAX_FRAME_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Category {
    Connect = 1,
    Accept = 2,
    Payload = 3,
    Ack = 4,
    Ping = 5,
    Pong = 6,
    Disconnect = 7,
    DisconnectAck = 8,
    Punch = 9,
}

impl From<Category> for u8 {
    #[inline]
    fn from(cat: Category) -> Self {
        cat as u8
    }
}

/// A parsed datagram. Payload datagrams borrow their frame from the receive buffer.
#[derive(Debug, Eq, PartialEq)]
pub enum Datagram<'a> {
    Connect { cookie: u32, nonce: u32 },
    Accept { nonce: u32 },
    Payload { sequence: u32, frame: &'a [u8] },
    Ack { sequence: u32 },
    Ping { stamp: u32 },
    Pong { stamp: u32 },
    Disconnect,
    DisconnectAck,
    Punch,
}

impl<'a> Datagram<'a> {
    #[inline]
    pub fn category(&self) -> Category {
        match self {
            Datagram::Connect { .. } => Category::Connect,
            Datagram::Accept { .. } => Category::Accept,
            Datagram::Payload { .. } => Category::Payload,
            Datagram::Ack { .. } => Category::Ack,
            Datagram::Ping { .. } => Category::Ping,
            Datagram::Pong { .. } => Category::Pong,
            Datagram::Disconnect => Category::Disconnect,
            Datagram::DisconnectAck => Category::DisconnectAck,
            Datagram::Punch => Category::Punch,
        }
    }

    /// Parses a datagram, returning the connection id from its header alongside it.
    pub fn read(mut buffer: &'a [u8]) -> NetworkResult<(u32, Datagram<'a>)> {
        let category = buffer.read_u8().map_err(truncated)?;
        let connection = buffer.read_u32::<BigEndian>().map_err(truncated)?;

        let datagram = match category {
            1 => Datagram::Connect {
                cookie: buffer.read_u32::<BigEndian>().map_err(truncated)?,
                nonce: buffer.read_u32::<BigEndian>().map_err(truncated)?,
            },
            2 => Datagram::Accept {
                nonce: buffer.read_u32::<BigEndian>().map_err(truncated)?,
            },
            3 => {
                let sequence = buffer.read_u32::<BigEndian>().map_err(truncated)?;

                if buffer.is_empty() {
                    return fatal(ErrorType::EmptyPayload);
                }

                if buffer.len() > MAX_FRAME_SIZE {
                    return fatal(ErrorType::PayloadTooLarge);
                }

                Datagram::Payload { sequence, frame: buffer }
            }
            4 => Datagram::Ack {
                sequence: buffer.read_u32::<BigEndian>().map_err(truncated)?,
            },
            5 => Datagram::Ping {
                stamp: buffer.read_u32::<BigEndian>().map_err(truncated)?,
            },
            6 => Datagram::Pong {
                stamp: buffer.read_u32::<BigEndian>().map_err(truncated)?,
            },
            7 => Datagram::Disconnect,
            8 => Datagram::DisconnectAck,
            9 => Datagram::Punch,
            _ => return fatal(ErrorType::IncorrectCategory),
        };

        Ok((connection, datagram))
    }

    /// Writes the datagram into `out`, returning the number of bytes used.
    pub fn write(&self, connection: u32, out: &mut [u8]) -> NetworkResult<usize> {
        let capacity = out.len();
        let mut cursor = &mut out[..];

        cursor.write_u8(self.category().into())?;
        cursor.write_u32::<BigEndian>(connection)?;

        match *self {
            Datagram::Connect { cookie, nonce } => {
                cursor.write_u32::<BigEndian>(cookie)?;
                cursor.write_u32::<BigEndian>(nonce)?;
            }
            Datagram::Accept { nonce } => cursor.write_u32::<BigEndian>(nonce)?,
            Datagram::Payload { sequence, frame } => {
                cursor.write_u32::<BigEndian>(sequence)?;
                if cursor.len() < frame.len() {
                    return fatal(ErrorType::PayloadTooLarge);
                }
                io::Write::write_all(&mut cursor, frame)?;
            }
            Datagram::Ack { sequence } => cursor.write_u32::<BigEndian>(sequence)?,
            Datagram::Ping { stamp } | Datagram::Pong { stamp } => cursor.write_u32::<BigEndian>(stamp)?,
            Datagram::Disconnect | Datagram::DisconnectAck | Datagram::Punch => (),
        }

        Ok(capacity - cursor.len())
    }
}

#[inline]
fn truncated(_: io::Error) -> NetworkError {
    NetworkError::Fatal(ErrorType::EndOfSequence)
}
