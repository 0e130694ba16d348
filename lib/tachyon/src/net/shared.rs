use std::fmt;
use std::io;
use std::net;

/// Identifier of a connected peer. Server peers hand out ids starting at 1, the client side
/// addresses the remote host as `HOST_PEER`.
pub type PeerId = u32;

pub const HOST_PEER: PeerId = 0;

/// Largest frame accepted in either direction, command id included. Frames are never
/// fragmented.
pub const MAX_FRAME_SIZE: usize = 1024;
/// Size of the command id at the head of every frame.
pub const COMMAND_SIZE: usize = 4;

/// Cookie presented by clients connecting to a server.
pub const SESSION_COOKIE: u32 = 0x7AC4_0C11;
/// Cookie presented by punch peers connecting to a rendezvous host.
pub const RENDEZVOUS_COOKIE: u32 = 0x7AC4_5E1D;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorType {
    EndOfSequence,
    PayloadTooLarge,
    EmptyPayload,
    IncorrectCategory,
    CookieMismatch,
    Blacklisted,
    MalformedHandshake,
    NotConnected,
    HandlerLocked,
    CommandCollision(u32),
    CommandMismatch,
    Serialization,
    Closed,
    Timeout,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl From<bincode::Error> for NetworkError {
    #[inline]
    fn from(error: bincode::Error) -> Self {
        match *error {
            bincode::ErrorKind::Io(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                NetworkError::Fatal(ErrorType::EndOfSequence)
            }
            _ => NetworkError::Fatal(ErrorType::Serialization),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation would block"),
            NetworkError::Fatal(ErrorType::CommandCollision(command)) => {
                write!(f, "command id {:#010x} already bound to another type", command)
            }
            NetworkError::Fatal(ErrorType::Io(kind)) => write!(f, "io error: {:?}", kind),
            NetworkError::Fatal(kind) => write!(f, "{:?}", kind),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[inline]
pub(crate) fn fatal<T>(kind: ErrorType) -> NetworkResult<T> {
    Err(NetworkError::Fatal(kind))
}
