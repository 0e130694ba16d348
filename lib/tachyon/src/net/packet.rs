use crate::net::buffer::{Buffer, Primitive, Reader};
use crate::net::pool::{Lease, Recycle};
use crate::net::shared::{fatal, ErrorType, NetworkResult, COMMAND_SIZE, MAX_FRAME_SIZE};

/// A received frame waiting for dispatch. Packets are rented from the packet pool by the I/O
/// thread, handed to the consumer through the inbound queue and given back once dispatched.
#[derive(Clone, Debug)]
pub struct Packet {
    command: u32,
    payload: Buffer,
    lease: Lease,
}

impl Packet {
    #[inline]
    pub fn command(&self) -> u32 {
        self.command
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Read view over the payload (the command id is not part of it).
    #[inline]
    pub fn reader(&self) -> Reader<'_> {
        self.payload.reader()
    }

    /// Fills the packet from a raw `[command][payload]` frame.
    pub fn fill(&mut self, frame: &[u8]) -> NetworkResult<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return fatal(ErrorType::PayloadTooLarge);
        }

        if frame.len() < COMMAND_SIZE {
            return fatal(ErrorType::EmptyPayload);
        }

        self.command = u32::load(&frame[..COMMAND_SIZE]);
        self.payload.flush();
        self.payload.write_slice(&frame[COMMAND_SIZE..]);
        Ok(())
    }
}

impl Recycle for Packet {
    fn fresh() -> Self {
        Packet {
            command: 0,
            payload: Buffer::with_capacity(MAX_FRAME_SIZE),
            lease: Lease::NONE,
        }
    }

    fn recycle(&mut self) {
        self.command = 0;
        self.payload.flush();
    }

    fn lease(&self) -> Lease {
        self.lease
    }

    fn set_lease(&mut self, lease: Lease) {
        self.lease = lease;
    }
}
