use crate::net::pool::{Lease, Recycle};
use crate::net::shared::{fatal, ErrorType, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::str;

const DEFAULT_CAPACITY: usize = 256;

/// Fixed layout values copied straight to and from the wire. Multi-byte values use little
/// endian layout.
pub trait Primitive: Copy {
    const SIZE: usize;

    fn store(self, dst: &mut [u8]);
    fn load(src: &[u8]) -> Self;
}

macro_rules! primitive {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl Primitive for $ty {
            const SIZE: usize = $size;

            #[inline]
            fn store(self, dst: &mut [u8]) {
                LittleEndian::$write(dst, self)
            }

            #[inline]
            fn load(src: &[u8]) -> Self {
                LittleEndian::$read(src)
            }
        }
    };
}

primitive!(u16, 2, write_u16, read_u16);
primitive!(i16, 2, write_i16, read_i16);
primitive!(u32, 4, write_u32, read_u32);
primitive!(i32, 4, write_i32, read_i32);
primitive!(u64, 8, write_u64, read_u64);
primitive!(i64, 8, write_i64, read_i64);
primitive!(f32, 4, write_f32, read_f32);
primitive!(f64, 8, write_f64, read_f64);

impl Primitive for u8 {
    const SIZE: usize = 1;

    #[inline]
    fn store(self, dst: &mut [u8]) {
        dst[0] = self;
    }

    #[inline]
    fn load(src: &[u8]) -> Self {
        src[0]
    }
}

impl Primitive for i8 {
    const SIZE: usize = 1;

    #[inline]
    fn store(self, dst: &mut [u8]) {
        dst[0] = self as u8;
    }

    #[inline]
    fn load(src: &[u8]) -> Self {
        src[0] as i8
    }
}

impl Primitive for bool {
    const SIZE: usize = 1;

    #[inline]
    fn store(self, dst: &mut [u8]) {
        dst[0] = self as u8;
    }

    #[inline]
    fn load(src: &[u8]) -> Self {
        src[0] != 0
    }
}

/// Growable byte buffer. Writes append at the position cursor, reads consume from a separate
/// read cursor that can never pass the position. Flushing resets both cursors but keeps the
/// backing storage around for reuse.
#[derive(Clone, Debug)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    cursor: usize,
    lease: Lease,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer::with_capacity(DEFAULT_CAPACITY)
    }

    #[inline]
    pub fn with_capacity(size: usize) -> Buffer {
        Buffer {
            data: vec![0; size],
            position: 0,
            cursor: 0,
            lease: Lease::NONE,
        }
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Free space left in the backing storage before it has to grow.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len() - self.position
    }

    /// Number of written bytes not yet consumed by `read`.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.position - self.cursor
    }

    #[inline]
    pub fn write<T: Primitive>(&mut self, value: T) {
        value.store(&mut self.get_span(T::SIZE)[..T::SIZE]);
        self.advance(T::SIZE);
    }

    #[inline]
    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.get_span(bytes.len())[..bytes.len()].copy_from_slice(bytes);
        self.advance(bytes.len());
    }

    /// Writes a byte slice prefixed with its `u16` length.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if bytes.len() > usize::from(u16::MAX) {
            return fatal(ErrorType::PayloadTooLarge);
        }

        self.write(bytes.len() as u16);
        self.write_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn write_str(&mut self, text: &str) -> NetworkResult<()> {
        self.write_bytes(text.as_bytes())
    }

    /// Mutable view of the free space past the position, grown to at least `size_hint` bytes.
    /// Pair with `advance` once the bytes are in place.
    #[inline]
    pub fn get_span(&mut self, size_hint: usize) -> &mut [u8] {
        self.reserve(size_hint);
        &mut self.data[self.position..]
    }

    #[inline]
    pub fn advance(&mut self, count: usize) {
        if self.position + count > self.data.len() {
            panic!("Attempted to advance past buffer edge.")
        }

        self.position += count;
    }

    /// Reads the next value at the read cursor.
    #[inline]
    pub fn read<T: Primitive>(&mut self) -> NetworkResult<T> {
        let value = Reader::new(&self.data[self.cursor..self.position]).read::<T>()?;
        self.cursor += T::SIZE;
        Ok(value)
    }

    /// Independent read view over the written bytes, starting at offset zero.
    #[inline]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(self.as_slice())
    }

    #[inline]
    pub fn flush(&mut self) {
        self.position = 0;
        self.cursor = 0;
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.position]
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    fn reserve(&mut self, additional: usize) {
        let required = self.position + additional;

        if required > self.data.len() {
            let size = required.max(self.data.len() * 2).max(DEFAULT_CAPACITY);
            self.data.resize(size, 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Recycle for Buffer {
    fn fresh() -> Self {
        Buffer::new()
    }

    fn recycle(&mut self) {
        self.flush();
    }

    fn lease(&self) -> Lease {
        self.lease
    }

    fn set_lease(&mut self, lease: Lease) {
        self.lease = lease;
    }
}

impl io::Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Borrowed read view over a byte slice. Handlers receive one of these positioned at the start
/// of their payload, so reading never copies.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, cursor: 0 }
    }

    #[inline]
    pub fn read<T: Primitive>(&mut self) -> NetworkResult<T> {
        Ok(T::load(self.take(T::SIZE)?))
    }

    /// Consumes exactly `count` bytes.
    #[inline]
    pub fn take(&mut self, count: usize) -> NetworkResult<&'a [u8]> {
        if self.remaining() < count {
            return fatal(ErrorType::EndOfSequence);
        }

        let start = self.cursor;
        self.cursor += count;
        Ok(&self.data[start..self.cursor])
    }

    /// Reads a `u16` length prefixed byte slice.
    #[inline]
    pub fn read_bytes(&mut self) -> NetworkResult<&'a [u8]> {
        let len = self.read::<u16>()?;
        self.take(usize::from(len))
    }

    #[inline]
    pub fn read_str(&mut self) -> NetworkResult<&'a str> {
        str::from_utf8(self.read_bytes()?).or_else(|_| fatal(ErrorType::Serialization))
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.cursor..]
    }
}

impl<'a> io::Read for Reader<'a> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.remaining());
        buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
        self.cursor += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::shared::NetworkError;
    use std::io::Write;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buffer = Buffer::new();

        buffer.write(7u8);
        buffer.write(-3i8);
        buffer.write(true);
        buffer.write(0xBEEFu16);
        buffer.write(-1234i32);
        buffer.write(u64::MAX - 1);
        buffer.write(1.5f32);
        buffer.write(-2.25f64);

        assert_eq!(buffer.position(), 1 + 1 + 1 + 2 + 4 + 8 + 4 + 8);

        assert_eq!(buffer.read::<u8>(), Ok(7));
        assert_eq!(buffer.read::<i8>(), Ok(-3));
        assert_eq!(buffer.read::<bool>(), Ok(true));
        assert_eq!(buffer.read::<u16>(), Ok(0xBEEF));
        assert_eq!(buffer.read::<i32>(), Ok(-1234));
        assert_eq!(buffer.read::<u64>(), Ok(u64::MAX - 1));
        assert_eq!(buffer.read::<f32>(), Ok(1.5));
        assert_eq!(buffer.read::<f64>(), Ok(-2.25));
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buffer = Buffer::new();
        buffer.write(0x0102_0304u32);

        assert_eq!(buffer.as_slice(), &[4, 3, 2, 1]);
    }

    #[test]
    fn test_read_past_position_fails() {
        let mut buffer = Buffer::new();
        buffer.write(1u16);

        assert_eq!(
            buffer.read::<u32>(),
            Err(NetworkError::Fatal(ErrorType::EndOfSequence))
        );
        // A failed read leaves the cursor alone.
        assert_eq!(buffer.read::<u16>(), Ok(1));
    }

    #[test]
    fn test_read_from_flushed_buffer_fails() {
        let mut buffer = Buffer::new();
        buffer.write(99u32);
        buffer.flush();

        assert_eq!(buffer.position(), 0);
        assert!(buffer.as_slice().is_empty());
        assert_eq!(
            buffer.read::<u8>(),
            Err(NetworkError::Fatal(ErrorType::EndOfSequence))
        );
    }

    #[test]
    fn test_growth_preserves_data() {
        let mut buffer = Buffer::with_capacity(4);
        let data: Vec<u8> = (0..1000).map(|item| item as u8).collect();

        buffer.write_slice(&data[..3]);
        assert_eq!(buffer.capacity(), 1);

        buffer.write_slice(&data[3..]);

        assert_eq!(buffer.as_slice(), &data[..]);
        assert!(buffer.capacity() < buffer.data.len());
    }

    #[test]
    fn test_get_span_and_advance() {
        let mut buffer = Buffer::new();

        let span = buffer.get_span(3);
        span[..3].copy_from_slice(&[1, 2, 3]);
        buffer.advance(3);

        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Attempted to advance past buffer edge.")]
    fn test_advance_past_edge_panics() {
        let mut buffer = Buffer::with_capacity(8);
        buffer.advance(9);
    }

    #[test]
    fn test_bytes_and_str() {
        let mut buffer = Buffer::new();
        buffer.write_str("tachyon").unwrap();
        buffer.write_bytes(&[9, 8, 7]).unwrap();

        let mut reader = buffer.reader();
        assert_eq!(reader.read_str(), Ok("tachyon"));
        assert_eq!(reader.read_bytes(), Ok(&[9u8, 8, 7][..]));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_bytes_fail() {
        let mut buffer = Buffer::new();
        buffer.write(10u16);
        buffer.write_slice(&[1, 2, 3]);

        assert_eq!(
            buffer.reader().read_bytes(),
            Err(NetworkError::Fatal(ErrorType::EndOfSequence))
        );
    }

    #[test]
    fn test_io_write_and_read() {
        let mut buffer = Buffer::new();
        buffer.write_all(b"hello").unwrap();

        let mut reader = buffer.reader();
        let mut out = [0u8; 8];
        let count = io::Read::read(&mut reader, &mut out).unwrap();

        assert_eq!(&out[..count], b"hello");
        assert_eq!(io::Read::read(&mut reader, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_random_primitives() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let values: Vec<(u32, f64, i16)> = (0..200).map(|_| (rng.gen(), rng.gen(), rng.gen())).collect();

        let mut buffer = Buffer::new();
        for &(a, b, c) in &values {
            buffer.write(a);
            buffer.write(b);
            buffer.write(c);
        }

        let mut reader = buffer.reader();
        for &(a, b, c) in &values {
            assert_eq!(reader.read::<u32>(), Ok(a));
            assert_eq!(reader.read::<f64>(), Ok(b));
            assert_eq!(reader.read::<i16>(), Ok(c));
        }
    }
}
