use crate::net::pool::{Lease, Recycle};
use std::ops::{Deref, DerefMut};

/// Large enough for any datagram the reliable UDP protocol produces, with headroom so oversized
/// datagrams are seen (and rejected) rather than silently truncated to a valid size.
pub const CHUNK_SIZE: usize = 1536;

/// Fixed size byte block used for raw datagrams. Writing advances the end cursor; the chunk
/// derefs to its filled bytes, and mutably derefs to its free capacity so socket reads can land
/// in place before `expand` commits them.
pub struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    end: usize,
    lease: Lease,
}

impl Chunk {
    #[inline]
    pub fn new() -> Chunk {
        Chunk {
            data: Box::new([0; CHUNK_SIZE]),
            end: 0,
            lease: Lease::NONE,
        }
    }

    /// Free capacity in the chunk.
    #[inline]
    pub fn capacity(&self) -> usize {
        CHUNK_SIZE - self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Copies the slice in and advances the end cursor.
    #[inline]
    pub fn write(&mut self, slice: &[u8]) {
        self.data[self.end..(self.end + slice.len())].copy_from_slice(slice);
        self.end += slice.len();
    }

    /// Commits `count` bytes written directly into the free capacity.
    #[inline]
    pub fn expand(&mut self, count: usize) {
        if self.end + count > CHUNK_SIZE {
            panic!("Attempted to expand past chunk edge.")
        }

        self.end += count;
    }

    /// Mutable view of the filled bytes.
    #[inline]
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.end]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.end = 0;
    }
}

/// The chunk immutably derefs to the filled data slice
impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.end]
    }
}

/// The chunk mutably derefs to the available capacity slice
impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..CHUNK_SIZE]
    }
}

impl Clone for Chunk {
    fn clone(&self) -> Self {
        Chunk {
            data: self.data.clone(),
            end: self.end,
            lease: self.lease,
        }
    }
}

impl Recycle for Chunk {
    fn fresh() -> Self {
        Chunk::new()
    }

    fn recycle(&mut self) {
        self.clear();
    }

    fn lease(&self) -> Lease {
        self.lease
    }

    fn set_lease(&mut self, lease: Lease) {
        self.lease = lease;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk() {
        let chunk = Chunk::new();

        assert_eq!(chunk.data.len(), CHUNK_SIZE);
        assert_eq!(chunk.len(), 0);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_write() {
        let mut chunk = Chunk::new();

        let items: Vec<u8> = (1..5).collect();
        chunk.write(&items);

        assert_eq!(&chunk[..], items.as_slice());
        assert_eq!(chunk.capacity(), CHUNK_SIZE - 4);
    }

    #[test]
    fn test_expand_after_direct_write() {
        let mut chunk = Chunk::new();
        chunk.write(&[1]);

        {
            let free: &mut [u8] = &mut chunk;
            assert_eq!(free.len(), CHUNK_SIZE - 1);
            free[..2].copy_from_slice(&[2, 3]);
        }
        chunk.expand(2);

        assert_eq!(&chunk[..], &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Attempted to expand past chunk edge.")]
    fn test_expand_past_edge_fails() {
        let mut chunk = Chunk::new();
        chunk.expand(CHUNK_SIZE + 1);
    }

    #[test]
    fn test_recycle_clears() {
        let mut chunk = Chunk::new();
        chunk.write(&[1, 2, 3]);
        chunk.recycle();

        assert!(chunk.is_empty());
        assert_eq!(chunk.capacity(), CHUNK_SIZE);
    }
}
