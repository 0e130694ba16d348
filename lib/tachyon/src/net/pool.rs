use crate::net::buffer::Buffer;
use crate::net::chunk::Chunk;
use crate::net::packet::Packet;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static POOL_SEQUENCE: AtomicU32 = AtomicU32::new(1);

const DEFAULT_RETAINED: usize = 1024;

/// Proof of provenance stamped onto every rented item. Items carrying `Lease::NONE` were never
/// rented (or were already returned).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Lease {
    pool: u32,
    serial: u64,
}

impl Lease {
    pub const NONE: Lease = Lease { pool: 0, serial: 0 };

    #[inline]
    pub fn is_none(self) -> bool {
        self == Lease::NONE
    }
}

/// Items that can live in a `Pool`.
pub trait Recycle: Send {
    /// Creates a brand new item when the pool runs dry.
    fn fresh() -> Self;
    /// Resets the item to its empty state.
    fn recycle(&mut self);
    fn lease(&self) -> Lease;
    fn set_lease(&mut self, lease: Lease);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PoolError {
    /// The item was not rented from this pool.
    Foreign,
    /// The lease was already returned.
    AlreadyReturned,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::Foreign => write!(f, "item was not rented from this pool"),
            PoolError::AlreadyReturned => write!(f, "item was already returned to the pool"),
        }
    }
}

struct PoolState<T> {
    free: Vec<T>,
    outstanding: HashSet<u64>,
    serial: u64,
    created: usize,
}

/// Thread safe free list. Renting hands out a recycled item (or a fresh one) stamped with a new
/// lease; giving it back checks the lease so foreign items and double returns are refused.
pub struct Pool<T> {
    id: u32,
    retain: usize,
    state: Mutex<PoolState<T>>,
}

impl<T: Recycle> Pool<T> {
    pub fn new() -> Pool<T> {
        Pool::with_retention(DEFAULT_RETAINED)
    }

    /// Pool keeping at most `retain` idle items around. Returns past that limit are dropped.
    pub fn with_retention(retain: usize) -> Pool<T> {
        Pool {
            id: POOL_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            retain,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: HashSet::new(),
                serial: 0,
                created: 0,
            }),
        }
    }

    /// Hands out an item, creating one if none is idle.
    pub fn rent(&self) -> T {
        let mut state = self.state.lock();

        let mut item = match state.free.pop() {
            Some(item) => item,
            None => {
                state.created += 1;
                T::fresh()
            }
        };

        state.serial += 1;
        let serial = state.serial;
        state.outstanding.insert(serial);

        item.set_lease(Lease { pool: self.id, serial });
        item
    }

    /// Takes back a rented item, flushing it for the next tenant.
    pub fn give_back(&self, mut item: T) -> Result<(), PoolError> {
        let lease = item.lease();

        if lease.pool != self.id || lease.serial == 0 {
            return Err(PoolError::Foreign);
        }

        let mut state = self.state.lock();

        if !state.outstanding.remove(&lease.serial) {
            return Err(if lease.serial <= state.serial {
                PoolError::AlreadyReturned
            } else {
                PoolError::Foreign
            });
        }

        item.recycle();
        item.set_lease(Lease::NONE);

        if state.free.len() < self.retain {
            state.free.push(item);
        }

        Ok(())
    }

    /// Number of idle items ready to be rented.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of items rented and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Total number of items this pool ever had to create.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}

/// The pools shared between a transport's I/O thread and its consumer.
pub struct Pools {
    /// Outgoing frame writers.
    pub buffers: Pool<Buffer>,
    /// Received frames awaiting dispatch.
    pub packets: Pool<Packet>,
    /// Raw datagram storage.
    pub chunks: Pool<Chunk>,
}

impl Pools {
    pub fn new() -> Arc<Pools> {
        Arc::new(Pools {
            buffers: Pool::new(),
            packets: Pool::new(),
            chunks: Pool::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rent_and_return() {
        let pool: Pool<Buffer> = Pool::new();

        let items: Vec<Buffer> = (0..10).map(|_| pool.rent()).collect();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 10);
        assert_eq!(pool.created(), 10);

        for item in items {
            pool.give_back(item).unwrap();
        }

        assert_eq!(pool.available(), 10);
        assert_eq!(pool.outstanding(), 0);

        // Renting again reuses the idle items.
        let item = pool.rent();
        assert_eq!(pool.created(), 10);
        assert_eq!(pool.available(), 9);
        pool.give_back(item).unwrap();
    }

    #[test]
    fn test_returned_item_is_flushed() {
        let pool: Pool<Buffer> = Pool::new();

        let mut buffer = pool.rent();
        buffer.write(42u32);
        pool.give_back(buffer).unwrap();

        let buffer = pool.rent();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_double_return_rejected() {
        let pool: Pool<Buffer> = Pool::new();

        let buffer = pool.rent();
        let copy = buffer.clone();

        assert_eq!(pool.give_back(buffer), Ok(()));
        assert_eq!(pool.give_back(copy), Err(PoolError::AlreadyReturned));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_foreign_item_rejected() {
        let pool: Pool<Buffer> = Pool::new();
        let other: Pool<Buffer> = Pool::new();

        assert_eq!(pool.give_back(Buffer::new()), Err(PoolError::Foreign));
        assert_eq!(pool.give_back(other.rent()), Err(PoolError::Foreign));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_retention_limit() {
        let pool: Pool<Buffer> = Pool::with_retention(2);

        let items: Vec<Buffer> = (0..4).map(|_| pool.rent()).collect();
        for item in items {
            pool.give_back(item).unwrap();
        }

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_rent_and_return() {
        let pool: Arc<Pool<Buffer>> = Arc::new(Pool::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let mut buffer = pool.rent();
                        buffer.write(1u8);
                        pool.give_back(buffer).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.outstanding(), 0);
        assert!(pool.available() <= 4);
        assert_eq!(pool.available(), pool.created());
    }
}
