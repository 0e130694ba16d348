use crate::net::shared::{fatal, ErrorType, NetworkResult, PeerId};
use hashbrown::HashSet;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Store of banned addresses. Transports consult it before any per-connection state exists.
pub trait Blacklist: Send + Sync {
    fn contains(&self, address: &IpAddr) -> bool;
    /// Bans the address, returning false if it was already banned.
    fn insert(&self, address: IpAddr) -> bool;
    fn remove(&self, address: &IpAddr) -> bool;
    fn len(&self) -> usize;
    fn clear(&self);
}

/// In-process blacklist.
#[derive(Debug, Default)]
pub struct MemoryBlacklist {
    addresses: RwLock<HashSet<IpAddr>>,
}

impl MemoryBlacklist {
    pub fn new() -> MemoryBlacklist {
        MemoryBlacklist::default()
    }
}

impl Blacklist for MemoryBlacklist {
    fn contains(&self, address: &IpAddr) -> bool {
        self.addresses.read().contains(address)
    }

    fn insert(&self, address: IpAddr) -> bool {
        self.addresses.write().insert(address)
    }

    fn remove(&self, address: &IpAddr) -> bool {
        self.addresses.write().remove(address)
    }

    fn len(&self) -> usize {
        self.addresses.read().len()
    }

    fn clear(&self) {
        self.addresses.write().clear()
    }
}

/// Checks a presented handshake cookie.
#[inline]
pub fn verify_cookie(expected: u32, presented: u32) -> NetworkResult<()> {
    if expected != presented {
        return fatal(ErrorType::CookieMismatch);
    }

    Ok(())
}

/// Tracks connection ids through `pending -> established -> removed`. Removed ids linger until
/// the remote acknowledges the teardown or the linger period runs out, then they are purged.
#[derive(Debug, Default)]
pub struct Lifecycle {
    pending: IndexSet<PeerId>,
    established: IndexSet<PeerId>,
    removed: IndexMap<PeerId, Instant>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle::default()
    }

    /// Registers a connection that has not completed its handshake yet.
    pub fn begin(&mut self, id: PeerId) -> bool {
        if self.established.contains(&id) || self.removed.contains_key(&id) {
            return false;
        }

        self.pending.insert(id)
    }

    /// Promotes a pending connection. Fails for ids that were never pending.
    pub fn establish(&mut self, id: PeerId) -> bool {
        if !self.pending.swap_remove(&id) {
            return false;
        }

        self.established.insert(id)
    }

    /// Moves a pending or established connection to the removed set.
    pub fn remove(&mut self, id: PeerId, now: Instant) -> bool {
        let known = self.pending.swap_remove(&id) | self.established.swap_remove(&id);

        if known {
            self.removed.insert(id, now);
        }

        known
    }

    /// Teardown confirmed, forget the id.
    pub fn acknowledge(&mut self, id: PeerId) -> bool {
        self.removed.swap_remove(&id).is_some()
    }

    /// Purges removed ids that lingered longer than `linger`, returning them.
    pub fn purge(&mut self, now: Instant, linger: Duration) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .removed
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= linger)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.removed.swap_remove(id);
        }

        expired
    }

    #[inline]
    pub fn is_pending(&self, id: PeerId) -> bool {
        self.pending.contains(&id)
    }

    #[inline]
    pub fn is_established(&self, id: PeerId) -> bool {
        self.established.contains(&id)
    }

    #[inline]
    pub fn is_removed(&self, id: PeerId) -> bool {
        self.removed.contains_key(&id)
    }

    pub fn established(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.established.iter().copied()
    }

    #[inline]
    pub fn established_count(&self) -> usize {
        self.established.len()
    }

    /// Connections occupying a slot: pending or established.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.pending.len() + self.established.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::shared::NetworkError;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[test]
    fn test_blacklist() {
        let blacklist: Arc<dyn Blacklist> = Arc::new(MemoryBlacklist::new());
        let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert!(!blacklist.contains(&address));
        assert!(blacklist.insert(address));
        assert!(!blacklist.insert(address));
        assert!(blacklist.contains(&address));
        assert_eq!(blacklist.len(), 1);

        assert!(blacklist.remove(&address));
        assert!(!blacklist.contains(&address));

        blacklist.insert(address);
        blacklist.clear();
        assert_eq!(blacklist.len(), 0);
    }

    #[test]
    fn test_verify_cookie() {
        assert!(verify_cookie(5, 5).is_ok());
        assert_eq!(
            verify_cookie(5, 6),
            Err(NetworkError::Fatal(ErrorType::CookieMismatch))
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();

        assert!(!lifecycle.establish(1));

        assert!(lifecycle.begin(1));
        assert!(lifecycle.is_pending(1));
        assert_eq!(lifecycle.active_count(), 1);

        assert!(lifecycle.establish(1));
        assert!(lifecycle.is_established(1));
        assert!(!lifecycle.is_pending(1));
        assert!(!lifecycle.begin(1));

        assert!(lifecycle.remove(1, now));
        assert!(lifecycle.is_removed(1));
        assert_eq!(lifecycle.active_count(), 0);
        assert!(!lifecycle.remove(1, now));

        assert!(lifecycle.acknowledge(1));
        assert!(!lifecycle.is_removed(1));
    }

    #[test]
    fn test_lifecycle_purge() {
        let mut lifecycle = Lifecycle::new();
        let now = Instant::now();

        for id in 1..=3 {
            lifecycle.begin(id);
            lifecycle.establish(id);
        }

        lifecycle.remove(1, now);
        lifecycle.remove(2, now + Duration::from_millis(500));

        let purged = lifecycle.purge(now + Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(purged, vec![1]);
        assert!(lifecycle.is_removed(2));
        assert_eq!(lifecycle.established().collect::<Vec<_>>(), vec![3]);
    }
}
