//! Neighbor table: bounded directory of recently heard badges.
//!
//! Entries are keyed by address. Inserting past capacity evicts the entry heard
//! longest ago; a periodic sweep drops entries whose beacons stopped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::address::{MacAddress, PeerAddress};

/// Default number of neighbors kept.
pub const DEFAULT_NEIGHBOR_CAPACITY: usize = 20;

/// An entry is stale after this many missed beacon intervals.
pub const DEFAULT_STALE_MULTIPLIER: f64 = 2.6;

#[derive(Debug, Clone)]
pub struct NeighborTable {
    capacity: usize,
    stale_multiplier: f64,
    entries: HashMap<MacAddress, PeerAddress>,
    latest: Option<MacAddress>,
}

impl NeighborTable {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, stale_multiplier: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            stale_multiplier,
            entries: HashMap::new(),
            latest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.entries.contains_key(address)
    }

    pub fn get(&self, address: &MacAddress) -> Option<&PeerAddress> {
        self.entries.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.entries.values()
    }

    /// Record a beacon: refresh an existing entry or insert a new one, evicting the
    /// oldest entry first when full. The entry becomes [`latest`](Self::latest).
    pub fn upsert(
        &mut self,
        address: MacAddress,
        display_name: String,
        signal_strength: i8,
        now: Instant,
    ) {
        if !self.entries.contains_key(&address) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            address,
            PeerAddress::new(address, display_name, signal_strength, now),
        );
        self.latest = Some(address);
    }

    /// Refresh `last_seen_at` of a known neighbor. Returns false if unknown.
    pub fn touch(&mut self, address: &MacAddress, now: Instant) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.last_seen_at = now;
                self.latest = Some(*address);
                true
            }
            None => false,
        }
    }

    /// Drop every entry not heard for more than `stale_multiplier * beacon_interval`.
    /// Returns the number removed.
    pub fn remove_stale(&mut self, beacon_interval: Duration, now: Instant) -> usize {
        let stale_after = beacon_interval.mul_f64(self.stale_multiplier);
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen_at) <= stale_after);
        before - self.entries.len()
    }

    /// Most recently updated entry. Falls back to any remaining entry when the
    /// latest one has been removed.
    pub fn latest(&mut self) -> Option<&PeerAddress> {
        let current = self.latest.filter(|a| self.entries.contains_key(a));
        self.latest = current.or_else(|| self.entries.keys().next().copied());
        self.latest.and_then(|a| self.entries.get(&a))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|e| e.last_seen_at)
            .map(|e| e.address);
        if let Some(address) = oldest {
            self.entries.remove(&address);
        }
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBOR_CAPACITY, DEFAULT_STALE_MULTIPLIER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, n])
    }

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn eviction_keeps_newest() {
        let t0 = Instant::now();
        let mut table = NeighborTable::new(2, DEFAULT_STALE_MULTIPLIER);
        table.upsert(mac(1), "A".into(), -40, at(t0, 1));
        table.upsert(mac(2), "B".into(), -40, at(t0, 2));
        table.upsert(mac(3), "C".into(), -40, at(t0, 3));
        assert_eq!(table.len(), 2);
        assert!(!table.contains(&mac(1)));
        assert!(table.contains(&mac(2)));
        assert!(table.contains(&mac(3)));
    }

    #[test]
    fn eviction_uses_last_seen_not_insertion_order() {
        let t0 = Instant::now();
        let mut table = NeighborTable::new(2, DEFAULT_STALE_MULTIPLIER);
        table.upsert(mac(1), "A".into(), -40, at(t0, 1));
        table.upsert(mac(2), "B".into(), -40, at(t0, 2));
        // A beacons again, B is now the oldest
        table.upsert(mac(1), "A".into(), -45, at(t0, 3));
        table.upsert(mac(3), "C".into(), -40, at(t0, 4));
        assert!(table.contains(&mac(1)));
        assert!(!table.contains(&mac(2)));
        assert!(table.contains(&mac(3)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let t0 = Instant::now();
        let mut table = NeighborTable::new(5, DEFAULT_STALE_MULTIPLIER);
        for n in 0..50u8 {
            table.upsert(mac(n), format!("badge{n}"), -50, at(t0, n as u64));
            assert!(table.len() <= 5);
        }
        let mut kept: Vec<u8> = table.iter().map(|e| e.address.as_bytes()[5]).collect();
        kept.sort_unstable();
        assert_eq!(kept, vec![45, 46, 47, 48, 49]);
    }

    #[test]
    fn refresh_does_not_evict() {
        let t0 = Instant::now();
        let mut table = NeighborTable::new(2, DEFAULT_STALE_MULTIPLIER);
        table.upsert(mac(1), "A".into(), -40, at(t0, 1));
        table.upsert(mac(2), "B".into(), -40, at(t0, 2));
        table.upsert(mac(2), "B2".into(), -60, at(t0, 3));
        assert_eq!(table.len(), 2);
        let b = table.get(&mac(2)).unwrap();
        assert_eq!(b.display_name, "B2");
        assert_eq!(b.signal_strength, -60);
        assert_eq!(b.last_seen_at, at(t0, 3));
    }

    #[test]
    fn remove_stale_all_and_only_old() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(5);
        let mut table = NeighborTable::default();
        table.upsert(mac(1), "old".into(), -40, at(t0, 0));
        table.upsert(mac(2), "edge".into(), -40, at(t0, 1));
        table.upsert(mac(3), "fresh".into(), -40, at(t0, 10));
        // at t=14: ages 14, 13 and 4 against a 13 s limit
        let removed = table.remove_stale(interval, at(t0, 14));
        assert_eq!(removed, 1);
        assert!(!table.contains(&mac(1)));
        assert!(table.contains(&mac(2)));
        assert!(table.contains(&mac(3)));

        let removed = table.remove_stale(interval, at(t0, 100));
        assert_eq!(removed, 2);
        assert!(table.is_empty());
    }

    #[test]
    fn latest_tracks_updates_and_sweeps() {
        let t0 = Instant::now();
        let mut table = NeighborTable::default();
        assert!(table.latest().is_none());
        table.upsert(mac(1), "A".into(), -40, at(t0, 0));
        table.upsert(mac(2), "B".into(), -40, at(t0, 10));
        assert_eq!(table.latest().unwrap().address, mac(2));
        assert!(table.touch(&mac(1), at(t0, 11)));
        assert_eq!(table.latest().unwrap().address, mac(1));

        // B is swept as stale; latest is untouched
        let removed = table.remove_stale(Duration::from_secs(1), at(t0, 13));
        assert_eq!(removed, 1);
        assert_eq!(table.latest().unwrap().address, mac(1));

        // stale entries go, the fresh latest stays
        table.upsert(mac(3), "C".into(), -40, at(t0, 14));
        table.remove_stale(Duration::from_secs(1), at(t0, 14));
        assert_eq!(table.latest().unwrap().address, mac(3));
        assert_eq!(table.len(), 1);

        table.remove_stale(Duration::from_secs(1), at(t0, 20));
        assert!(table.latest().is_none());
    }

    #[test]
    fn touch_unknown_is_noop() {
        let mut table = NeighborTable::default();
        assert!(!table.touch(&mac(9), Instant::now()));
        assert!(table.is_empty());
    }
}
