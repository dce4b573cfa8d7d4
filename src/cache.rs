//! One-slot cache of the bundle currently being announced.

use tracing::trace;

use crate::bundle::{Bid, Version};
use crate::store::{Store, StoreError};


/// The cached content of one bundle.
#[derive(Debug, Clone)]
pub struct CachedBundle {
    bid: Bid,
    version: Version,
    manifest: Vec<u8>,
    body: Vec<u8>,
}

impl CachedBundle {

    #[inline]
    pub fn bid(&self) -> &Bid {
        &self.bid
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn manifest(&self) -> &[u8] {
        &self.manifest
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

}


/// A single-slot cache in front of the store. Announcing a bundle touches
/// its content on every emitted piece, so the slot keeps the bundle being
/// worked on in memory; any other bundle replaces the slot. The slot is
/// keyed by `(bid, version)`, so a version change in the registry record
/// invalidates it naturally.
#[derive(Debug, Default)]
pub struct ContentCache {
    slot: Option<CachedBundle>,
}

impl ContentCache {

    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the slot holds the given bundle at the given version, and
    /// return its content. A hit returns without touching the store.
    pub fn prime<'a, S: Store>(
        &'a mut self,
        store: &mut S,
        bid: &Bid,
        version: Version,
    ) -> Result<&'a CachedBundle, StoreError> {

        let hit = matches!(&self.slot, Some(c) if c.bid == *bid && c.version == version);
        if !hit {
            trace!("cache miss for {bid:?} version {version}, fetching");
            let (manifest, body) = store.fetch(bid, version)?;
            self.slot = Some(CachedBundle {
                bid: *bid,
                version,
                manifest,
                body,
            });
        }

        Ok(self.slot.as_ref().unwrap())

    }

    /// Peek at the slot without fetching.
    pub fn get(&self, bid: &Bid, version: Version) -> Option<&CachedBundle> {
        self.slot.as_ref().filter(|c| c.bid == *bid && c.version == version)
    }

    /// Drop the slot.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::bundle::BID_LEN;

    /// A store that counts fetches.
    struct CountingStore {
        fetches: usize,
    }

    impl Store for CountingStore {
        fn fetch(&mut self, _bid: &Bid, version: Version) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
            self.fetches += 1;
            Ok((vec![b'm'], vec![b'b'; version.get() as usize]))
        }
    }

    #[test]
    fn hit_and_replacement() {

        let mut store = CountingStore { fetches: 0 };
        let mut cache = ContentCache::new();

        let a = Bid::new([1; BID_LEN]);
        let b = Bid::new([2; BID_LEN]);

        let cached = cache.prime(&mut store, &a, Version::new(4)).unwrap();
        assert_eq!(cached.body().len(), 4);
        assert_eq!(store.fetches, 1);

        // Same bundle and version: no fetch.
        cache.prime(&mut store, &a, Version::new(4)).unwrap();
        assert_eq!(store.fetches, 1);

        // Another bundle replaces the slot.
        cache.prime(&mut store, &b, Version::new(2)).unwrap();
        assert_eq!(store.fetches, 2);
        assert!(cache.get(&a, Version::new(4)).is_none());

        // A version bump on the same bundle misses too.
        cache.prime(&mut store, &b, Version::new(3)).unwrap();
        assert_eq!(store.fetches, 3);

    }

    #[test]
    fn failed_fetch_keeps_previous_slot() {

        struct FailingStore;
        impl Store for FailingStore {
            fn fetch(&mut self, _: &Bid, _: Version) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
                Err(StoreError::DeadlineExceeded)
            }
        }

        let mut counting = CountingStore { fetches: 0 };
        let mut cache = ContentCache::new();
        let a = Bid::new([1; BID_LEN]);
        cache.prime(&mut counting, &a, Version::new(4)).unwrap();

        let mut failing = FailingStore;
        let b = Bid::new([2; BID_LEN]);
        assert!(cache.prime(&mut failing, &b, Version::new(1)).is_err());

        // The old slot is still intact for the next tick.
        assert!(cache.get(&a, Version::new(4)).is_some());

    }

}
