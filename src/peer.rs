//! Table of recently heard peers and what they have announced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::bundle::{BidPrefix, SidPrefix, Version};
use crate::frame::Bar;


/// Maximum number of announcements remembered per peer; when full the
/// entry heard longest ago is replaced.
pub const PEER_MAX_ANNOUNCEMENTS: usize = 32;


/// One bundle a peer has announced. For journalled bundles the version is
/// also the peer's received-byte watermark (see
/// [`Version::journal_length`]).
#[derive(Debug, Clone)]
pub struct PeerAnnouncement {
    pub bid_prefix: BidPrefix,
    pub version: Version,
    last_heard: Instant,
}


/// A nearby peer: when it was last heard and what it has announced.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    sid_prefix: SidPrefix,
    last_seen: Instant,
    announcements: SmallVec<[PeerAnnouncement; 8]>,
}

impl PeerRecord {

    fn new(sid_prefix: SidPrefix, now: Instant) -> Self {
        Self {
            sid_prefix,
            last_seen: now,
            announcements: SmallVec::new(),
        }
    }

    #[inline]
    pub fn sid_prefix(&self) -> SidPrefix {
        self.sid_prefix
    }

    #[inline]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Iterate the bundles this peer has announced.
    pub fn announcements(&self) -> impl Iterator<Item = &PeerAnnouncement> + '_ {
        self.announcements.iter()
    }

    /// The version this peer last announced for the given bundle, if any.
    pub fn announced_version(&self, bid_prefix: BidPrefix) -> Option<Version> {
        self.announcements.iter()
            .find(|a| a.bid_prefix == bid_prefix)
            .map(|a| a.version)
    }

    /// Whether this peer has announced the given bundle at the given
    /// version or a newer one, meaning our sends of it are redundant.
    pub fn has_announced(&self, bid_prefix: BidPrefix, version: Version) -> bool {
        self.announced_version(bid_prefix).is_some_and(|v| v >= version)
    }

    fn note_bar(&mut self, bar: &Bar, now: Instant) {

        self.last_seen = now;

        if let Some(entry) = self.announcements.iter_mut().find(|a| a.bid_prefix == bar.bid_prefix) {
            entry.version = bar.version;
            entry.last_heard = now;
            return;
        }

        let entry = PeerAnnouncement {
            bid_prefix: bar.bid_prefix,
            version: bar.version,
            last_heard: now,
        };

        if self.announcements.len() < PEER_MAX_ANNOUNCEMENTS {
            self.announcements.push(entry);
        } else {
            // Replace the entry heard longest ago.
            let stalest = self.announcements.iter()
                .enumerate()
                .min_by_key(|(_, a)| a.last_heard)
                .map(|(i, _)| i)
                .unwrap();
            self.announcements[stalest] = entry;
        }

    }

}


/// The table of peers heard recently, keyed by their wire identity prefix.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<SidPrefix, PeerRecord>,
}

impl PeerTable {

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[inline]
    pub fn get(&self, sid_prefix: &SidPrefix) -> Option<&PeerRecord> {
        self.peers.get(sid_prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> + '_ {
        self.peers.values()
    }

    /// Record an announcement heard from the given sender, creating its
    /// peer record if this is the first time we hear it.
    pub fn note_bar(&mut self, sender: SidPrefix, bar: &Bar, now: Instant) {
        trace!("{sender} announces {} version {}", bar.bid_prefix, bar.version);
        self.peers.entry(sender)
            .or_insert_with(|| PeerRecord::new(sender, now))
            .note_bar(bar, now);
    }

    /// Whether any peer has announced the given bundle and version; used to
    /// pin partials against eviction while their bundle is still being
    /// actively offered around us.
    pub fn any_announced(&self, bid_prefix: BidPrefix, version: Version) -> bool {
        self.peers.values().any(|p| p.has_announced(bid_prefix, version))
    }

    /// Drop peers not heard within the given lifetime.
    pub fn expire(&mut self, now: Instant, lifetime: Duration) {
        self.peers.retain(|sid, peer| {
            let keep = now.saturating_duration_since(peer.last_seen) < lifetime;
            if !keep {
                debug!("expiring peer {sid}");
            }
            keep
        });
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::bundle::RecipientPrefix;

    fn bar(seed: u8, version: u64) -> Bar {
        Bar {
            bid_prefix: BidPrefix::new([seed; 8]),
            version: Version::new(version),
            recipient: RecipientPrefix::BROADCAST,
        }
    }

    fn sid(seed: u8) -> SidPrefix {
        SidPrefix::new([seed; 6])
    }

    #[test]
    fn bar_updates_in_place() {

        let now = Instant::now();
        let mut table = PeerTable::new();

        table.note_bar(sid(1), &bar(7, 100), now);
        table.note_bar(sid(1), &bar(8, 5), now);
        table.note_bar(sid(1), &bar(7, 300), now);

        let peer = table.get(&sid(1)).unwrap();
        assert_eq!(peer.announcements().count(), 2);
        assert_eq!(peer.announced_version(BidPrefix::new([7; 8])), Some(Version::new(300)));
        assert_eq!(peer.announced_version(BidPrefix::new([9; 8])), None);

    }

    #[test]
    fn announcement_acknowledgement() {

        let now = Instant::now();
        let mut table = PeerTable::new();
        table.note_bar(sid(1), &bar(7, 200), now);

        let peer = table.get(&sid(1)).unwrap();
        assert!(peer.has_announced(BidPrefix::new([7; 8]), Version::new(200)));
        assert!(peer.has_announced(BidPrefix::new([7; 8]), Version::new(150)));
        assert!(!peer.has_announced(BidPrefix::new([7; 8]), Version::new(250)));

        assert!(table.any_announced(BidPrefix::new([7; 8]), Version::new(200)));
        assert!(!table.any_announced(BidPrefix::new([8; 8]), Version::new(1)));

    }

    #[test]
    fn full_record_replaces_stalest() {

        let start = Instant::now();
        let mut table = PeerTable::new();

        for i in 0..PEER_MAX_ANNOUNCEMENTS {
            table.note_bar(sid(1), &bar(i as u8, 1), start + Duration::from_secs(i as u64 + 1));
        }

        // The oldest entry is for seed 0; a new bundle takes its place.
        table.note_bar(sid(1), &bar(0xFF, 1), start + Duration::from_secs(100));
        let peer = table.get(&sid(1)).unwrap();
        assert_eq!(peer.announcements().count(), PEER_MAX_ANNOUNCEMENTS);
        assert_eq!(peer.announced_version(BidPrefix::new([0; 8])), None);
        assert_eq!(peer.announced_version(BidPrefix::new([0xFF; 8])), Some(Version::new(1)));

    }

    #[test]
    fn expiry() {

        let start = Instant::now();
        let mut table = PeerTable::new();
        table.note_bar(sid(1), &bar(1, 1), start);
        table.note_bar(sid(2), &bar(1, 1), start + Duration::from_secs(50));

        table.expire(start + Duration::from_secs(70), Duration::from_secs(60));
        assert!(table.get(&sid(1)).is_none());
        assert!(table.get(&sid(2)).is_some());

    }

}
