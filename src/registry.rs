//! Registry of local bundles offered to nearby peers.

use std::time::{Duration, Instant};

use crate::bundle::{Bid, RecipientPrefix, Sid, Version};
use crate::frame::Bar;
use crate::peer::PeerTable;


/// Default anti-starvation interval: a bundle not announced for this long
/// outranks the ordinary round-robin rotation.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);


/// One local bundle being offered, with the announcement cursors tracking
/// the next manifest and body byte to send and the metadata feeding the
/// priority ordering.
#[derive(Debug, Clone)]
pub struct BundleRecord {
    bid: Bid,
    version: Version,
    /// Full recipient identity, `None` for broadcast bundles.
    recipient: Option<Sid>,
    /// Service name from the bundle's manifest; MeshMS payloads get the
    /// highest priority treatment.
    service: String,
    manifest_length: u64,
    body_length: u64,
    /// Offset of the next manifest byte to announce.
    manifest_cursor: u64,
    /// Offset of the next body byte to announce.
    body_cursor: u64,
    last_announced_time: Option<Instant>,
    last_version_announced: Option<Version>,
}

impl BundleRecord {

    pub fn new(
        bid: Bid,
        version: Version,
        recipient: Option<Sid>,
        service: impl Into<String>,
        manifest_length: u64,
        body_length: u64,
    ) -> Self {
        Self {
            bid,
            version,
            recipient,
            service: service.into(),
            manifest_length,
            body_length,
            manifest_cursor: 0,
            body_cursor: 0,
            last_announced_time: None,
            last_version_announced: None,
        }
    }

    #[inline]
    pub fn bid(&self) -> &Bid {
        &self.bid
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn recipient(&self) -> Option<&Sid> {
        self.recipient.as_ref()
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn manifest_length(&self) -> u64 {
        self.manifest_length
    }

    #[inline]
    pub fn body_length(&self) -> u64 {
        self.body_length
    }

    #[inline]
    pub fn manifest_cursor(&self) -> u64 {
        self.manifest_cursor
    }

    #[inline]
    pub fn body_cursor(&self) -> u64 {
        self.body_cursor
    }

    #[inline]
    pub fn last_announced_time(&self) -> Option<Instant> {
        self.last_announced_time
    }

    #[inline]
    pub fn last_version_announced(&self) -> Option<Version> {
        self.last_version_announced
    }

    /// True for MeshMS conversation payloads, which are kept at minimal
    /// latency over the transport.
    pub fn is_meshms(&self) -> bool {
        self.service.eq_ignore_ascii_case("MeshMS1")
            || self.service.eq_ignore_ascii_case("MeshMS2")
    }

    /// The announcement record for this bundle.
    pub fn bar(&self) -> Bar {
        Bar {
            bid_prefix: self.bid.prefix(),
            version: self.version,
            recipient: self.recipient.as_ref()
                .map(Sid::recipient_prefix)
                .unwrap_or(RecipientPrefix::BROADCAST),
        }
    }

    /// Advance the manifest cursor after emitting a manifest piece.
    pub fn advance_manifest(&mut self, len: u64) {
        self.manifest_cursor = (self.manifest_cursor + len).min(self.manifest_length);
    }

    /// Advance the body cursor after emitting a body piece.
    pub fn advance_body(&mut self, len: u64) {
        self.body_cursor = (self.body_cursor + len).min(self.body_length);
    }

    /// Fast-forward the body cursor, used when peers are known to already
    /// hold the intervening bytes of a journalled bundle.
    pub fn skip_body_to(&mut self, offset: u64) {
        self.body_cursor = offset.min(self.body_length);
    }

    /// Mark a full announcement pass over this bundle: stamp the time and
    /// the version that was sent, and reset both cursors so the next round
    /// restarts the bundle (a deliberate continuous re-broadcast).
    pub fn complete_pass(&mut self, announced: Version, now: Instant) {
        self.last_announced_time = Some(now);
        self.last_version_announced = Some(announced);
        self.manifest_cursor = 0;
        self.body_cursor = 0;
    }

    /// Priority class, lower is more urgent: 0 a MeshMS payload its
    /// recipient peer is still waiting for, 1 any payload its recipient
    /// peer is still waiting for, 2 a bundle not announced within the
    /// anti-starvation interval, 3 everything else (round-robin).
    fn priority_rank(&self, peers: &PeerTable, now: Instant, interval: Duration) -> u8 {

        let recipient_waiting = self.recipient.as_ref()
            .and_then(|r| peers.get(&r.prefix()))
            .map(|p| !p.has_announced(self.bid.prefix(), self.version))
            .unwrap_or(false);

        if recipient_waiting && self.is_meshms() {
            0
        } else if recipient_waiting {
            1
        } else if self.last_announced_time
            .map_or(true, |t| now.saturating_duration_since(t) >= interval)
        {
            2
        } else {
            3
        }

    }

}


/// The set of local bundles to offer, with the round-robin announcement
/// cursor and the priority selection.
#[derive(Debug)]
pub struct BundleRegistry {
    bundles: Vec<BundleRecord>,
    /// Round-robin cursor over announcement records.
    bar_cursor: usize,
    announce_interval: Duration,
}

impl BundleRegistry {

    pub fn new(announce_interval: Duration) -> Self {
        Self {
            bundles: Vec::new(),
            bar_cursor: 0,
            announce_interval,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &BundleRecord {
        &self.bundles[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut BundleRecord {
        &mut self.bundles[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundleRecord> + '_ {
        self.bundles.iter()
    }

    pub fn find(&self, bid: &Bid) -> Option<&BundleRecord> {
        self.bundles.iter().find(|b| b.bid() == bid)
    }

    /// Add a bundle, or refresh it if already present. A version change
    /// resets the announcement cursors, the new content is announced from
    /// its beginning.
    pub fn upsert(&mut self, record: BundleRecord) -> usize {

        if let Some(index) = self.bundles.iter().position(|b| b.bid == record.bid) {
            let existing = &mut self.bundles[index];
            if existing.version != record.version {
                existing.manifest_cursor = 0;
                existing.body_cursor = 0;
            }
            existing.version = record.version;
            existing.recipient = record.recipient;
            existing.service = record.service;
            existing.manifest_length = record.manifest_length;
            existing.body_length = record.body_length;
            return index;
        }

        self.bundles.push(record);
        self.bundles.len() - 1

    }

    /// Remove a bundle, returning whether it was present.
    pub fn remove(&mut self, bid: &Bid) -> bool {
        let Some(index) = self.bundles.iter().position(|b| &b.bid == bid) else {
            return false;
        };
        self.bundles.remove(index);
        if self.bar_cursor >= self.bundles.len() {
            self.bar_cursor = 0;
        }
        true
    }

    /// Advance the round-robin cursor and return the record index to
    /// announce next, if any bundle exists.
    pub fn next_bar_index(&mut self) -> Option<usize> {
        if self.bundles.is_empty() {
            return None;
        }
        self.bar_cursor += 1;
        if self.bar_cursor >= self.bundles.len() {
            self.bar_cursor = 0;
        }
        Some(self.bar_cursor)
    }

    /// Select the most urgent bundle to announce a piece of, `None` only
    /// when the registry is empty. Ties within a priority class go to the
    /// least recently announced bundle, which is also what realises the
    /// final round-robin class.
    pub fn highest_priority_bundle(&self, peers: &PeerTable, now: Instant) -> Option<usize> {
        self.bundles.iter()
            .enumerate()
            .min_by_key(|(_, b)| (b.priority_rank(peers, now, self.announce_interval), b.last_announced_time))
            .map(|(index, _)| index)
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::bundle::{BID_LEN, SID_LEN};

    fn bid(seed: u8) -> Bid {
        Bid::new([seed; BID_LEN])
    }

    fn sid(seed: u8) -> Sid {
        Sid::new([seed; SID_LEN])
    }

    fn record(seed: u8, recipient: Option<Sid>, service: &str) -> BundleRecord {
        BundleRecord::new(bid(seed), Version::new(0x1_0000_0000), recipient, service, 100, 1000)
    }

    #[test]
    fn priority_classes() {

        let now = Instant::now();
        let mut peers = PeerTable::new();
        // A peer we can deliver to, which has announced nothing.
        peers.note_bar(sid(9).prefix(), &Bar {
            bid_prefix: bid(0xEE).prefix(),
            version: Version::new(1),
            recipient: RecipientPrefix::BROADCAST,
        }, now);

        let mut registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);

        // Freshly announced broadcast bundle: plain round-robin class.
        let plain = registry.upsert(record(1, None, "file"));
        registry.get_mut(plain).complete_pass(Version::new(0x1_0000_0000), now);

        // Starved broadcast bundle.
        let starved = registry.upsert(record(2, None, "file"));
        registry.get_mut(starved)
            .complete_pass(Version::new(0x1_0000_0000), now - Duration::from_secs(60));

        assert_eq!(registry.highest_priority_bundle(&peers, now), Some(starved));

        // A bundle addressed to the present peer beats both.
        let addressed = registry.upsert(record(3, Some(sid(9)), "file"));
        assert_eq!(registry.highest_priority_bundle(&peers, now), Some(addressed));

        // A MeshMS bundle addressed to the present peer beats everything.
        let meshms = registry.upsert(record(4, Some(sid(9)), "MeshMS2"));
        assert_eq!(registry.highest_priority_bundle(&peers, now), Some(meshms));

        // Once the peer announces the MeshMS bundle at its version, it
        // drops out of the delivery classes.
        peers.note_bar(sid(9).prefix(), &Bar {
            bid_prefix: bid(4).prefix(),
            version: Version::new(0x1_0000_0000),
            recipient: RecipientPrefix::BROADCAST,
        }, now);
        assert_eq!(registry.highest_priority_bundle(&peers, now), Some(addressed));

    }

    #[test]
    fn never_announced_wins_ties() {

        let now = Instant::now();
        let peers = PeerTable::new();
        let mut registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);

        let old = registry.upsert(record(1, None, "file"));
        registry.get_mut(old).complete_pass(Version::new(0x1_0000_0000), now - Duration::from_secs(120));
        let fresh = registry.upsert(record(2, None, "file"));

        // Both are in the starved class, the never-announced one wins.
        assert_eq!(registry.highest_priority_bundle(&peers, now), Some(fresh));

    }

    #[test]
    fn empty_registry_has_no_candidate() {
        let registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);
        assert_eq!(registry.highest_priority_bundle(&PeerTable::new(), Instant::now()), None);
        let mut registry = registry;
        assert_eq!(registry.next_bar_index(), None);
    }

    #[test]
    fn bar_cursor_rotates() {

        let mut registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);
        registry.upsert(record(1, None, "file"));
        registry.upsert(record(2, None, "file"));
        registry.upsert(record(3, None, "file"));

        let seen: Vec<_> = (0..6).map(|_| registry.next_bar_index().unwrap()).collect();
        assert_eq!(seen, vec![1, 2, 0, 1, 2, 0]);

    }

    #[test]
    fn version_bump_resets_cursors() {

        let mut registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);
        let index = registry.upsert(record(1, None, "file"));
        registry.get_mut(index).advance_manifest(50);
        registry.get_mut(index).advance_body(500);

        // Same version: cursors survive a refresh.
        registry.upsert(record(1, None, "file"));
        assert_eq!(registry.get(index).manifest_cursor(), 50);

        // New version: cursors restart.
        let mut bumped = record(1, None, "file");
        bumped.version = Version::new(0x1_0000_0001);
        registry.upsert(bumped);
        assert_eq!(registry.get(index).manifest_cursor(), 0);
        assert_eq!(registry.get(index).body_cursor(), 0);
        assert_eq!(registry.get(index).version(), Version::new(0x1_0000_0001));

    }

    #[test]
    fn pass_completion_restarts_bundle() {

        let now = Instant::now();
        let mut registry = BundleRegistry::new(DEFAULT_ANNOUNCE_INTERVAL);
        let index = registry.upsert(record(1, None, "file"));

        let record = registry.get_mut(index);
        record.advance_manifest(100);
        record.advance_body(1000);
        record.complete_pass(Version::new(0x1_0000_0000), now);

        assert_eq!(record.manifest_cursor(), 0);
        assert_eq!(record.body_cursor(), 0);
        assert_eq!(record.last_announced_time(), Some(now));
        assert_eq!(record.last_version_announced(), Some(Version::new(0x1_0000_0000)));

    }

}
