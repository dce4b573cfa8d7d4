//! Reassembly state for bundles being received from nearby peers.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use std::fmt;

use rand::Rng;
use tracing::{debug, trace};

use crate::bundle::{BidPrefix, SidPrefix, Version};
use crate::segment::SegmentList;


/// Number of slots in the recent-sender table of each partial bundle. The
/// wire protocol allows 8 to 32.
pub const MAX_RECENT_SENDERS: usize = 16;
/// Age past which a sender slot may be reused for another sender.
pub const SENDER_STALE_AGE: Duration = Duration::from_secs(30);
/// Age up to which a sender counts as actively sending to us. Older slots
/// are ignored for reporting but stay in the table until replaced.
pub const SENDER_ACTIVE_AGE: Duration = Duration::from_secs(10);

/// Size of the request bitmap in bytes.
pub const REQUEST_BITMAP_LEN: usize = 32;
/// Size of one requestable block in bytes.
pub const REQUEST_BLOCK_LEN: u64 = 64;
/// Span of the request window: 32 bytes of bitmap, 8 blocks per byte,
/// 64 bytes per block, 16 KiB in total. Enough for several seconds of
/// traffic even with a full sender table.
pub const REQUEST_WINDOW_LEN: u64 = (REQUEST_BITMAP_LEN as u64) * 8 * REQUEST_BLOCK_LEN;


/// One slot of the recent-sender table.
#[derive(Debug, Clone, Copy)]
struct SenderSlot {
    /// Short 2-byte prefix of the sender's identity.
    sid: [u8; 2],
    /// When this sender was last heard sending us this bundle.
    last_time: Instant,
}


/// Reassembly state for one in-progress inbound bundle: the received
/// manifest and body ranges, the derived request bitmap and the table of
/// peers recently heard sending this bundle.
#[derive(Debug, Clone)]
pub struct PartialBundle {
    bid_prefix: BidPrefix,
    version: Version,
    /// Manifest length, once learnt from an end-of-item piece.
    manifest_length: Option<u64>,
    /// Body length, once learnt: immediately for journalled bundles (the
    /// version is the body length), otherwise from an end-of-item piece or
    /// from manifest inspection.
    body_length: Option<u64>,
    manifest_segments: SegmentList,
    body_segments: SegmentList,
    /// Absolute offset of the first byte the request bitmap describes.
    request_bitmap_start: u64,
    /// One bit per 64-byte block from `request_bitmap_start`; a set bit
    /// means "already held, do not resend".
    request_bitmap: [u8; REQUEST_BITMAP_LEN],
    senders: [Option<SenderSlot>; MAX_RECENT_SENDERS],
    /// Last time any piece of this bundle arrived, for eviction.
    last_activity: Instant,
}

impl PartialBundle {

    pub fn new(bid_prefix: BidPrefix, version: Version, now: Instant) -> Self {
        Self {
            bid_prefix,
            version,
            manifest_length: None,
            body_length: version.journal_length(),
            manifest_segments: SegmentList::new(),
            body_segments: SegmentList::new(),
            request_bitmap_start: 0,
            request_bitmap: [0; REQUEST_BITMAP_LEN],
            senders: [None; MAX_RECENT_SENDERS],
            last_activity: now,
        }
    }

    #[inline]
    pub fn bid_prefix(&self) -> BidPrefix {
        self.bid_prefix
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn manifest_length(&self) -> Option<u64> {
        self.manifest_length
    }

    #[inline]
    pub fn body_length(&self) -> Option<u64> {
        self.body_length
    }

    #[inline]
    pub fn manifest_segments(&self) -> &SegmentList {
        &self.manifest_segments
    }

    #[inline]
    pub fn body_segments(&self) -> &SegmentList {
        &self.body_segments
    }

    #[inline]
    pub fn request_bitmap_start(&self) -> u64 {
        self.request_bitmap_start
    }

    #[inline]
    pub fn request_bitmap(&self) -> &[u8; REQUEST_BITMAP_LEN] {
        &self.request_bitmap
    }

    #[inline]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Restart this partial for a newer version of the same bundle. All
    /// received ranges belong to the superseded version and are dropped,
    /// as is the sender table.
    pub fn reset_to_version(&mut self, version: Version, now: Instant) {
        self.version = version;
        self.manifest_length = None;
        self.body_length = version.journal_length();
        self.manifest_segments.clear();
        self.body_segments.clear();
        self.request_bitmap_start = 0;
        self.request_bitmap = [0; REQUEST_BITMAP_LEN];
        self.senders = [None; MAX_RECENT_SENDERS];
        self.last_activity = now;
    }

    /// Record a received piece of this bundle, coalescing it into the
    /// appropriate range list and refreshing the request bitmap.
    pub fn insert_piece(&mut self, is_manifest: bool, start_offset: u64, data: Vec<u8>, end_of_item: bool, now: Instant) {

        self.last_activity = now;
        let item_end = start_offset + data.len() as u64;

        if is_manifest {
            self.manifest_segments.insert(start_offset, data);
        } else {
            self.body_segments.insert(start_offset, data);
        }

        if end_of_item {
            let length = if is_manifest { &mut self.manifest_length } else { &mut self.body_length };
            if *length != Some(item_end) {
                trace!("{} item length finalised to {item_end}",
                    if is_manifest { "manifest" } else { "body" });
                *length = Some(item_end);
            }
        }

        self.update_request_bitmap();

    }

    /// Let manifest inspection supply the body length when no end-of-item
    /// piece has been heard yet.
    pub fn learn_body_length(&mut self, length: u64) {
        if self.body_length.is_none() {
            trace!("body length learnt from manifest: {length}");
            self.body_length = Some(length);
        }
    }

    /// Recompute the starting offset and bitmap of 64-byte blocks still
    /// wanted, so that all our current senders know where they should next
    /// send from.
    ///
    /// The window is anchored at the absolute first hole in the body: if
    /// the lowest range starts at zero the window begins where it ends,
    /// otherwise at zero (the first clear bit then correctly advertises
    /// the missing prefix). Blocks stay aligned to absolute 64-byte
    /// boundaries; a range's partial head block is ignored.
    fn update_request_bitmap(&mut self) {

        let mut starting_position = 0;
        if let Some((start, len)) = self.body_segments.first() {
            if start == 0 {
                starting_position = len;
            }
        }

        let mut bitmap = [0u8; REQUEST_BITMAP_LEN];
        let window_end = starting_position + REQUEST_WINDOW_LEN;

        for (seg_start, data) in self.body_segments.iter() {

            let seg_len = data.len() as u64;
            if seg_start >= window_end || seg_start + seg_len <= starting_position {
                continue;
            }

            let mut start = seg_start;
            let mut length = seg_len;

            // Ignore any partial first block.
            if start % REQUEST_BLOCK_LEN != 0 {
                let trim = REQUEST_BLOCK_LEN - (start % REQUEST_BLOCK_LEN);
                start += trim;
                length = length.saturating_sub(trim);
            }

            // Mark every whole block we hold as not wanted.
            while length >= REQUEST_BLOCK_LEN {
                if start >= starting_position {
                    let block = ((start - starting_position) / REQUEST_BLOCK_LEN) as usize;
                    if block >= REQUEST_BITMAP_LEN * 8 {
                        break;
                    }
                    bitmap[block >> 3] |= 1 << (block & 7);
                }
                start += REQUEST_BLOCK_LEN;
                length -= REQUEST_BLOCK_LEN;
            }

        }

        self.request_bitmap_start = starting_position;
        self.request_bitmap = bitmap;

    }

    /// Record that a peer was just heard sending us this bundle. An
    /// existing slot for the sender is refreshed; otherwise a slot older
    /// than [`SENDER_STALE_AGE`] (or empty) is reused, and failing that a
    /// uniformly random one.
    pub fn note_sender(&mut self, sender: SidPrefix, now: Instant) {

        let short = sender.short();
        let mut victim = rand::thread_rng().gen_range(0..MAX_RECENT_SENDERS);
        let mut index = None;

        for (i, slot) in self.senders.iter().enumerate() {
            match slot {
                Some(slot) if slot.sid == short => {
                    index = Some(i);
                    break;
                }
                Some(slot) if now.saturating_duration_since(slot.last_time) >= SENDER_STALE_AGE => victim = i,
                None => victim = i,
                _ => {}
            }
        }

        self.senders[index.unwrap_or(victim)] = Some(SenderSlot { sid: short, last_time: now });

    }

    /// Iterate the peers heard sending us this bundle within
    /// [`SENDER_ACTIVE_AGE`], as `(short sid prefix, age)`.
    pub fn recent_senders(&self, now: Instant) -> impl Iterator<Item = ([u8; 2], Duration)> + '_ {
        self.senders.iter().flatten().filter_map(move |slot| {
            let age = now.saturating_duration_since(slot.last_time);
            (age < SENDER_ACTIVE_AGE).then_some((slot.sid, age))
        })
    }

    /// Return true when both items are completely held.
    pub fn is_complete(&self) -> bool {
        matches!((self.manifest_length, self.body_length), (Some(m), Some(b))
            if self.manifest_segments.is_complete(m) && self.body_segments.is_complete(b))
    }

    /// Return the assembled manifest and body bytes once complete.
    pub fn assembled(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let manifest = self.manifest_segments.assemble(self.manifest_length?)?;
        let body = self.body_segments.assemble(self.body_length?)?;
        Some((manifest, body))
    }

}

impl fmt::Display for PartialBundle {

    /// Render a progress report: item coverage, received ranges and the
    /// request bitmap (`#` held, `.` wanted).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {

        writeln!(f, "receiving {} version {}:", self.bid_prefix, self.version)?;

        let fmt_len = |len: Option<u64>| match len {
            Some(len) => len.to_string(),
            None => "?".to_string(),
        };

        writeln!(f, "  manifest {}/{} bytes: {:?}",
            self.manifest_segments.covered_bytes(), fmt_len(self.manifest_length),
            self.manifest_segments)?;
        writeln!(f, "  body {}/{} bytes: {:?}",
            self.body_segments.covered_bytes(), fmt_len(self.body_length),
            self.body_segments)?;

        writeln!(f, "  request window from {}:", self.request_bitmap_start)?;
        for row in 0..4 {
            f.write_str("    ")?;
            for block in row * 64..(row + 1) * 64 {
                let held = self.request_bitmap[block >> 3] & (1 << (block & 7)) != 0;
                f.write_str(if held { "#" } else { "." })?;
            }
            writeln!(f)?;
        }

        Ok(())

    }

}


/// Rejection of a piece carrying an older version than the partial already
/// tracks for that bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("piece version {piece} older than tracked version {held}")]
pub struct StalePiece {
    pub held: Version,
    pub piece: Version,
}


/// The bounded set of partial bundles being reassembled, keyed by BID
/// prefix, with one in-progress version per bundle.
#[derive(Debug)]
pub struct PartialSet {
    partials: HashMap<BidPrefix, PartialBundle>,
    capacity: usize,
}

impl PartialSet {

    /// Create a set bounded to the given number of partials, at least one.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "capacity must be at least one");
        Self {
            partials: HashMap::new(),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    #[inline]
    pub fn get(&self, bid_prefix: &BidPrefix) -> Option<&PartialBundle> {
        self.partials.get(bid_prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartialBundle> + '_ {
        self.partials.values()
    }

    pub fn remove(&mut self, bid_prefix: &BidPrefix) -> Option<PartialBundle> {
        self.partials.remove(bid_prefix)
    }

    /// Find or create the partial a piece of `(bid_prefix, version)` belongs
    /// to. A newer version restarts an existing partial, an older one is
    /// rejected. When a new partial would exceed capacity, the partial with
    /// the oldest activity whose bundle is not pinned is evicted first;
    /// `pinned` should answer whether a bundle was seen in a recent
    /// announcement. If everything is pinned the globally oldest goes.
    pub fn obtain(
        &mut self,
        bid_prefix: BidPrefix,
        version: Version,
        now: Instant,
        pinned: impl Fn(BidPrefix, Version) -> bool,
    ) -> Result<&mut PartialBundle, StalePiece> {

        if !self.partials.contains_key(&bid_prefix) {
            if self.partials.len() >= self.capacity {
                self.evict(&pinned);
            }
            self.partials.insert(bid_prefix, PartialBundle::new(bid_prefix, version, now));
            return Ok(self.partials.get_mut(&bid_prefix).unwrap());
        }

        let partial = self.partials.get_mut(&bid_prefix).unwrap();
        if version < partial.version() {
            return Err(StalePiece { held: partial.version(), piece: version });
        }
        if version > partial.version() {
            debug!("version {version} supersedes {} for {bid_prefix}, restarting", partial.version());
            partial.reset_to_version(version, now);
        }

        Ok(partial)

    }

    fn evict(&mut self, pinned: &impl Fn(BidPrefix, Version) -> bool) {

        let victim = self.partials.iter()
            .filter(|(&bid, p)| !pinned(bid, p.version()))
            .min_by_key(|(_, p)| p.last_activity())
            .map(|(&bid, _)| bid)
            .or_else(|| self.partials.iter()
                .min_by_key(|(_, p)| p.last_activity())
                .map(|(&bid, _)| bid));

        if let Some(bid) = victim {
            debug!("evicting partial {bid} to make room");
            self.partials.remove(&bid);
        }

    }

}
