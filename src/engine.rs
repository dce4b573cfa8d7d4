//! The synchronisation engine: owns all protocol state and drives the
//! exchange.
//!
//! The design is fully asynchronous in the store-and-forward sense: a host
//! loop calls [`Engine::tick`] from time to time to put a fresh frame on
//! air, and feeds every frame heard on the radio to [`Engine::receive`].
//! Nothing here blocks beyond the store fetch's deadline and nothing is
//! retried; a lost frame simply means the next tick packs different bytes.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bundle::{Bid, BidPrefix, Sid, SidPrefix, Version};
use crate::cache::ContentCache;
use crate::frame::{
    piece_header_len, Frame, FrameError, FrameHeader, Piece, Record, RecordReader,
    BAR_LEN, FRAME_CAP, MAX_START_OFFSET, MIN_MTU, PIECE_HEADER_LEN, PIECE_MAX_PAYLOAD,
    COUNTER_MASK,
};
use crate::manifest::{ManifestInspector, TextManifestInspector};
use crate::partial::PartialSet;
use crate::peer::PeerTable;
use crate::registry::{BundleRecord, BundleRegistry, DEFAULT_ANNOUNCE_INTERVAL};
use crate::store::Store;


/// Tunables of the engine. The defaults match the wire protocol's
/// expectations and are fine for radio-scale deployments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Anti-starvation interval: a bundle unannounced for this long
    /// outranks the round-robin rotation.
    pub announce_interval: Duration,
    /// Maximum number of bundles reassembled concurrently.
    pub partial_capacity: usize,
    /// How long an unheard peer stays in the peer table.
    pub peer_lifetime: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            partial_capacity: 16,
            peer_lifetime: Duration::from_secs(60),
        }
    }
}


/// The radio the engine hands finished frames to. Sending must not block;
/// a driver under backpressure should drop the frame, the engine never
/// retries and the next tick produces a fresh one.
pub trait RadioSink {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}


/// Counters of notable events, all monotonic.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub stale_pieces: u64,
    pub bundles_completed: u64,
    pub store_failures: u64,
}


/// What happened while processing one received frame.
#[derive(Debug, Default)]
pub struct Receipt {
    /// Bundles whose reassembly this frame completed; the host should
    /// deposit them in the local store.
    pub completed: Vec<AssembledBundle>,
    /// Announcements applied.
    pub bars: usize,
    /// Pieces applied.
    pub pieces: usize,
    /// Whether a malformed record cut the frame short; records before it
    /// were still applied.
    pub malformed: bool,
}


/// A fully reassembled bundle, ready for the local store.
#[derive(Debug, Clone)]
pub struct AssembledBundle {
    pub bid_prefix: BidPrefix,
    pub version: Version,
    pub manifest: Vec<u8>,
    pub body: Vec<u8>,
}


/// Engine error when building a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The MTU cannot hold a useful frame.
    #[error("mtu too small: {0} bytes, need at least {}", MIN_MTU)]
    MtuTooSmall(usize),
}


/// The engine owns the outbound registry, the peer table, the partial set
/// and the content cache; every mutation of protocol state goes through it.
pub struct Engine<S: Store> {
    config: EngineConfig,
    /// Our own identity; its prefix heads every frame we build.
    sid: Sid,
    store: S,
    registry: BundleRegistry,
    peers: PeerTable,
    partials: PartialSet,
    cache: ContentCache,
    inspector: Box<dyn ManifestInspector>,
    /// 15-bit frame counter, observational only.
    counter: u16,
    metrics: EngineMetrics,
}

impl<S: Store> Engine<S> {

    pub fn new(sid: Sid, store: S, config: EngineConfig) -> Self {
        Self {
            sid,
            store,
            registry: BundleRegistry::new(config.announce_interval),
            peers: PeerTable::new(),
            partials: PartialSet::new(config.partial_capacity),
            cache: ContentCache::new(),
            inspector: Box::new(TextManifestInspector),
            counter: 0,
            metrics: EngineMetrics::default(),
            config,
        }
    }

    /// Replace the manifest inspector used to finalise body lengths.
    pub fn set_inspector(&mut self, inspector: Box<dyn ManifestInspector>) {
        self.inspector = inspector;
    }

    #[inline]
    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    #[inline]
    pub fn registry(&self) -> &BundleRegistry {
        &self.registry
    }

    #[inline]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    #[inline]
    pub fn partials(&self) -> &PartialSet {
        &self.partials
    }

    #[inline]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Offer a bundle (or a refreshed version of it) to nearby peers.
    pub fn insert_bundle(&mut self, record: BundleRecord) -> usize {
        self.registry.upsert(record)
    }

    /// Stop offering a bundle.
    pub fn remove_bundle(&mut self, bid: &Bid) -> bool {
        self.registry.remove(bid)
    }

    /// Expire stale peers, build the next frame and hand it to the radio.
    pub fn tick(&mut self, mtu: usize, radio: &mut dyn RadioSink) {
        self.peers.expire(Instant::now(), self.config.peer_lifetime);
        match self.build_frame(mtu) {
            Ok(frame) => {
                if let Err(e) = radio.send(frame.slice()) {
                    debug!("radio send failed, dropping frame: {e}");
                } else {
                    self.metrics.frames_sent += 1;
                }
            }
            Err(e) => warn!("dropping tick: {e}"),
        }
    }

    /// Build the next outbound frame: one announcement off the round-robin
    /// rotation, a piece (or two) of the highest-priority bundle, then
    /// announcements until the frame is full.
    pub fn build_frame(&mut self, mtu: usize) -> Result<Frame, EngineError> {
        if mtu < MIN_MTU {
            return Err(EngineError::MtuTooSmall(mtu));
        }
        Ok(self.build_frame_at(mtu, Instant::now()))
    }

    fn build_frame_at(&mut self, mtu: usize, now: Instant) -> Frame {

        let mut frame = Frame::new(mtu.min(FRAME_CAP));
        frame.write_sender(self.sid.prefix());
        frame.write_counter(self.counter);

        // One announcement so peers keep learning what we hold, even while
        // a large bundle monopolises the piece slots.
        if frame.free() >= BAR_LEN {
            if let Some(index) = self.registry.next_bar_index() {
                frame.put_bar(&self.registry.get(index).bar());
            }
        }

        if let Some(best) = self.registry.highest_priority_bundle(&self.peers, now) {
            self.announce_piece(&mut frame, best, now);
            // A second piece of the same bundle covers the common case
            // where the manifest just ended and there is room to start the
            // body in the same frame.
            if frame.free() >= PIECE_HEADER_LEN {
                self.announce_piece(&mut frame, best, now);
            }
        }

        // Fill the trailing space with announcements.
        while frame.free() >= BAR_LEN {
            let Some(index) = self.registry.next_bar_index() else { break };
            frame.put_bar(&self.registry.get(index).bar());
        }

        self.counter = (self.counter + 1) & COUNTER_MASK;
        trace!("built {frame:?}");
        frame

    }

    /// Append the next piece of the given bundle to the frame, advancing
    /// its cursors. A store failure skips the piece for this tick and
    /// leaves the cursors untouched.
    fn announce_piece(&mut self, frame: &mut Frame, index: usize, now: Instant) {

        let (bid, version) = {
            let record = self.registry.get(index);
            (*record.bid(), record.version())
        };

        let cached = match self.cache.prime(&mut self.store, &bid, version) {
            Ok(cached) => cached,
            Err(e) => {
                self.metrics.store_failures += 1;
                warn!("store fetch failed for {bid:?}: {e}");
                return;
            }
        };

        let manifest_len = cached.manifest().len() as u64;
        let body_len = cached.body().len() as u64;

        let record = self.registry.get_mut(index);

        // For journalled bundles, start from the first byte our neighbours
        // still need. Checking on every piece means we skip bytes we have
        // just heard about a peer having received.
        if version.is_journalled() {
            let first_byte = journal_resume_point(&self.peers, record, body_len);
            if record.body_cursor() < first_byte {
                debug!("skipping body of {bid:?} from {} straight to {first_byte}, \
                    recipient or all peers have the intervening bytes", record.body_cursor());
                record.skip_body_to(first_byte);
            }
        }

        let (is_manifest, start, available) = if record.manifest_cursor() < manifest_len {
            (true, record.manifest_cursor(), manifest_len - record.manifest_cursor())
        } else if record.body_cursor() < body_len {
            (false, record.body_cursor(), body_len - record.body_cursor())
        } else {
            // Nothing left to send: the body is empty or skip-ahead moved
            // the cursor straight to the end. Stamp the pass anyway so the
            // bundle is demoted instead of monopolising the piece slot.
            record.complete_pass(version, now);
            return;
        };

        if start > MAX_START_OFFSET {
            warn!("offset {start} of {bid:?} not representable, skipping");
            return;
        }

        let Some(max_bytes) = frame.free().checked_sub(piece_header_len(start)) else {
            return;
        };
        if max_bytes == 0 {
            return;
        }

        let actual = available.min(max_bytes as u64).min(PIECE_MAX_PAYLOAD as u64) as usize;
        let end_of_item = actual as u64 == available;

        let data = if is_manifest {
            cached.manifest()[start as usize..][..actual].to_vec()
        } else {
            cached.body()[start as usize..][..actual].to_vec()
        };

        let piece = Piece {
            bid_prefix: bid.prefix(),
            version,
            is_manifest,
            start_offset: start,
            end_of_item,
            data,
        };
        frame.put_piece(&piece);
        trace!("announced {piece:?}");

        if is_manifest {
            record.advance_manifest(actual as u64);
        } else {
            record.advance_body(actual as u64);
            if record.body_cursor() == body_len {
                // A full pass over the bundle: stamp it and restart, the
                // bundle keeps being re-broadcast at a demoted priority.
                record.complete_pass(version, now);
            }
        }

    }

    /// Process one frame heard on the radio, updating the peer table from
    /// its announcements and the partial set from its pieces. Records
    /// decoded before a malformed one are still applied.
    pub fn receive(&mut self, data: &[u8]) -> Result<Receipt, FrameError> {
        self.receive_at(data, Instant::now())
    }

    fn receive_at(&mut self, data: &[u8], now: Instant) -> Result<Receipt, FrameError> {

        let header = FrameHeader::read(data)?;
        self.metrics.frames_received += 1;

        // Some radios hand us back our own broadcasts.
        if header.sender == self.sid.prefix() {
            trace!("ignoring our own frame");
            return Ok(Receipt::default());
        }

        let mut receipt = Receipt::default();

        for record in RecordReader::of_frame(data) {
            match record {
                Ok(Record::Bar(bar)) => {
                    self.peers.note_bar(header.sender, &bar, now);
                    receipt.bars += 1;
                }
                Ok(Record::Piece(piece)) => {
                    receipt.pieces += 1;
                    if let Some(bundle) = self.accept_piece(header.sender, piece, now) {
                        receipt.completed.push(bundle);
                    }
                }
                Err(e) => {
                    self.metrics.malformed_frames += 1;
                    debug!("discarding remainder of frame from {}: {e}", header.sender);
                    receipt.malformed = true;
                    break;
                }
            }
        }

        Ok(receipt)

    }

    fn accept_piece(&mut self, sender: SidPrefix, piece: Piece, now: Instant) -> Option<AssembledBundle> {

        let peers = &self.peers;
        let partial = match self.partials.obtain(
            piece.bid_prefix,
            piece.version,
            now,
            |bid, version| peers.any_announced(bid, version),
        ) {
            Ok(partial) => partial,
            Err(stale) => {
                self.metrics.stale_pieces += 1;
                debug!("discarding piece from {sender}: {stale}");
                return None;
            }
        };

        partial.insert_piece(piece.is_manifest, piece.start_offset, piece.data, piece.end_of_item, now);
        partial.note_sender(sender, now);

        // A manifest we can already read may tell us the body length
        // before any end-of-item piece arrives.
        if partial.body_length().is_none() {
            if let Some(length) = self.inspector.body_length(partial.manifest_segments().prefix_bytes()) {
                partial.learn_body_length(length);
            }
        }

        trace!("{partial}");

        if !partial.is_complete() {
            return None;
        }

        let version = partial.version();
        let (manifest, body) = partial.assembled()?;
        self.partials.remove(&piece.bid_prefix);
        self.metrics.bundles_completed += 1;
        debug!("assembled bundle {} version {version}", piece.bid_prefix);

        Some(AssembledBundle {
            bid_prefix: piece.bid_prefix,
            version,
            manifest,
            body,
        })

    }

}


/// First body byte worth announcing for a journalled bundle: the recipient
/// peer's received-byte watermark when it is around and has announced this
/// bundle, otherwise the lowest watermark across all peers — with any peer
/// lacking the bundle entirely pulling the start back to zero.
fn journal_resume_point(peers: &PeerTable, record: &BundleRecord, cached_body_len: u64) -> u64 {

    let bid_prefix = record.bid().prefix();

    if let Some(recipient) = record.recipient() {
        let watermark = peers.get(&recipient.prefix())
            .and_then(|peer| peer.announced_version(bid_prefix))
            .and_then(Version::journal_length)
            .unwrap_or(0);
        if watermark > 0 {
            return watermark.min(cached_body_len);
        }
    }

    let mut first_byte = cached_body_len;
    for peer in peers.iter() {
        match peer.announced_version(bid_prefix) {
            None => return 0,
            Some(version) => {
                if let Some(watermark) = version.journal_length() {
                    first_byte = first_byte.min(watermark);
                }
            }
        }
    }
    first_byte

}
