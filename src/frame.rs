//! Advertisement frame layout with record encoding and decoding.
//!
//! A frame is an MTU-bounded byte string: a 6-byte sender identity prefix,
//! a 2-byte message counter, then a sequence of tagged records interleaving
//! bundle announcements with raw pieces of manifest or body.

use std::io::{self, Cursor, Read, Write};
use std::fmt;

use crate::bundle::{BidPrefix, RecipientPrefix, SidPrefix, Version};
use crate::util::io::{BcReadExt, BcWriteExt};
use crate::util::BytesFmt;


/// Upper bound on the advertisement payload any supported transport offers,
/// this caps the MTU a frame can be built for.
pub const FRAME_CAP: usize = 1024;
/// Length of the frame header: sender prefix and message counter.
pub const FRAME_HEADER_LEN: usize = 8;
/// Smallest MTU the frame builder accepts.
pub const MIN_MTU: usize = 64;

/// Encoded length of an announcement record, tag included.
pub const BAR_LEN: usize = 21;
/// Encoded length of a piece record header with a small offset, tag included.
pub const PIECE_HEADER_LEN: usize = 21;
/// Encoded length of a piece record header with a large offset, tag included.
pub const PIECE_HEADER_LARGE_LEN: usize = 23;
/// Largest payload a single piece record can carry (11-bit length field).
pub const PIECE_MAX_PAYLOAD: usize = 0x7FF;
/// Largest start offset representable without the 2-byte extension.
pub const SMALL_OFFSET_MAX: u64 = 0xFFFFF;
/// Largest start offset representable at all (20 + 16 bits).
pub const MAX_START_OFFSET: u64 = (1 << 36) - 1;

/// Mask of the 15-bit message counter in the header's counter field.
pub const COUNTER_MASK: u16 = 0x7FFF;
/// Counter field bit marking a frame as a retransmission.
pub const RETRANSMIT_FLAG: u16 = 0x8000;

const TAG_BAR: u8 = b'B';
const TAG_PIECE_SMALL: u8 = b'p';
const TAG_PIECE_SMALL_END: u8 = b'q';
const TAG_PIECE_LARGE: u8 = b'P';
const TAG_PIECE_LARGE_END: u8 = b'Q';


/// Return the encoded header length for a piece starting at the given
/// offset, tag included.
#[inline]
pub fn piece_header_len(start_offset: u64) -> usize {
    if start_offset > SMALL_OFFSET_MAX {
        PIECE_HEADER_LARGE_LEN
    } else {
        PIECE_HEADER_LEN
    }
}


/// An outbound advertisement frame being built. The internal buffer is
/// fixed-capacity but the frame enforces the MTU it was created for; records
/// are appended up to that limit and [`Self::slice`] is what goes on air.
#[derive(Clone)]
pub struct Frame {
    /// Inner boxed data.
    inner: Box<Inner>,
}

/// Internal frame data that is boxed.
#[derive(Clone)]
struct Inner {
    /// Full raw data of the frame.
    buf: [u8; FRAME_CAP],
    /// Length of the frame, never below the header length.
    len: u16,
    /// The MTU this frame is being built for.
    mtu: u16,
}

impl Frame {

    /// Create an empty frame for the given MTU, with a zeroed header. The
    /// function panics if the MTU cannot even hold the header, or exceeds
    /// [`FRAME_CAP`].
    pub fn new(mtu: usize) -> Self {
        assert!(mtu >= FRAME_HEADER_LEN, "given mtu too small");
        assert!(mtu <= FRAME_CAP, "given mtu too high");
        Self {
            inner: Box::new(Inner {
                buf: [0; FRAME_CAP],
                len: FRAME_HEADER_LEN as u16,
                mtu: mtu as u16,
            })
        }
    }

    /// The MTU this frame is being built for.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.inner.mtu as usize
    }

    /// Return the length of this frame, never below [`FRAME_HEADER_LEN`].
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == FRAME_HEADER_LEN
    }

    /// Return the length still available under the MTU.
    #[inline]
    pub fn free(&self) -> usize {
        self.mtu() - self.len()
    }

    /// Get a slice of the frame's data, this is what goes on air.
    #[inline]
    pub fn slice(&self) -> &[u8] {
        &self.inner.buf[..self.inner.len as usize]
    }

    /// Grow the frame's data by a given amount of bytes, and return a
    /// mutable slice to the newly allocated data.
    ///
    /// This function panics if the available length is smaller than the
    /// requested length.
    #[inline]
    fn grow(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= self.free(), "not enough available data");
        let ptr = &mut self.inner.buf[self.inner.len as usize..][..len];
        self.inner.len += len as u16;
        ptr
    }

    /// Write the sender identity prefix into the header.
    #[inline]
    pub fn write_sender(&mut self, sender: SidPrefix) {
        self.inner.buf[..6].copy_from_slice(sender.as_bytes());
    }

    /// Write the message counter into the header. The retransmission bit is
    /// always clear in freshly built frames, so the value is masked to its
    /// low 15 bits.
    #[inline]
    pub fn write_counter(&mut self, counter: u16) {
        self.inner.buf[6..8].copy_from_slice(&(counter & COUNTER_MASK).to_le_bytes());
    }

    /// Append an announcement record. The caller must have checked that
    /// [`BAR_LEN`] bytes are available.
    pub fn put_bar(&mut self, bar: &Bar) {
        // No IO error can be produced by a cursor over an exact slice.
        bar.write(Cursor::new(self.grow(BAR_LEN))).unwrap();
    }

    /// Append a piece record. The caller must have checked that
    /// [`Piece::encoded_len`] bytes are available.
    pub fn put_piece(&mut self, piece: &Piece) {
        piece.write(Cursor::new(self.grow(piece.encoded_len()))).unwrap();
    }

}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("mtu", &self.mtu())
            .field("len", &self.len())
            .field("data", &format_args!("{}", BytesFmt(self.slice())))
            .finish()
    }
}


/// The decoded header of a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Identity prefix of the sending node.
    pub sender: SidPrefix,
    /// 15-bit message counter, observational only.
    pub counter: u16,
    /// Whether the sender marked this frame as a retransmission.
    pub retransmission: bool,
}

impl FrameHeader {

    /// Decode the header of a received frame.
    pub fn read(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        let sender = SidPrefix::new(data[..6].try_into().unwrap());
        let raw = u16::from_le_bytes(data[6..8].try_into().unwrap());
        Ok(Self {
            sender,
            counter: raw & COUNTER_MASK,
            retransmission: raw & RETRANSMIT_FLAG != 0,
        })
    }

}


/// A bundle announcement record: "the sender holds bundle (BID prefix,
/// version), addressed to recipient prefix".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bar {
    pub bid_prefix: BidPrefix,
    pub version: Version,
    pub recipient: RecipientPrefix,
}

impl Bar {

    /// Encode this record, tag included, to the given writer.
    pub fn write(&self, mut writer: impl Write) -> io::Result<()> {
        writer.write_u8(TAG_BAR)?;
        writer.write_blob(self.bid_prefix.as_bytes())?;
        writer.write_u64(self.version.get())?;
        writer.write_blob(self.recipient.as_bytes())
    }

    /// Decode the record body, the tag having already been consumed.
    fn read(reader: &mut impl Read) -> Result<Self, RecordError> {
        Ok(Self {
            bid_prefix: BidPrefix::new(reader.read_bytes()?),
            version: Version::new(reader.read_u64()?),
            recipient: RecipientPrefix::new(reader.read_bytes()?),
        })
    }

}


/// A piece record: a contiguous byte slice of a bundle's manifest or body.
#[derive(Clone, PartialEq, Eq)]
pub struct Piece {
    pub bid_prefix: BidPrefix,
    pub version: Version,
    /// True if the bytes belong to the manifest, false for the body.
    pub is_manifest: bool,
    /// Absolute offset of the first byte within its item.
    pub start_offset: u64,
    /// Advisory flag: the sender believes no further bytes of this item
    /// exist beyond `start_offset + data.len()`. Receivers may use it to
    /// finalise an item's length but must not require it.
    pub end_of_item: bool,
    pub data: Vec<u8>,
}

impl Piece {

    /// The encoded length of this record, tag, header and payload included.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        piece_header_len(self.start_offset) + self.data.len()
    }

    /// Encode this record, tag included, to the given writer.
    ///
    /// This function panics if the start offset is not representable or if
    /// the payload exceeds [`PIECE_MAX_PAYLOAD`]; producers clip before
    /// constructing the record.
    pub fn write(&self, mut writer: impl Write) -> io::Result<()> {

        assert!(self.start_offset <= MAX_START_OFFSET, "start offset not representable");
        assert!(self.data.len() <= PIECE_MAX_PAYLOAD, "payload too long");

        let large = self.start_offset > SMALL_OFFSET_MAX;
        let tag = match (large, self.end_of_item) {
            (false, false) => TAG_PIECE_SMALL,
            (false, true) => TAG_PIECE_SMALL_END,
            (true, false) => TAG_PIECE_LARGE,
            (true, true) => TAG_PIECE_LARGE_END,
        };

        // Low 20 bits of the offset, 11 bits of length, manifest flag.
        let mut compound = (self.start_offset as u32) & 0xF_FFFF;
        compound |= (self.data.len() as u32) << 20;
        if self.is_manifest {
            compound |= 0x8000_0000;
        }

        writer.write_u8(tag)?;
        writer.write_blob(self.bid_prefix.as_bytes())?;
        writer.write_u64(self.version.get())?;
        writer.write_u32(compound)?;
        if large {
            writer.write_u16((self.start_offset >> 20) as u16)?;
        }
        writer.write_blob(&self.data)

    }

    /// Decode the record body for the given tag, the tag having already
    /// been consumed.
    fn read(reader: &mut impl Read, tag: u8) -> Result<Self, RecordError> {

        let (large, end_of_item) = match tag {
            TAG_PIECE_SMALL => (false, false),
            TAG_PIECE_SMALL_END => (false, true),
            TAG_PIECE_LARGE => (true, false),
            TAG_PIECE_LARGE_END => (true, true),
            _ => return Err(RecordError::UnknownTag(tag)),
        };

        let bid_prefix = BidPrefix::new(reader.read_bytes()?);
        let version = Version::new(reader.read_u64()?);
        let compound = reader.read_u32()?;

        let mut start_offset = (compound & 0xF_FFFF) as u64;
        let length = ((compound >> 20) & 0x7FF) as usize;
        let is_manifest = compound & 0x8000_0000 != 0;

        if large {
            start_offset |= (reader.read_u16()? as u64) << 20;
        }

        let data = reader.read_blob(length)?;

        Ok(Self { bid_prefix, version, is_manifest, start_offset, end_of_item, data })

    }

}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piece")
            .field("bid_prefix", &self.bid_prefix)
            .field("version", &self.version)
            .field("is_manifest", &self.is_manifest)
            .field("start_offset", &self.start_offset)
            .field("end_of_item", &self.end_of_item)
            .field("len", &self.data.len())
            .finish()
    }
}


/// A record decoded from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A bundle announcement.
    Bar(Bar),
    /// A piece of a bundle's manifest or body.
    Piece(Piece),
}


/// An iterator over the records of a received frame. Records decoded before
/// a malformed one are still yielded; the error itself is yielded once and
/// the remainder of the frame is discarded.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {

    /// Iterate the record area of a whole received frame, header included.
    pub fn of_frame(data: &'a [u8]) -> Self {
        Self::new(&data[FRAME_HEADER_LEN.min(data.len())..])
    }

    /// Iterate a raw record area.
    pub fn new(records: &'a [u8]) -> Self {
        Self {
            data: records,
            pos: 0,
            failed: false,
        }
    }

}

impl Iterator for RecordReader<'_> {

    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {

        if self.failed || self.pos >= self.data.len() {
            return None;
        }

        let mut cursor = Cursor::new(&self.data[self.pos..]);
        let tag = cursor.read_u8().unwrap();  // At least one byte remains.

        let result = match tag {
            TAG_BAR => Bar::read(&mut cursor).map(Record::Bar),
            tag => Piece::read(&mut cursor, tag).map(Record::Piece),
        };

        match result {
            Ok(record) => {
                self.pos += cursor.position() as usize;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }

    }

}


/// Frame error when the received data cannot hold a header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame is shorter than its fixed header.
    #[error("frame shorter than its header: {0} bytes")]
    TooShort(usize),
}

/// Record error when decoding the record area of a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// An unknown record tag was encountered, nothing past it can be
    /// decoded because record lengths depend on their tag.
    #[error("unknown record tag: 0x{0:02X}")]
    UnknownTag(u8),
    /// A record extends past the end of the frame.
    #[error("record extends past the end of the frame")]
    Truncated,
}

impl From<io::Error> for RecordError {
    fn from(_: io::Error) -> Self {
        RecordError::Truncated
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    fn bid_prefix(seed: u8) -> BidPrefix {
        BidPrefix::new([seed; 8])
    }

    #[test]
    fn frame_header_round_trip() {

        let mut frame = Frame::new(MIN_MTU);
        frame.write_sender(SidPrefix::new([1, 2, 3, 4, 5, 6]));
        frame.write_counter(0x1234);

        assert_eq!(frame.len(), FRAME_HEADER_LEN);
        assert_eq!(&frame.slice()[..6], &[1, 2, 3, 4, 5, 6]);

        let header = FrameHeader::read(frame.slice()).unwrap();
        assert_eq!(header.sender, SidPrefix::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(header.counter, 0x1234);
        assert!(!header.retransmission);

    }

    #[test]
    fn counter_retransmission_bit() {

        let mut frame = Frame::new(MIN_MTU);
        // The retransmission bit is masked away on write.
        frame.write_counter(0xFFFF);
        let header = FrameHeader::read(frame.slice()).unwrap();
        assert_eq!(header.counter, 0x7FFF);
        assert!(!header.retransmission);

        // But decoded when a relay set it.
        let mut raw = frame.slice().to_vec();
        raw[7] |= 0x80;
        let header = FrameHeader::read(&raw).unwrap();
        assert_eq!(header.counter, 0x7FFF);
        assert!(header.retransmission);

    }

    #[test]
    fn header_too_short() {
        assert_eq!(FrameHeader::read(&[0; 7]), Err(FrameError::TooShort(7)));
    }

    #[test]
    fn bar_round_trip() {

        let bar = Bar {
            bid_prefix: bid_prefix(0xAB),
            version: Version::new(0x1_0000_1234),
            recipient: RecipientPrefix::new([9, 8, 7, 6]),
        };

        let mut raw = Vec::new();
        bar.write(&mut raw).unwrap();
        assert_eq!(raw.len(), BAR_LEN);
        assert_eq!(raw[0], b'B');

        let records: Vec<_> = RecordReader::new(&raw).collect();
        assert_eq!(records, vec![Ok(Record::Bar(bar))]);

    }

    #[test]
    fn small_piece_end_of_item() {

        // Maximum payload, small offset, body, end of item.
        let piece = Piece {
            bid_prefix: bid_prefix(0x11),
            version: Version::new(500),
            is_manifest: false,
            start_offset: 0x12345,
            end_of_item: true,
            data: vec![0xCC; 0x7FF],
        };

        let mut raw = Vec::new();
        piece.write(&mut raw).unwrap();
        assert_eq!(raw[0], 0x71);  // 'q'
        assert_eq!(piece.encoded_len(), PIECE_HEADER_LEN + 0x7FF);

        let compound = u32::from_le_bytes(raw[17..21].try_into().unwrap());
        assert_eq!(compound, 0x7FF1_2345);

        let records: Vec<_> = RecordReader::new(&raw).collect();
        assert_eq!(records, vec![Ok(Record::Piece(piece))]);

    }

    #[test]
    fn large_piece_offset_extension() {

        let piece = Piece {
            bid_prefix: bid_prefix(0x22),
            version: Version::new(0x2_0000_0000),
            is_manifest: true,
            start_offset: 0x10_0000,
            end_of_item: false,
            data: vec![0xEE; 16],
        };

        let mut raw = Vec::new();
        piece.write(&mut raw).unwrap();
        assert_eq!(raw[0], 0x50);  // 'P'
        assert_eq!(piece.encoded_len(), PIECE_HEADER_LARGE_LEN + 16);

        // Low 20 bits are zero, the extension carries the single high bit.
        let compound = u32::from_le_bytes(raw[17..21].try_into().unwrap());
        assert_eq!(compound & 0xF_FFFF, 0);
        assert_eq!(compound & 0x8000_0000, 0x8000_0000);
        let ext = u16::from_le_bytes(raw[21..23].try_into().unwrap());
        assert_eq!(ext, 0x0001);

        let records: Vec<_> = RecordReader::new(&raw).collect();
        assert_eq!(records, vec![Ok(Record::Piece(piece))]);

    }

    #[test]
    fn piece_round_trip_offsets() {

        // Offsets across the small/large boundary and at the representable
        // limit, with both flags.
        let offsets = [0, 1, 63, 0xF_FFFF, 0x10_0000, 0x1234_5678, MAX_START_OFFSET];

        for &start_offset in &offsets {
            for end_of_item in [false, true] {
                for is_manifest in [false, true] {

                    let piece = Piece {
                        bid_prefix: bid_prefix(0x33),
                        version: Version::new(42),
                        is_manifest,
                        start_offset,
                        end_of_item,
                        data: vec![0x5A; 100],
                    };

                    let mut raw = Vec::new();
                    piece.write(&mut raw).unwrap();
                    let records: Vec<_> = RecordReader::new(&raw).collect();
                    assert_eq!(records, vec![Ok(Record::Piece(piece))]);

                }
            }
        }

    }

    #[test]
    fn unknown_tag_surfaces_prefix() {

        let bar = Bar {
            bid_prefix: bid_prefix(0x44),
            version: Version::new(7),
            recipient: RecipientPrefix::BROADCAST,
        };

        let mut raw = Vec::new();
        bar.write(&mut raw).unwrap();
        raw.push(b'Z');
        raw.extend_from_slice(&[0; 30]);

        let records: Vec<_> = RecordReader::new(&raw).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Ok(Record::Bar(bar)));
        assert_eq!(records[1], Err(RecordError::UnknownTag(b'Z')));

    }

    #[test]
    fn truncated_piece() {

        let piece = Piece {
            bid_prefix: bid_prefix(0x55),
            version: Version::new(7),
            is_manifest: false,
            start_offset: 0,
            end_of_item: false,
            data: vec![1, 2, 3, 4],
        };

        let mut raw = Vec::new();
        piece.write(&mut raw).unwrap();
        raw.truncate(raw.len() - 2);

        let records: Vec<_> = RecordReader::new(&raw).collect();
        assert_eq!(records, vec![Err(RecordError::Truncated)]);

    }

    #[test]
    fn frame_appends_under_mtu() {

        let mut frame = Frame::new(MIN_MTU);
        assert_eq!(frame.free(), MIN_MTU - FRAME_HEADER_LEN);

        let bar = Bar {
            bid_prefix: bid_prefix(0x66),
            version: Version::new(1),
            recipient: RecipientPrefix::BROADCAST,
        };

        frame.put_bar(&bar);
        frame.put_bar(&bar);
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 2 * BAR_LEN);
        assert!(frame.free() < BAR_LEN);

        let records: Vec<_> = RecordReader::of_frame(frame.slice()).collect();
        assert_eq!(records, vec![Ok(Record::Bar(bar.clone())), Ok(Record::Bar(bar))]);

    }

}
