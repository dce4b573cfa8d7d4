//! Identifier and version types for bundles and subscribers.

use std::fmt;

use crate::util::BytesFmt;


/// Full length of a bundle identifier.
pub const BID_LEN: usize = 32;
/// Length of the bundle identifier prefix travelling on the wire.
pub const BID_PREFIX_LEN: usize = 8;
/// Full length of a subscriber identifier.
pub const SID_LEN: usize = 32;
/// Length of the subscriber identifier prefix travelling on the wire.
pub const SID_PREFIX_LEN: usize = 6;
/// Length of the recipient prefix carried in announcements.
pub const RECIPIENT_PREFIX_LEN: usize = 4;


/// A bundle identifier, an opaque 32-byte content address. Only its 8-byte
/// prefix is ever sent on the wire, the full identifier is kept locally.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bid([u8; BID_LEN]);

impl Bid {

    #[inline]
    pub const fn new(raw: [u8; BID_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; BID_LEN] {
        &self.0
    }

    /// Return the wire prefix of this identifier.
    #[inline]
    pub fn prefix(&self) -> BidPrefix {
        let mut raw = [0; BID_PREFIX_LEN];
        raw.copy_from_slice(&self.0[..BID_PREFIX_LEN]);
        BidPrefix(raw)
    }

    /// Return the uppercase hexadecimal representation, as used in the
    /// store's request paths.
    pub fn hex(&self) -> String {
        format!("{:X}", BytesFmt(&self.0))
    }

}

impl fmt::Debug for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bid({}..)", BytesFmt(&self.0[..BID_PREFIX_LEN]))
    }
}


/// The 8-byte wire prefix of a [`Bid`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BidPrefix([u8; BID_PREFIX_LEN]);

impl BidPrefix {

    #[inline]
    pub const fn new(raw: [u8; BID_PREFIX_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; BID_PREFIX_LEN] {
        &self.0
    }

}

impl fmt::Debug for BidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BidPrefix({}*)", BytesFmt(&self.0))
    }
}

impl fmt::Display for BidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", BytesFmt(&self.0))
    }
}


/// A subscriber identifier, the 32-byte identity of a node or of a bundle's
/// recipient.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid([u8; SID_LEN]);

impl Sid {

    #[inline]
    pub const fn new(raw: [u8; SID_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SID_LEN] {
        &self.0
    }

    /// Return the 6-byte identity prefix used in frame headers.
    #[inline]
    pub fn prefix(&self) -> SidPrefix {
        let mut raw = [0; SID_PREFIX_LEN];
        raw.copy_from_slice(&self.0[..SID_PREFIX_LEN]);
        SidPrefix(raw)
    }

    /// Return the 4-byte prefix used to address announcements.
    #[inline]
    pub fn recipient_prefix(&self) -> RecipientPrefix {
        let mut raw = [0; RECIPIENT_PREFIX_LEN];
        raw.copy_from_slice(&self.0[..RECIPIENT_PREFIX_LEN]);
        RecipientPrefix(raw)
    }

}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({}..)", BytesFmt(&self.0[..SID_PREFIX_LEN]))
    }
}


/// The 6-byte wire prefix of a [`Sid`], identifying the sender of a frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidPrefix([u8; SID_PREFIX_LEN]);

impl SidPrefix {

    #[inline]
    pub const fn new(raw: [u8; SID_PREFIX_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SID_PREFIX_LEN] {
        &self.0
    }

    /// Return the 2-byte short form kept in recent-sender tables.
    #[inline]
    pub fn short(&self) -> [u8; 2] {
        [self.0[0], self.0[1]]
    }

}

impl fmt::Debug for SidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SidPrefix({}*)", BytesFmt(&self.0))
    }
}

impl fmt::Display for SidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", BytesFmt(&self.0))
    }
}


/// The 4-byte recipient prefix carried in announcements, all-zero for
/// broadcast bundles.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipientPrefix([u8; RECIPIENT_PREFIX_LEN]);

impl RecipientPrefix {

    /// The broadcast address.
    pub const BROADCAST: Self = Self([0; RECIPIENT_PREFIX_LEN]);

    #[inline]
    pub const fn new(raw: [u8; RECIPIENT_PREFIX_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; RECIPIENT_PREFIX_LEN] {
        &self.0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

}

impl fmt::Debug for RecipientPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("RecipientPrefix(broadcast)")
        } else {
            write!(f, "RecipientPrefix({}*)", BytesFmt(&self.0))
        }
    }
}


/// A bundle version. Values below 2^32 identify journalled bundles, whose
/// body is append-only and whose version equals the current body length in
/// bytes; for those the value doubles as a received-byte watermark when a
/// peer announces it. Values at or above 2^32 identify ordinary bundles,
/// where the version is a monotonic timestamp-like counter.
///
/// The two roles are kept apart through [`Self::is_journalled`] and
/// [`Self::journal_length`] rather than by interpreting the raw integer at
/// the point of use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {

    /// First version value that no longer denotes a journalled bundle.
    pub const JOURNAL_LIMIT: u64 = 1 << 32;

    #[inline]
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    /// Get the underlying real value of this version.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Return true if this version denotes a journalled (append-only) bundle.
    #[inline]
    pub const fn is_journalled(self) -> bool {
        self.0 < Self::JOURNAL_LIMIT
    }

    /// For a journalled bundle, the current body length in bytes, which is
    /// also the byte watermark implied when a peer announces this version.
    #[inline]
    pub const fn journal_length(self) -> Option<u64> {
        if self.is_journalled() {
            Some(self.0)
        } else {
            None
        }
    }

}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_journalled() {
            write!(f, "Version(journal {})", self.0)
        } else {
            write!(f, "Version({})", self.0)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
