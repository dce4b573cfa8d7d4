//! Coalescing container of received byte ranges.
//!
//! Pieces of a bundle item arrive out of order, duplicated and overlapping.
//! The list keeps one owned buffer per maximal contiguous range, coalescing
//! on insertion, so that coverage queries and final assembly stay trivial.

use std::collections::BTreeMap;
use std::fmt;


/// An ordered set of disjoint, non-touching byte ranges with their data,
/// keyed by start offset.
#[derive(Clone, Default)]
pub struct SegmentList {
    /// Ranges keyed by start offset; no two entries overlap or touch.
    segments: BTreeMap<u64, Vec<u8>>,
}

impl SegmentList {

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct ranges held.
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of bytes held across all ranges.
    pub fn covered_bytes(&self) -> u64 {
        self.segments.values().map(|d| d.len() as u64).sum()
    }

    /// The lowest range, as `(start, length)`.
    pub fn first(&self) -> Option<(u64, u64)> {
        self.segments.iter().next().map(|(&s, d)| (s, d.len() as u64))
    }

    /// Iterate ranges in ascending start order, as `(start, data)`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.segments.iter().map(|(&s, d)| (s, &d[..]))
    }

    /// Length of the contiguous prefix held from offset zero, 0 if the
    /// first byte is still missing.
    pub fn contiguous_from_zero(&self) -> u64 {
        match self.first() {
            Some((0, len)) => len,
            _ => 0,
        }
    }

    /// Borrow the bytes of the contiguous prefix held from offset zero.
    pub fn prefix_bytes(&self) -> &[u8] {
        match self.segments.iter().next() {
            Some((&0, data)) => &data[..],
            _ => &[],
        }
    }

    /// Return true if every byte of `[0, len)` is held.
    pub fn is_complete(&self, len: u64) -> bool {
        self.contiguous_from_zero() >= len
    }

    /// Return the assembled bytes of `[0, len)` if completely held.
    pub fn assemble(&self, len: u64) -> Option<Vec<u8>> {
        if self.is_complete(len) {
            Some(self.prefix_bytes()[..len as usize].to_vec())
        } else {
            None
        }
    }

    /// Drop all ranges.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Insert a received range, coalescing it with every existing range it
    /// overlaps or touches. Where ranges overlap, the bytes already held
    /// win; for content-addressed bundles both copies are identical anyway,
    /// the rule only makes the container deterministic.
    pub fn insert(&mut self, start: u64, data: Vec<u8>) {

        if data.is_empty() {
            return;
        }

        let mut start = start;
        let mut data = data;

        // Absorb neighbours from the top down. Existing ranges are mutually
        // disjoint, so the candidate with the highest start at or below our
        // end is the only one that can still overlap or touch; once it no
        // longer does, nothing below it can either.
        loop {

            let end = start + data.len() as u64;
            let candidate = self.segments
                .range(..=end)
                .next_back()
                .map(|(&s, d)| (s, d.len() as u64));

            match candidate {
                Some((s, len)) if s + len >= start => {
                    let held = self.segments.remove(&s).unwrap();
                    (start, data) = merge(start, data, s, held);
                }
                _ => break,
            }

        }

        self.segments.insert(start, data);

    }

}

/// Merge an incoming range with one already held, the held bytes winning
/// in any overlap.
fn merge(new_start: u64, new_data: Vec<u8>, held_start: u64, held_data: Vec<u8>) -> (u64, Vec<u8>) {

    let new_end = new_start + new_data.len() as u64;
    let held_end = held_start + held_data.len() as u64;

    let start = new_start.min(held_start);
    let end = new_end.max(held_end);

    let mut buf = vec![0; (end - start) as usize];
    buf[(new_start - start) as usize..][..new_data.len()].copy_from_slice(&new_data);
    buf[(held_start - start) as usize..][..held_data.len()].copy_from_slice(&held_data);

    (start, buf)

}

impl fmt::Debug for SegmentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (start, data) in self.iter() {
            list.entry(&format_args!("[{}, {})", start, start + data.len() as u64));
        }
        list.finish()
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    fn ranges(list: &SegmentList) -> Vec<(u64, u64)> {
        list.iter().map(|(s, d)| (s, d.len() as u64)).collect()
    }

    #[test]
    fn overlap_keeps_held_bytes() {

        // The two inserts overlap on [200, 210); the earlier insert's bytes
        // survive for that range.
        let mut list = SegmentList::new();
        list.insert(200, vec![b'b'; 50]);
        list.insert(150, vec![b'a'; 60]);

        assert_eq!(ranges(&list), vec![(150, 100)]);
        let (_, data) = list.iter().next().unwrap();
        assert_eq!(&data[..50], &[b'a'; 50][..]);
        assert_eq!(&data[50..], &[b'b'; 50][..]);

    }

    #[test]
    fn coverage_preserved() {

        // Out of order, duplicated and overlapping inserts; afterwards a
        // byte is covered iff some insert covered it, exactly once.
        let inputs: &[(u64, u64)] = &[(300, 100), (0, 64), (64, 64), (350, 200), (40, 30), (300, 100)];

        let mut list = SegmentList::new();
        for &(start, len) in inputs {
            list.insert(start, vec![0xAA; len as usize]);
        }

        for x in 0..700u64 {
            let input_covered = inputs.iter().any(|&(s, l)| x >= s && x < s + l);
            let held = list.iter()
                .filter(|&(s, d)| x >= s && x < s + d.len() as u64)
                .count();
            assert_eq!(held, usize::from(input_covered), "byte {x}");
        }

        // Disjoint and non-touching.
        let ranges = ranges(&list);
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 < pair[1].0);
        }

    }

    #[test]
    fn touching_ranges_coalesce() {
        let mut list = SegmentList::new();
        list.insert(64, vec![2; 64]);
        list.insert(0, vec![1; 64]);
        assert_eq!(ranges(&list), vec![(0, 128)]);
        assert_eq!(list.contiguous_from_zero(), 128);
    }

    #[test]
    fn spanning_insert_absorbs_several() {
        let mut list = SegmentList::new();
        list.insert(0, vec![1; 10]);
        list.insert(20, vec![2; 10]);
        list.insert(40, vec![3; 10]);
        list.insert(5, vec![4; 40]);
        assert_eq!(ranges(&list), vec![(0, 50)]);
        let (_, data) = list.iter().next().unwrap();
        assert_eq!(&data[..10], &[1; 10][..]);
        assert_eq!(&data[20..30], &[2; 10][..]);
        assert_eq!(&data[40..50], &[3; 10][..]);
        assert_eq!(&data[10..20], &[4; 10][..]);
    }

    #[test]
    fn assembly() {

        let mut list = SegmentList::new();
        assert_eq!(list.assemble(0), Some(Vec::new()));
        assert_eq!(list.assemble(10), None);

        list.insert(5, vec![2; 5]);
        assert_eq!(list.contiguous_from_zero(), 0);
        assert_eq!(list.assemble(10), None);

        list.insert(0, vec![1; 5]);
        assert_eq!(list.assemble(10), Some(vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]));
        assert_eq!(list.covered_bytes(), 10);

    }

    #[test]
    fn empty_data_ignored() {
        let mut list = SegmentList::new();
        list.insert(100, Vec::new());
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
    }

}
