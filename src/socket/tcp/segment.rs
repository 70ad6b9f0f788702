use core::fmt;
use heapless::Vec;

use crate::config::{TCP_MAX_ADVERTISED_SACK_RANGES, TCP_MAX_SEGMENT_COUNT};
use crate::storage::{Full, Handle, Slab, Slot};
use crate::time::Instant;
use crate::wire::{SackRange, TcpSeqNumber};

/// Storage for one segment descriptor, as handed to [Window::new](super::Window::new).
pub type SegmentSlot = Slot<Segment>;

/// One contiguous range of sequence space that was sent and not yet acknowledged, or
/// received out of order and not yet delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: TcpSeqNumber,
    pub length: u32,
    /// Covered by a SACK block. Only the cumulative ACK frees the segment.
    pub is_acked: bool,
    pub retransmit_count: u32,
    pub last_sent_at: Instant,
}

impl Segment {
    pub(super) fn new(start: TcpSeqNumber, length: u32, now: Instant) -> Segment {
        Segment {
            start,
            length,
            is_acked: false,
            retransmit_count: 0,
            last_sent_at: now,
        }
    }

    /// Sequence number just past the last octet.
    pub fn end(&self) -> TcpSeqNumber {
        self.start + self.length as usize
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())?;
        if self.is_acked {
            write!(f, " sacked")?;
        }
        if self.retransmit_count > 0 {
            write!(f, " rtx={}", self.retransmit_count)?;
        }
        Ok(())
    }
}

/// What a cumulative ACK released from the transmit list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct Released {
    pub bytes: usize,
    pub segments: usize,
    /// The segment the ACK retired exactly, i.e. the one ending at the ACK number.
    pub retiring: Option<Segment>,
    /// Some released segment was sent more than once.
    pub retransmitted: bool,
}

/// The three ordered segment collections of a connection.
///
/// Descriptors live in a slab and the lists hold handles into it:
///  * the wait queue, received out-of-order segments sorted by start;
///  * the transmit list, sent segments sorted by start, covering
///    `[send_unacknowledged, send_next)` without gaps;
///  * the retransmit priority queue, the transmit segments not covered by SACK,
///    most urgent first.
#[derive(Debug)]
pub(super) struct SegmentLists<'a> {
    segments: Slab<'a, Segment>,
    tx_list: Vec<Handle, TCP_MAX_SEGMENT_COUNT>,
    priority_queue: Vec<Handle, TCP_MAX_SEGMENT_COUNT>,
    wait_queue: Vec<Handle, TCP_MAX_SEGMENT_COUNT>,
}

/// Outcome of holding an out-of-order segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Hold {
    Queued,
    /// Merged into the held data it overlaps or touches.
    Merged,
    Duplicate,
}

impl<'a> SegmentLists<'a> {
    pub fn new<S>(storage: S) -> SegmentLists<'a>
    where
        S: Into<managed::ManagedSlice<'a, SegmentSlot>>,
    {
        SegmentLists {
            segments: Slab::new(storage),
            tx_list: Vec::new(),
            priority_queue: Vec::new(),
            wait_queue: Vec::new(),
        }
    }

    /// Release every descriptor of every list.
    pub fn clear(&mut self) {
        self.tx_list.clear();
        self.priority_queue.clear();
        self.wait_queue.clear();
        self.segments.clear();
    }

    pub fn get(&self, handle: Handle) -> Option<&Segment> {
        self.segments.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Segment> {
        self.segments.get_mut(handle)
    }

    /// Number of descriptors alive in any list.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn tx_is_empty(&self) -> bool {
        self.tx_list.is_empty()
    }

    /// Iterate over the transmit list in sequence order.
    pub fn tx_iter(&self) -> impl Iterator<Item = (Handle, &Segment)> + '_ {
        self.tx_list
            .iter()
            .filter_map(|&handle| Some((handle, self.segments.get(handle)?)))
    }

    /// Append a freshly transmitted segment to the transmit list and the tail of the
    /// priority queue.
    pub fn push_transmitted(&mut self, segment: Segment) -> Result<Handle, Full> {
        if self.tx_list.is_full() || self.priority_queue.is_full() {
            return Err(Full);
        }
        let handle = self.segments.insert(segment)?;
        // Both lists were checked for room above.
        let _ = self.tx_list.push(handle);
        let _ = self.priority_queue.push(handle);
        Ok(handle)
    }

    /// Mark a transmit segment as covered by SACK and drop it from the priority queue.
    ///
    /// Returns whether the segment was newly marked.
    pub fn mark_sacked(&mut self, handle: Handle) -> bool {
        let Some(segment) = self.segments.get_mut(handle) else {
            return false;
        };
        if segment.is_acked {
            return false;
        }
        segment.is_acked = true;
        self.pq_remove(handle);
        true
    }

    /// Release the transmit segments fully below `ack`, and trim a segment `ack` falls into.
    pub fn release_acknowledged(&mut self, ack: TcpSeqNumber) -> Released {
        let mut released = Released::default();
        while let Some(&handle) = self.tx_list.first() {
            let Some(&segment) = self.segments.get(handle) else {
                break;
            };
            if segment.end().after(ack) {
                if segment.start.before(ack) {
                    let acked = ack.distance(segment.start) as u32;
                    if let Some(segment) = self.segments.get_mut(handle) {
                        segment.start = ack;
                        segment.length -= acked;
                    }
                    released.bytes += acked as usize;
                }
                break;
            }
            self.tx_list.remove(0);
            self.pq_remove(handle);
            self.segments.remove(handle);
            released.bytes += segment.len();
            released.segments += 1;
            released.retransmitted |= segment.retransmit_count > 0;
            if segment.end() == ack {
                released.retiring = Some(segment);
            }
        }
        released
    }

    pub fn pq_head(&self) -> Option<Handle> {
        self.priority_queue.first().copied()
    }

    pub fn pq_contains(&self, handle: Handle) -> bool {
        self.priority_queue.contains(&handle)
    }

    /// Iterate over the priority queue, most urgent first.
    pub fn pq_iter(&self) -> impl Iterator<Item = (Handle, &Segment)> + '_ {
        self.priority_queue
            .iter()
            .filter_map(|&handle| Some((handle, self.segments.get(handle)?)))
    }

    fn pq_remove(&mut self, handle: Handle) -> bool {
        match self.priority_queue.iter().position(|&h| h == handle) {
            Some(index) => {
                self.priority_queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Put a transmit segment at the head of the priority queue.
    pub fn pq_move_to_front(&mut self, handle: Handle) {
        self.pq_remove(handle);
        // Room was just made, or the queue holds fewer handles than the transmit list.
        let _ = self.priority_queue.insert(0, handle);
    }

    /// Put a transmit segment at the tail of the priority queue.
    pub fn pq_move_to_back(&mut self, handle: Handle) {
        self.pq_remove(handle);
        let _ = self.priority_queue.push(handle);
    }

    pub fn wait_is_empty(&self) -> bool {
        self.wait_queue.is_empty()
    }

    /// Iterate over the wait queue in sequence order.
    pub fn wait_iter(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.wait_queue
            .iter()
            .filter_map(|&handle| self.segments.get(handle))
    }

    /// Hold an out-of-order segment until the data before it arrives.
    ///
    /// Data overlapping or touching held segments is merged with them, so held
    /// segments stay disjoint and a retransmitted overlap never takes a descriptor.
    pub fn hold(&mut self, start: TcpSeqNumber, length: u32, now: Instant) -> Result<Hold, Full> {
        let mut left = start;
        let mut right = start + length as usize;
        let mut merged_into: Option<usize> = None;
        let mut index = self.wait_queue.len();

        let mut i = 0;
        while i < self.wait_queue.len() {
            let handle = self.wait_queue[i];
            let Some(&segment) = self.segments.get(handle) else {
                i += 1;
                continue;
            };
            if right.before(segment.start) {
                index = i;
                break;
            }
            if segment.end().before(left) {
                i += 1;
                continue;
            }
            if merged_into.is_none()
                && SackRange::new(segment.start, segment.end()).covers(left, right.distance(left) as usize)
            {
                return Ok(Hold::Duplicate);
            }
            left = left.min(segment.start);
            right = right.max(segment.end());
            if merged_into.is_none() {
                merged_into = Some(i);
                i += 1;
            } else {
                // Bridged by the incoming data; folded into the first overlap.
                self.wait_queue.remove(i);
                self.segments.remove(handle);
            }
        }

        if let Some(i) = merged_into {
            if let Some(segment) = self.segments.get_mut(self.wait_queue[i]) {
                segment.start = left;
                segment.length = right.distance(left) as u32;
                segment.last_sent_at = now;
            }
            net_trace!("merged out-of-order data into [{}, {})", left, right);
            return Ok(Hold::Merged);
        }

        if self.wait_queue.is_full() {
            return Err(Full);
        }
        let handle = self.segments.insert(Segment::new(start, length, now))?;
        let _ = self.wait_queue.insert(index, handle);
        Ok(Hold::Queued)
    }

    /// Drop every held segment that is now contiguous with `receive_next`, returning the
    /// new `receive_next`.
    pub fn drain_contiguous(&mut self, mut receive_next: TcpSeqNumber) -> TcpSeqNumber {
        while let Some(&handle) = self.wait_queue.first() {
            let Some(&segment) = self.segments.get(handle) else {
                self.wait_queue.remove(0);
                continue;
            };
            if segment.start.after(receive_next) {
                break;
            }
            receive_next = receive_next.max(segment.end());
            self.wait_queue.remove(0);
            self.segments.remove(handle);
        }
        receive_next
    }

    /// The held data as merged blocks, lowest first.
    pub fn wait_ranges(&self) -> Vec<SackRange, TCP_MAX_ADVERTISED_SACK_RANGES> {
        let mut ranges: Vec<SackRange, TCP_MAX_ADVERTISED_SACK_RANGES> = Vec::new();
        for segment in self.wait_iter() {
            if let Some(last) = ranges.last_mut() {
                if !segment.start.after(last.right) {
                    last.right = last.right.max(segment.end());
                    continue;
                }
            }
            if ranges.push(SackRange::new(segment.start, segment.end())).is_err() {
                break;
            }
        }
        ranges
    }

    /// Assert the structural invariants of all three lists.
    pub fn check_invariants(&self, send_unacknowledged: TcpSeqNumber, send_next: TcpSeqNumber) {
        debug_assert!(
            !send_next.before(send_unacknowledged),
            "send_next {} before send_unacknowledged {}",
            send_next,
            send_unacknowledged
        );
        debug_assert_eq!(
            self.tx_list.len() + self.wait_queue.len(),
            self.segments.len(),
            "descriptor owned by no list or by two lists"
        );

        let mut expected = send_unacknowledged;
        for &handle in self.tx_list.iter() {
            let segment = self.segments.get(handle);
            debug_assert!(segment.is_some(), "dangling handle {} in transmit list", handle);
            if let Some(segment) = segment {
                debug_assert_eq!(segment.start, expected, "transmit list not contiguous");
                expected = segment.end();
            }
            debug_assert!(
                !self.wait_queue.contains(&handle),
                "segment {} in transmit list and wait queue",
                handle
            );
        }
        debug_assert_eq!(expected, send_next, "transmit list does not end at send_next");

        for (i, &handle) in self.priority_queue.iter().enumerate() {
            debug_assert!(
                self.tx_list.contains(&handle),
                "segment {} queued for retransmit but not in transmit list",
                handle
            );
            debug_assert!(
                !self.priority_queue[i + 1..].contains(&handle),
                "segment {} queued for retransmit twice",
                handle
            );
            debug_assert!(
                !self.segments.get(handle).is_some_and(|s| s.is_acked),
                "SACKed segment {} queued for retransmit",
                handle
            );
        }

        let mut previous: Option<TcpSeqNumber> = None;
        for segment in self.wait_iter() {
            if let Some(previous) = previous {
                debug_assert!(!segment.start.before(previous), "wait queue overlaps or out of order");
            }
            previous = Some(segment.end());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lists_with<'s>(storage: &'s mut [SegmentSlot], ranges: &[(u32, u32)]) -> SegmentLists<'s> {
        let mut lists = SegmentLists::new(storage);
        for &(start, end) in ranges {
            lists
                .push_transmitted(Segment::new(
                    TcpSeqNumber(start),
                    end - start,
                    Instant::from_millis(0),
                ))
                .unwrap();
        }
        lists
    }

    #[test]
    fn test_push_and_release() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(100, 200), (200, 300), (300, 400)]);
        lists.check_invariants(TcpSeqNumber(100), TcpSeqNumber(400));

        let released = lists.release_acknowledged(TcpSeqNumber(300));
        assert_eq!(released.bytes, 200);
        assert_eq!(released.segments, 2);
        assert_eq!(released.retiring.map(|s| s.start), Some(TcpSeqNumber(200)));
        assert_eq!(lists.segment_count(), 1);
        lists.check_invariants(TcpSeqNumber(300), TcpSeqNumber(400));
    }

    #[test]
    fn test_release_trims_partial_segment() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(100, 200), (200, 300)]);

        let released = lists.release_acknowledged(TcpSeqNumber(250));
        assert_eq!(released.bytes, 150);
        assert_eq!(released.segments, 1);
        assert_eq!(released.retiring, None);

        let (_, head) = lists.tx_iter().next().unwrap();
        assert_eq!(head.start, TcpSeqNumber(250));
        assert_eq!(head.len(), 50);
        lists.check_invariants(TcpSeqNumber(250), TcpSeqNumber(300));
    }

    #[test]
    fn test_release_retires_on_exact_end() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(100, 200), (200, 300)]);

        let released = lists.release_acknowledged(TcpSeqNumber(200));
        assert_eq!(released.segments, 1);
        assert_eq!(released.retiring.map(|s| s.start), Some(TcpSeqNumber(100)));
        assert!(!released.retransmitted);
        lists.check_invariants(TcpSeqNumber(200), TcpSeqNumber(300));
    }

    #[test]
    fn test_release_reports_retransmitted() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(100, 200), (200, 300)]);
        let (head, _) = lists.tx_iter().next().unwrap();
        lists.get_mut(head).unwrap().retransmit_count = 1;

        let released = lists.release_acknowledged(TcpSeqNumber(300));
        assert_eq!(released.retiring.map(|s| s.retransmit_count), Some(0));
        assert!(released.retransmitted);
    }

    #[test]
    fn test_push_exhausted() {
        let mut storage = [SegmentSlot::EMPTY; 1];
        let mut lists = lists_with(&mut storage, &[(0, 10)]);
        let more = Segment::new(TcpSeqNumber(10), 10, Instant::from_millis(0));
        assert_eq!(lists.push_transmitted(more), Err(Full));
        assert_eq!(lists.segment_count(), 1);
    }

    #[test]
    fn test_sacked_leaves_priority_queue() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(0, 10), (10, 20)]);
        let (second, _) = lists.tx_iter().nth(1).unwrap();

        assert!(lists.mark_sacked(second));
        assert!(!lists.mark_sacked(second));
        assert!(!lists.pq_contains(second));
        assert_eq!(lists.tx_iter().count(), 2);
        lists.check_invariants(TcpSeqNumber(0), TcpSeqNumber(20));
    }

    #[test]
    fn test_priority_queue_moves() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(0, 10), (10, 20), (20, 30)]);
        let handles: std::vec::Vec<Handle> = lists.tx_iter().map(|(h, _)| h).collect();

        lists.pq_move_to_back(handles[0]);
        assert_eq!(lists.pq_head(), Some(handles[1]));
        lists.pq_move_to_front(handles[2]);
        let order: std::vec::Vec<Handle> = lists.pq_iter().map(|(h, _)| h).collect();
        assert_eq!(order, [handles[2], handles[1], handles[0]]);
        lists.check_invariants(TcpSeqNumber(0), TcpSeqNumber(30));
    }

    #[test]
    fn test_hold_and_drain() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = SegmentLists::new(&mut storage[..]);
        let now = Instant::from_millis(0);

        assert_eq!(lists.hold(TcpSeqNumber(300), 100, now), Ok(Hold::Queued));
        assert_eq!(lists.hold(TcpSeqNumber(150), 50, now), Ok(Hold::Queued));
        assert_eq!(lists.hold(TcpSeqNumber(320), 30, now), Ok(Hold::Duplicate));
        lists.check_invariants(TcpSeqNumber(0), TcpSeqNumber(0));

        assert_eq!(lists.drain_contiguous(TcpSeqNumber(100)), TcpSeqNumber(100));
        assert_eq!(lists.drain_contiguous(TcpSeqNumber(160)), TcpSeqNumber(200));
        assert_eq!(lists.segment_count(), 1);
        assert_eq!(lists.drain_contiguous(TcpSeqNumber(300)), TcpSeqNumber(400));
        assert!(lists.wait_is_empty());
        assert_eq!(lists.segment_count(), 0);
    }

    #[test]
    fn test_hold_merges_overlap() {
        let mut storage = [SegmentSlot::EMPTY; 2];
        let mut lists = SegmentLists::new(&mut storage[..]);
        let now = Instant::from_millis(0);

        assert_eq!(lists.hold(TcpSeqNumber(100), 100, now), Ok(Hold::Queued));
        assert_eq!(lists.hold(TcpSeqNumber(100), 200, now), Ok(Hold::Merged));
        assert_eq!(lists.segment_count(), 1);
        assert_eq!(lists.hold(TcpSeqNumber(500), 10, now), Ok(Hold::Queued));
        assert_eq!(lists.segment_count(), 2);

        let held: std::vec::Vec<(TcpSeqNumber, usize)> =
            lists.wait_iter().map(|s| (s.start, s.len())).collect();
        assert_eq!(held, [(TcpSeqNumber(100), 200), (TcpSeqNumber(500), 10)]);
        lists.check_invariants(TcpSeqNumber(0), TcpSeqNumber(0));
    }

    #[test]
    fn test_hold_bridges_segments() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = SegmentLists::new(&mut storage[..]);
        let now = Instant::from_millis(0);

        lists.hold(TcpSeqNumber(100), 100, now).unwrap();
        lists.hold(TcpSeqNumber(300), 100, now).unwrap();
        lists.hold(TcpSeqNumber(600), 10, now).unwrap();
        assert_eq!(lists.hold(TcpSeqNumber(150), 200, now), Ok(Hold::Merged));
        assert_eq!(lists.segment_count(), 2);
        // Touching data is merged too.
        assert_eq!(lists.hold(TcpSeqNumber(400), 200, now), Ok(Hold::Merged));
        assert_eq!(lists.segment_count(), 1);
        assert_eq!(
            lists.wait_ranges().as_slice(),
            &[SackRange::new(TcpSeqNumber(100), TcpSeqNumber(610))]
        );
        lists.check_invariants(TcpSeqNumber(0), TcpSeqNumber(0));
    }

    #[test]
    fn test_wait_ranges_merge() {
        let mut storage = [SegmentSlot::EMPTY; 8];
        let mut lists = SegmentLists::new(&mut storage[..]);
        let now = Instant::from_millis(0);
        for (start, len) in [(500, 100), (200, 100), (300, 50), (800, 10)] {
            lists.hold(TcpSeqNumber(start), len, now).unwrap();
        }
        assert_eq!(
            lists.wait_ranges().as_slice(),
            &[
                SackRange::new(TcpSeqNumber(200), TcpSeqNumber(350)),
                SackRange::new(TcpSeqNumber(500), TcpSeqNumber(600)),
                SackRange::new(TcpSeqNumber(800), TcpSeqNumber(810)),
            ]
        );
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut storage = [SegmentSlot::EMPTY; 4];
        let mut lists = lists_with(&mut storage, &[(0, 10), (10, 20)]);
        lists.hold(TcpSeqNumber(1000), 5, Instant::from_millis(0)).unwrap();
        let (handle, _) = lists.tx_iter().next().unwrap();

        lists.clear();
        assert_eq!(lists.segment_count(), 0);
        assert!(lists.tx_is_empty());
        assert!(lists.wait_is_empty());
        assert_eq!(lists.pq_head(), None);
        assert_eq!(lists.get(handle), None);
    }
}
