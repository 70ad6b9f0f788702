// SACK handling follows RFC 2018. Loss recovery is the plain RFC 5681 rule of
// three duplicate ACKs; SACK information only decides what is still worth resending.

use heapless::Vec;

use super::segment::SegmentLists;
use crate::config::TCP_MAX_SEGMENT_COUNT;
use crate::storage::Handle;
use crate::time::Instant;
use crate::wire::{SackRange, TcpSeqNumber};

/// What applying the SACK ranges of one incoming segment changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SackSummary {
    /// Ranges that passed validation.
    pub accepted: usize,
    /// Ranges discarded as inverted, stale or beyond `send_next`.
    pub rejected: usize,
    /// Octets newly marked as SACKed.
    pub newly_acked: usize,
    /// Highest right edge among the accepted ranges.
    pub highest: Option<TcpSeqNumber>,
    /// An unacknowledged segment sits below a SACKed one.
    pub has_gap: bool,
}

/// Apply SACK ranges to the transmit list.
///
/// Every transmit segment lying entirely inside an accepted range is flagged as
/// SACKed and leaves the retransmit priority queue. Segments are never released
/// here; only the cumulative ACK does that.
pub(super) fn reconcile(
    lists: &mut SegmentLists,
    ranges: &[SackRange],
    send_unacknowledged: TcpSeqNumber,
    send_next: TcpSeqNumber,
) -> SackSummary {
    let mut summary = SackSummary::default();

    for range in ranges {
        if let Err(err) = range.check(send_unacknowledged, send_next) {
            net_debug!("sack: ignoring {}: {}", range, err);
            summary.rejected += 1;
            continue;
        }
        summary.accepted += 1;
        summary.highest = Some(match summary.highest {
            Some(highest) => highest.max(range.right),
            None => range.right,
        });

        let mut covered: Vec<(Handle, usize), TCP_MAX_SEGMENT_COUNT> = Vec::new();
        for (handle, segment) in lists.tx_iter() {
            if !segment.is_acked && range.covers(segment.start, segment.len()) {
                // The transmit list never holds more than this many handles.
                let _ = covered.push((handle, segment.len()));
            }
        }
        for (handle, len) in covered {
            if lists.mark_sacked(handle) {
                summary.newly_acked += len;
            }
        }
    }

    let mut seen_unacked = false;
    for (_, segment) in lists.tx_iter() {
        if !segment.is_acked {
            seen_unacked = true;
        } else if seen_unacked {
            summary.has_gap = true;
            break;
        }
    }

    if summary.newly_acked > 0 {
        tcp_trace!(
            "sack: {} octets newly acked, highest edge {:?}",
            summary.newly_acked,
            summary.highest
        );
    }
    summary
}

/// Counter of consecutive duplicate ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DupAcks {
    count: u8,
    threshold: u8,
}

impl DupAcks {
    /// A `threshold` of zero disables fast retransmit.
    pub fn new(threshold: u8) -> DupAcks {
        DupAcks {
            count: 0,
            threshold,
        }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    /// Count one duplicate ACK. Returns true exactly when the threshold is reached.
    pub fn on_duplicate(&mut self) -> bool {
        let before = self.count;
        self.count = self.count.saturating_add(1);
        self.count != before && self.count == self.threshold
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Queue the earliest segment that is neither cumulatively acknowledged nor SACKed for
/// immediate resend.
///
/// The segment is counted as retransmitted now and moved to the head of the
/// priority queue.
pub(super) fn fast_retransmit(lists: &mut SegmentLists, now: Instant) -> Option<Handle> {
    let handle = lists
        .tx_iter()
        .find(|(_, segment)| !segment.is_acked)
        .map(|(handle, _)| handle)?;
    let segment = lists.get_mut(handle)?;
    segment.retransmit_count = segment.retransmit_count.saturating_add(1);
    segment.last_sent_at = now;
    net_debug!("sack: fast retransmit of {}", segment);
    lists.pq_move_to_front(handle);
    Some(handle)
}
