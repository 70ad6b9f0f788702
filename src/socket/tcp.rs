// Heads up! Before working on this file you should read, at least, RFC 793 and
// the parts of RFC 1122 that discuss TCP, as well as RFC 2018 for selective
// acknowledgements and RFC 6298 for the retransmission timer.
// Consult RFC 7414 when implementing a new feature.

use core::fmt;

use bitflags::bitflags;
use heapless::Vec;
use managed::ManagedSlice;

use crate::config::TCP_MAX_ADVERTISED_SACK_RANGES;
use crate::socket::PollAt;
use crate::storage::Handle;
use crate::time::{Duration, Instant};
use crate::wire::{
    self, MalformedOption, SackRange, TcpOptions, TcpRepr, TcpSeqNumber, emit_sack,
};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

mod connection;
mod rtte;
mod sack;
mod segment;

pub use self::connection::Connection;
pub use self::sack::SackSummary;
pub use self::segment::{Segment, SegmentSlot};

use self::rtte::{Limits, RttEstimator};
use self::sack::DupAcks;
use self::segment::{Hold, SegmentLists};

/// Largest window shift a peer may announce, per RFC 7323.
const MAX_WINDOW_SHIFT: u8 = 14;

/// Error returned by [`Window::send`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    /// The segment carries no sequence space.
    Empty,
    /// No segment descriptor is left to track the segment.
    Exhausted,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::Empty => write!(f, "empty segment"),
            SendError::Exhausted => write!(f, "segment descriptors exhausted"),
        }
    }
}

impl core::error::Error for SendError {}

/// Tunables of a connection's retransmission machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Duplicate ACKs that trigger a fast retransmit. Zero disables fast retransmit.
    pub dup_ack_threshold: u8,
    /// Factor the RTO is multiplied by on every retransmission timeout.
    pub backoff_multiplier: u32,
    /// Lowest smoothed RTT the estimator will accept.
    pub srtt_floor: Duration,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Octets past `receive_next` that out-of-order data is accepted for.
    pub rx_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        let limits = Limits::default();
        Config {
            dup_ack_threshold: 3,
            backoff_multiplier: limits.backoff_multiplier,
            srtt_floor: Duration::from_millis(limits.srtt_floor as u64),
            initial_rto: Duration::from_millis(limits.initial_rto as u64),
            min_rto: Duration::from_millis(limits.min_rto as u64),
            max_rto: Duration::from_millis(limits.max_rto as u64),
            rx_window: u16::MAX as u32,
        }
    }
}

impl Config {
    fn limits(&self) -> Limits {
        fn millis(duration: Duration) -> u32 {
            u32::try_from(duration.total_millis()).unwrap_or(u32::MAX)
        }
        Limits {
            srtt_floor: millis(self.srtt_floor),
            initial_rto: millis(self.initial_rto),
            min_rto: millis(self.min_rto),
            max_rto: millis(self.max_rto),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// The retransmission state of a connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    /// Nothing is outstanding.
    Idle,
    /// Data is outstanding and the retransmission timer runs.
    AwaitingAck,
    /// A segment was picked for fast retransmit and waits to be dispatched.
    FastRetransmit,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Idle => write!(f, "IDLE"),
            State::AwaitingAck => write!(f, "AWAITING-ACK"),
            State::FastRetransmit => write!(f, "FAST-RETRANSMIT"),
        }
    }
}

bitflags! {
    /// What processing one incoming segment did.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct Actions: u16 {
        /// The cumulative ACK moved forward.
        const ACK_ADVANCED    = 0x0001;
        /// The ACK number was past `send_next` or before `send_unacknowledged`.
        const ACK_IGNORED     = 0x0002;
        const SACK_UPDATED    = 0x0004;
        const DUPLICATE_ACK   = 0x0008;
        const FAST_RETRANSMIT = 0x0010;
        /// The RTT estimator took a sample.
        const RTT_SAMPLED     = 0x0020;
        /// `receive_next` moved forward.
        const DATA_DELIVERED  = 0x0040;
        /// Out-of-order data was held in the wait queue.
        const DATA_QUEUED     = 0x0080;
        /// The peer expects an acknowledgement.
        const SEND_ACK        = 0x0100;
    }
}

/// Result of [`Window::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub actions: Actions,
    /// Octets released by the cumulative ACK.
    pub acked: usize,
    /// Octets that became contiguous at `receive_next`.
    pub delivered: usize,
    pub sack: SackSummary,
    /// The option that stopped option decoding. Options before it were applied.
    pub option_error: Option<MalformedOption>,
}

impl Outcome {
    fn new() -> Outcome {
        Outcome {
            actions: Actions::empty(),
            acked: 0,
            delivered: 0,
            sack: SackSummary::default(),
            option_error: None,
        }
    }
}

/// A segment due for retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmit {
    pub seq_number: TcpSeqNumber,
    pub len: usize,
    /// How many times the segment will have been retransmitted once this copy is sent.
    pub retransmit_count: u32,
    /// Triggered by duplicate ACKs rather than by the timer.
    pub fast: bool,
}

impl fmt::Display for Retransmit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} retransmit of [{}, {}) nr {}",
            if self.fast { "fast" } else { "timeout" },
            self.seq_number,
            self.seq_number + self.len,
            self.retransmit_count
        )
    }
}

/// The send and receive windows of one TCP connection.
///
/// A `Window` tracks every segment that was sent and not yet acknowledged, and every
/// segment that arrived ahead of `receive_next`. It consumes decoded headers and raw
/// option bytes, and tells the caller when and what to resend; it never touches
/// payload octets nor builds packets itself.
#[derive(Debug)]
pub struct Window<'a> {
    config: Config,
    state: State,
    lists: SegmentLists<'a>,
    rtte: RttEstimator,
    dup_acks: DupAcks,
    /// The segment picked by the last fast retransmit, until it is dispatched.
    fast_retransmit: Option<Handle>,
    /// Highest right edge of any accepted SACK block above `send_unacknowledged`.
    highest_sacked: Option<TcpSeqNumber>,

    /// Oldest unacknowledged sequence number.
    send_unacknowledged: TcpSeqNumber,
    /// Sequence number of the next octet to be sent.
    send_next: TcpSeqNumber,
    /// Sequence number of the next octet expected from the peer.
    receive_next: TcpSeqNumber,

    /// Last window the peer advertised, unscaled.
    remote_last_win: Option<u16>,
    remote_win_shift: u8,
    remote_mss: Option<u16>,
    remote_sack_permitted: bool,
    remote_last_ts: Option<u32>,
}

impl<'a> Window<'a> {
    /// Create the window state of a connection whose first octets are numbered
    /// `local_seq` (sent) and `remote_seq` (received).
    pub fn new<S>(
        storage: S,
        config: Config,
        local_seq: TcpSeqNumber,
        remote_seq: TcpSeqNumber,
    ) -> Window<'a>
    where
        S: Into<ManagedSlice<'a, SegmentSlot>>,
    {
        Window {
            config,
            state: State::Idle,
            lists: SegmentLists::new(storage),
            rtte: RttEstimator::new(config.limits()),
            dup_acks: DupAcks::new(config.dup_ack_threshold),
            fast_retransmit: None,
            highest_sacked: None,
            send_unacknowledged: local_seq,
            send_next: local_seq,
            receive_next: remote_seq,
            remote_last_win: None,
            remote_win_shift: 0,
            remote_mss: None,
            remote_sack_permitted: false,
            remote_last_ts: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn send_unacknowledged(&self) -> TcpSeqNumber {
        self.send_unacknowledged
    }

    pub fn send_next(&self) -> TcpSeqNumber {
        self.send_next
    }

    pub fn receive_next(&self) -> TcpSeqNumber {
        self.receive_next
    }

    /// Octets sent and not yet cumulatively acknowledged.
    pub fn in_flight(&self) -> usize {
        self.send_next.distance(self.send_unacknowledged) as usize
    }

    pub fn highest_sacked(&self) -> Option<TcpSeqNumber> {
        self.highest_sacked
    }

    pub fn dup_ack_count(&self) -> u8 {
        self.dup_acks.count()
    }

    /// Number of segment descriptors in use.
    pub fn segment_count(&self) -> usize {
        self.lists.segment_count()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rtte.srtt()
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.rtte.rttvar()
    }

    pub fn retransmission_timeout(&self) -> Duration {
        self.rtte.retransmission_timeout()
    }

    /// The maximum segment size the peer announced.
    pub fn remote_mss(&self) -> Option<u16> {
        self.remote_mss
    }

    /// The last window the peer advertised, with its window scale applied.
    pub fn remote_window(&self) -> Option<usize> {
        self.remote_last_win
            .map(|win| (win as usize) << self.remote_win_shift)
    }

    pub fn remote_sack_permitted(&self) -> bool {
        self.remote_sack_permitted
    }

    /// The `TSval` of the last timestamp option received, to be echoed back.
    pub fn remote_timestamp(&self) -> Option<u32> {
        self.remote_last_ts
    }

    /// Iterate over the unacknowledged segments in sequence order.
    pub fn transmitted(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.lists.tx_iter().map(|(_, segment)| segment)
    }

    /// Iterate over the segments eligible for retransmission, most urgent first.
    pub fn retransmit_queue(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.lists.pq_iter().map(|(_, segment)| segment)
    }

    /// Iterate over the out-of-order segments held for reassembly.
    pub fn out_of_order(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.lists.wait_iter()
    }

    /// Record `len` octets just transmitted at `send_next`.
    ///
    /// Returns the sequence number of the first octet of the segment.
    pub fn send(&mut self, now: Instant, len: usize) -> Result<TcpSeqNumber, SendError> {
        if len == 0 {
            return Err(SendError::Empty);
        }
        let length = match u32::try_from(len) {
            Ok(length) if length <= i32::MAX as u32 - self.in_flight() as u32 => length,
            _ => return Err(SendError::Exhausted),
        };
        let start = self.send_next;
        if self
            .lists
            .push_transmitted(Segment::new(start, length, now))
            .is_err()
        {
            net_debug!("no descriptor left for [{}, {})", start, start + len);
            return Err(SendError::Exhausted);
        }
        self.send_next = start + len;
        if self.state == State::Idle {
            self.set_state(State::AwaitingAck);
        }
        tcp_trace!("sent [{}, {})", start, self.send_next);

        self.check_invariants();
        Ok(start)
    }

    /// Process one incoming segment.
    ///
    /// Never fails: problems with the segment are logged, reported through the
    /// returned [`Outcome`], and the rest of the segment is still used.
    pub fn process(&mut self, now: Instant, repr: &TcpRepr) -> Outcome {
        let mut outcome = Outcome::new();
        tcp_trace!("received {}", repr);

        let options = TcpOptions::parse(repr.options);
        outcome.option_error = options.error;
        self.update_peer_options(&options);

        if let Some(ack_number) = repr.ack_number {
            self.process_ack(now, repr, ack_number, &options, &mut outcome);
        }
        if repr.payload_len > 0 {
            self.process_data(now, repr, &mut outcome);
        }
        self.remote_last_win = Some(repr.window_len);

        self.check_invariants();
        outcome
    }

    fn update_peer_options(&mut self, options: &TcpOptions) {
        match options.max_seg_size {
            Some(0) => net_debug!("ignoring zero MSS"),
            Some(mss) => self.remote_mss = Some(mss),
            None => (),
        }
        if let Some(shift) = options.window_scale {
            if shift > MAX_WINDOW_SHIFT {
                net_debug!("window shift {} clamped to {}", shift, MAX_WINDOW_SHIFT);
            }
            self.remote_win_shift = shift.min(MAX_WINDOW_SHIFT);
        }
        if options.sack_permitted {
            self.remote_sack_permitted = true;
        }
        if let Some(timestamp) = options.timestamp {
            self.remote_last_ts = Some(timestamp.tsval);
        }
    }

    fn process_ack(
        &mut self,
        now: Instant,
        repr: &TcpRepr,
        ack_number: TcpSeqNumber,
        options: &TcpOptions,
        outcome: &mut Outcome,
    ) {
        if ack_number.after(self.send_next) || ack_number.before(self.send_unacknowledged) {
            net_debug!(
                "unacceptable ACK ({} not in {}..={})",
                ack_number,
                self.send_unacknowledged,
                self.send_next
            );
            outcome.actions |= Actions::ACK_IGNORED;
            return;
        }

        if !options.sack_ranges.is_empty() {
            let summary = sack::reconcile(
                &mut self.lists,
                &options.sack_ranges,
                self.send_unacknowledged,
                self.send_next,
            );
            if let Some(highest) = summary.highest {
                self.highest_sacked = Some(match self.highest_sacked {
                    Some(previous) => previous.max(highest),
                    None => highest,
                });
            }
            if summary.newly_acked > 0 {
                outcome.actions |= Actions::SACK_UPDATED;
            }
            outcome.sack = summary;
        }

        // Duplicate ACK if payload empty and ACK doesn't move the send window ->
        // increment duplicate ACK count and fast retransmit on reaching the threshold.
        let is_window_update = self
            .remote_last_win
            .is_some_and(|win| win != repr.window_len);
        if ack_number == self.send_unacknowledged
            && repr.payload_len == 0
            && !is_window_update
            && !self.lists.tx_is_empty()
        {
            outcome.actions |= Actions::DUPLICATE_ACK;
            let trigger = self.dup_acks.on_duplicate();
            net_debug!(
                "received duplicate ACK for seq {} (duplicate nr {})",
                ack_number,
                self.dup_acks.count()
            );
            if trigger {
                if let Some(handle) = sack::fast_retransmit(&mut self.lists, now) {
                    self.fast_retransmit = Some(handle);
                    self.set_state(State::FastRetransmit);
                    outcome.actions |= Actions::FAST_RETRANSMIT;
                }
            }
        } else if self.dup_acks.count() > 0 {
            self.dup_acks.reset();
            net_debug!("reset duplicate ACK count");
        }

        if ack_number.after(self.send_unacknowledged) {
            let released = self.lists.release_acknowledged(ack_number);
            tcp_trace!(
                "ACK {} released {} octets in {} segments",
                ack_number,
                released.bytes,
                released.segments
            );
            self.send_unacknowledged = ack_number;
            outcome.acked = released.bytes;
            outcome.actions |= Actions::ACK_ADVANCED;

            // Karn's algorithm: only segments sent exactly once give usable samples,
            // and an ACK that also covers a retransmission is ambiguous.
            if let Some(segment) = released.retiring {
                if !released.retransmitted && !segment.is_acked {
                    let rtt = now - segment.last_sent_at;
                    self.rtte
                        .sample(u32::try_from(rtt.total_millis()).unwrap_or(u32::MAX));
                    outcome.actions |= Actions::RTT_SAMPLED;
                }
            }

            if self
                .highest_sacked
                .is_some_and(|highest| !highest.after(ack_number))
            {
                self.highest_sacked = None;
            }
            if let Some(handle) = self.fast_retransmit {
                if self.lists.get(handle).is_none() {
                    self.fast_retransmit = None;
                    if self.state == State::FastRetransmit {
                        self.set_state(State::AwaitingAck);
                    }
                }
            }
            if self.lists.tx_is_empty() {
                self.fast_retransmit = None;
                self.set_state(State::Idle);
            }
        }
    }

    fn process_data(&mut self, now: Instant, repr: &TcpRepr, outcome: &mut Outcome) {
        outcome.actions |= Actions::SEND_ACK;

        let window_end = self.receive_next + self.config.rx_window as usize;
        let segment_end = repr.seq_number + repr.payload_len;

        // Trim the part we already have.
        let (start, len) = if repr.seq_number.before(self.receive_next) {
            if !segment_end.after(self.receive_next) {
                net_debug!(
                    "duplicate segment [{}, {}) below {}",
                    repr.seq_number,
                    segment_end,
                    self.receive_next
                );
                return;
            }
            (
                self.receive_next,
                segment_end.distance(self.receive_next) as usize,
            )
        } else {
            (repr.seq_number, repr.payload_len)
        };

        if !start.in_window(self.receive_next, window_end) {
            net_debug!(
                "segment at {} not in receive window ({}..{})",
                start,
                self.receive_next,
                window_end
            );
            return;
        }
        let len = len.min(window_end.distance(start) as usize);

        if start == self.receive_next {
            let before = self.receive_next;
            self.receive_next = self.lists.drain_contiguous(start + len);
            outcome.delivered = self.receive_next.distance(before) as usize;
            outcome.actions |= Actions::DATA_DELIVERED;
            tcp_trace!("receive_next advanced to {}", self.receive_next);
            return;
        }

        match self.lists.hold(start, len as u32, now) {
            Ok(Hold::Queued) => {
                outcome.actions |= Actions::DATA_QUEUED;
                tcp_trace!("holding out-of-order [{}, {})", start, start + len);
            }
            Ok(Hold::Merged) => outcome.actions |= Actions::DATA_QUEUED,
            Ok(Hold::Duplicate) => {
                net_debug!("out-of-order [{}, {}) already held", start, start + len)
            }
            Err(_) => net_debug!(
                "no descriptor left, dropping out-of-order [{}, {})",
                start,
                start + len
            ),
        }
    }

    /// The out-of-order blocks to advertise in outgoing ACKs, lowest first.
    pub fn sack_ranges(&self) -> Vec<SackRange, TCP_MAX_ADVERTISED_SACK_RANGES> {
        self.lists.wait_ranges()
    }

    /// Emit the SACK option of the next outgoing ACK into `buffer`.
    ///
    /// Returns the number of octets written, zero when the peer did not permit SACK
    /// or nothing is held out of order.
    pub fn emit_sack_option(&self, buffer: &mut [u8]) -> wire::Result<usize> {
        if !self.remote_sack_permitted || self.lists.wait_is_empty() {
            return Ok(0);
        }
        emit_sack(&self.sack_ranges(), buffer)
    }

    fn deadline(&self, segment: &Segment) -> Instant {
        segment.last_sent_at + self.rtte.retransmission_timeout()
    }

    /// The segment to resend at `now`, and whether it is a fast retransmit.
    fn due(&self, now: Instant) -> Option<(Handle, bool)> {
        match self.state {
            State::Idle => None,
            State::FastRetransmit => match self.fast_retransmit {
                Some(handle) if self.lists.pq_contains(handle) => Some((handle, true)),
                _ => self.due_by_timer(now),
            },
            State::AwaitingAck => self.due_by_timer(now),
        }
    }

    fn due_by_timer(&self, now: Instant) -> Option<(Handle, bool)> {
        let handle = self.lists.pq_head()?;
        let segment = self.lists.get(handle)?;
        (now >= self.deadline(segment)).then_some((handle, false))
    }

    fn view(&self, handle: Handle, fast: bool) -> Option<Retransmit> {
        let segment = self.lists.get(handle)?;
        Some(Retransmit {
            seq_number: segment.start,
            len: segment.len(),
            retransmit_count: if fast {
                segment.retransmit_count
            } else {
                segment.retransmit_count.saturating_add(1)
            },
            fast,
        })
    }

    /// The segment that should be resent at `now`, if any.
    pub fn peek_retransmit(&self, now: Instant) -> Option<Retransmit> {
        let (handle, fast) = self.due(now)?;
        self.view(handle, fast)
    }

    /// When the connection next needs attention from the retransmission scheduler.
    pub fn poll_at(&self, now: Instant) -> PollAt {
        match self.state {
            State::Idle => PollAt::Ingress,
            State::FastRetransmit => PollAt::Now,
            State::AwaitingAck => {
                let deadline = self
                    .lists
                    .pq_head()
                    .and_then(|handle| self.lists.get(handle))
                    .map(|segment| self.deadline(segment));
                match deadline {
                    Some(deadline) if deadline <= now => PollAt::Now,
                    Some(deadline) => PollAt::Time(deadline),
                    // Everything outstanding was SACKed; wait for the cumulative ACK.
                    None => PollAt::Ingress,
                }
            }
        }
    }

    /// Hand the segment due at `now` to `emit`.
    ///
    /// The retransmission is recorded only if `emit` succeeds. Nothing is emitted when
    /// no segment is due.
    pub fn dispatch<F, E>(&mut self, now: Instant, emit: F) -> Result<(), E>
    where
        F: FnOnce(Retransmit) -> Result<(), E>,
    {
        let Some((handle, fast)) = self.due(now) else {
            if self.state == State::FastRetransmit {
                // The picked segment was acknowledged meanwhile.
                self.fast_retransmit = None;
                self.set_state(State::AwaitingAck);
            }
            return Ok(());
        };
        let Some(retransmit) = self.view(handle, fast) else {
            return Ok(());
        };

        emit(retransmit)?;
        net_debug!("{}", retransmit);

        if fast {
            // Counted and stamped when the fast retransmit was triggered.
            self.fast_retransmit = None;
            self.set_state(State::AwaitingAck);
        } else {
            if let Some(segment) = self.lists.get_mut(handle) {
                segment.retransmit_count = retransmit.retransmit_count;
                segment.last_sent_at = now;
            }
            self.lists.pq_move_to_back(handle);
            self.rtte.on_retransmit();
        }

        self.check_invariants();
        Ok(())
    }

    /// Release every segment descriptor and forget all outstanding data, e.g. when the
    /// connection closes.
    pub fn teardown(&mut self) {
        net_debug!(
            "teardown, releasing {} segments",
            self.lists.segment_count()
        );
        self.lists.clear();
        self.send_unacknowledged = self.send_next;
        self.fast_retransmit = None;
        self.highest_sacked = None;
        self.dup_acks.reset();
        self.set_state(State::Idle);
        self.check_invariants();
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("state={}=>{}", self.state, state);
        }
        self.state = state;
    }

    /// Assert the structural invariants of the window. Only active with debug assertions.
    pub fn check_invariants(&self) {
        self.lists
            .check_invariants(self.send_unacknowledged, self.send_next);
        debug_assert_eq!(
            self.state == State::Idle,
            self.lists.tx_is_empty(),
            "state {} does not match the transmit list",
            self.state
        );
        if let Some(srtt) = self.rtte.srtt() {
            debug_assert!(
                srtt >= self.config.srtt_floor,
                "srtt {} below floor {}",
                srtt,
                self.config.srtt_floor
            );
        }
        if let Some(highest) = self.highest_sacked {
            debug_assert!(
                !highest.after(self.send_next),
                "SACK edge {} beyond send_next {}",
                highest,
                self.send_next
            );
        }
    }
}
