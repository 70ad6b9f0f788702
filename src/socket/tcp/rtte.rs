use crate::time::Duration;

/// RFC 6298: (2.1) Until a round-trip time (RTT) measurement has been made for a
/// segment sent between the sender and receiver, the sender SHOULD
/// set RTO <- 1 second,
pub(super) const RTTE_INITIAL_RTO: u32 = 1000;

// Minimum "safety margin" for the RTO that kicks in when the
// variance gets very low.
const RTTE_MIN_MARGIN: u32 = 5;

/// K, according to RFC 6298
const RTTE_K: u32 = 4;

// RFC 6298 (2.4): Whenever RTO is computed, if it is less than 1 second, then the
// RTO SHOULD be rounded up to 1 second.
pub(super) const RTTE_MIN_RTO: u32 = 1000;

// RFC 6298 (2.5) A maximum value MAY be placed on RTO provided it is at least 60
// seconds
pub(super) const RTTE_MAX_RTO: u32 = 60_000;

/// Floor for the smoothed RTT, so clock noise can never yield a zero timeout.
pub(super) const RTTE_SRTT_FLOOR: u32 = 50;

// Consecutive backoffs after which SRTT and RTTVAR are considered bogus.
const RTTE_MAX_BACKOFFS: u8 = 3;

/// Bounds the estimator works within, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Limits {
    pub srtt_floor: u32,
    pub initial_rto: u32,
    pub min_rto: u32,
    pub max_rto: u32,
    pub backoff_multiplier: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            srtt_floor: RTTE_SRTT_FLOOR,
            initial_rto: RTTE_INITIAL_RTO,
            min_rto: RTTE_MIN_RTO,
            max_rto: RTTE_MAX_RTO,
            backoff_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct RttEstimator {
    limits: Limits,
    /// true if we have made at least one rtt measurement.
    have_measurement: bool,
    // Using u32 instead of Duration to save space (Duration is u64)
    /// Smoothed RTT
    srtt: u32,
    /// RTT variance.
    rttvar: u32,
    /// Retransmission Time-Out
    rto: u32,
    rto_count: u8,
}

impl RttEstimator {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            have_measurement: false,
            srtt: 0,   // ignored, will be overwritten on first measurement.
            rttvar: 0, // ignored, will be overwritten on first measurement.
            rto: limits.initial_rto.clamp(limits.srtt_floor, limits.max_rto),
            rto_count: 0,
        }
    }

    pub fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.rto as _)
    }

    /// The smoothed RTT, if any sample was taken since the last reset.
    pub fn srtt(&self) -> Option<Duration> {
        self.have_measurement
            .then(|| Duration::from_millis(self.srtt as _))
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.have_measurement
            .then(|| Duration::from_millis(self.rttvar as _))
    }

    /// Feed one round-trip sample, in milliseconds. Samples under the floor are
    /// clamped up to it.
    pub fn sample(&mut self, new_rtt: u32) {
        let new_rtt = new_rtt.max(self.limits.srtt_floor);
        if self.have_measurement {
            // RFC 6298 (2.3) When a subsequent RTT measurement R' is made, a host MUST set (...)
            let diff = (self.srtt as i64 - new_rtt as i64).unsigned_abs() as u32;
            self.rttvar = (self.rttvar.saturating_mul(3).saturating_add(diff)).div_ceil(4);
            self.srtt = (self.srtt.saturating_mul(7).saturating_add(new_rtt)).div_ceil(8);
        } else {
            // RFC 6298 (2.2) When the first RTT measurement R is made, the host MUST set (...)
            self.have_measurement = true;
            self.srtt = new_rtt;
            self.rttvar = new_rtt / 2;
        }
        self.srtt = self.srtt.max(self.limits.srtt_floor);

        // RFC 6298 (2.2), (2.3)
        let margin = RTTE_MIN_MARGIN.max(self.rttvar.saturating_mul(RTTE_K));
        self.rto = self
            .srtt
            .saturating_add(margin)
            .clamp(self.limits.min_rto.max(self.limits.srtt_floor), self.limits.max_rto);

        self.rto_count = 0;

        tcp_trace!(
            "rtte: sample={:?} srtt={:?} rttvar={:?} rto={:?}",
            new_rtt,
            self.srtt,
            self.rttvar,
            self.rto
        );
    }

    /// Back the timer off after a retransmission timeout.
    pub fn on_retransmit(&mut self) {
        // RFC 6298 (5.5) The host MUST set RTO <- RTO * 2 ("back off the timer").  The
        // maximum value discussed in (2.5) above may be used to provide
        // an upper bound to this doubling operation.
        self.rto = self
            .rto
            .saturating_mul(self.limits.backoff_multiplier)
            .min(self.limits.max_rto);
        tcp_trace!("rtte: backing rto off to {:?}", self.rto);

        // RFC 6298: a TCP implementation MAY clear SRTT and RTTVAR after
        // backing off the timer multiple times as it is likely that the current
        // SRTT and RTTVAR are bogus in this situation.  Once SRTT and RTTVAR
        // are cleared, they should be initialized with the next RTT sample
        // taken per (2.2) rather than using (2.3).
        self.rto_count += 1;
        if self.rto_count >= RTTE_MAX_BACKOFFS {
            self.rto_count = 0;
            self.have_measurement = false;
            tcp_trace!("rtte: too many retransmissions, clearing srtt, rttvar.");
        }
    }
}
