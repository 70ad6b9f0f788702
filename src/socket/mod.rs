/*! Per-connection TCP bookkeeping.

The `socket` module keeps the state a TCP endpoint needs between segments: what was
sent and not yet acknowledged, what arrived out of order, and when something has to
be resent. Like the rest of the stack it uses explicit buffering: the caller decides
how many segment descriptors a connection may hold, provides the storage, and lets
the engine use it.
*/

use crate::time::Instant;

pub mod tcp;

/// Gives an indication on the next time the connection should be polled.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum PollAt {
    /// The connection needs to be polled immediately.
    Now,
    /// The connection needs to be polled at given [Instant][struct.Instant].
    Time(Instant),
    /// The connection does not need to be polled unless there are external changes.
    Ingress,
}
