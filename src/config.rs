//! Compile-time capacities.
//!
//! Every bounded container in the crate takes its size from here, so the memory
//! footprint of a connection is known at build time.

/// Maximum number of segment descriptors a single list (wait queue, transmit list,
/// retransmit priority queue) can reference.
pub const TCP_MAX_SEGMENT_COUNT: usize = 32;

/// Maximum number of SACK ranges collected from the options of one segment.
pub const TCP_MAX_SACK_RANGES: usize = 8;

/// Maximum number of SACK blocks advertised in an outgoing acknowledgement.
/// Four blocks (34 octets) is all that fits in the 40 octets of option space.
pub const TCP_MAX_ADVERTISED_SACK_RANGES: usize = 4;
