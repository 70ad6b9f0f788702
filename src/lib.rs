#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

/*! The receive-side TCP engine of a bare-metal network stack.

`tcpwin` takes the part of TCP that sits between a decoded segment header and the
retransmission timer: it parses TCP options (including SACK blocks) straight from the
received bytes, reconciles SACK information against the segments still in flight,
reassembles out-of-order data, and keeps the round-trip-time estimate that sizes the
retransmission timeout. It never allocates; all segment bookkeeping lives in storage
handed to it by the caller.

# Table of contents

 * The [wire](wire/index.html) module deals with the TCP option *representation*
   and the sequence number space.
 * The [storage](storage/index.html) module provides the fixed-capacity slot arena
   that backs every segment descriptor.
 * The [socket](socket/index.html) module holds the per-connection window state,
   the SACK reconciler and the RTT estimator.

# Minimum Supported Rust Version (MSRV)

This crate is guaranteed to compile on stable Rust 1.85 and up.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;
