use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};
use heapless::Vec;

use super::{Error, Result};
use crate::config::TCP_MAX_SACK_RANGES;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
/// Comparisons only make sense between numbers less than half the sequence space apart.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    /// Signed distance from `other` to `self`, i.e. `self - other` in modular space.
    #[inline]
    pub const fn distance(self, other: SeqNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Return whether `self` comes strictly before `other`.
    #[inline]
    pub const fn before(self, other: SeqNumber) -> bool {
        self.distance(other) < 0
    }

    /// Return whether `self` comes strictly after `other`.
    #[inline]
    pub const fn after(self, other: SeqNumber) -> bool {
        other.distance(self) < 0
    }

    /// Return whether `low <= self < high`.
    ///
    /// The check is done on the unsigned offset from `low`, so it is meaningful for
    /// any window shorter than the whole sequence space, and an empty window
    /// (`low == high`) contains nothing.
    #[inline]
    pub const fn in_window(self, low: SeqNumber, high: SeqNumber) -> bool {
        self.0.wrapping_sub(low.0) < high.0.wrapping_sub(low.0)
    }

    pub fn max(self, rhs: Self) -> Self {
        if self.before(rhs) { rhs } else { self }
    }

    pub fn min(self, rhs: Self) -> Self {
        if self.before(rhs) { self } else { rhs }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.distance(*other).partial_cmp(&0)
    }
}

enum_with_unknown! {
    /// TCP option kind.
    pub enum OptionKind(u8) {
        /// End of option list
        End = 0x00,
        /// No-operation, used as padding
        NoOperation = 0x01,
        /// Maximum segment size
        MaxSegmentSize = 0x02,
        /// Window scale, see RFC 7323
        WindowScale = 0x03,
        /// SACK permitted, see RFC 2018
        SackPermitted = 0x04,
        /// SACK blocks, see RFC 2018
        SackRange = 0x05,
        /// Timestamps, see RFC 7323
        Timestamp = 0x08,
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OptionKind::End => write!(f, "END"),
            OptionKind::NoOperation => write!(f, "NOP"),
            OptionKind::MaxSegmentSize => write!(f, "MSS"),
            OptionKind::WindowScale => write!(f, "WS"),
            OptionKind::SackPermitted => write!(f, "SACK-PERM"),
            OptionKind::SackRange => write!(f, "SACK"),
            OptionKind::Timestamp => write!(f, "TS"),
            OptionKind::Unknown(id) => write!(f, "kind {id}"),
        }
    }
}

// Format of an option
//
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+- - - - - - - - -
// |     Kind      |    Length     |  Option Data
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+- - - - - - - - -
//
// END and NOP are a single octet. For every other kind, Length counts
// the kind and length octets too.
mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const KIND: usize = 0;
    pub const LENGTH: usize = 1;

    // Empty (and therefore rejected by `get`) when `length < 2`.
    pub const fn DATA(length: u8) -> Field {
        2..length as usize
    }

    pub const SACK_LEFT: Field = 0..4;
    pub const SACK_RIGHT: Field = 4..8;

    pub const TSVAL: Field = 0..4;
    pub const TSECR: Field = 4..8;
}

const OPT_MSS_LEN: u8 = 4;
const OPT_WS_LEN: u8 = 3;
const OPT_SACK_PERM_LEN: u8 = 2;
const OPT_TS_LEN: u8 = 10;
const OPT_HEADER_LEN: usize = 2;

/// Length of one SACK block on the wire.
pub const SACK_BLOCK_LEN: usize = 8;

/// A byte range the receiver reports as held, `[left, right)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SackRange {
    pub left: SeqNumber,
    pub right: SeqNumber,
}

/// Reason a SACK range was not applied.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SackRangeInvalid {
    /// The left edge is not before the right edge.
    Inverted,
    /// The range ends at or before the cumulative acknowledgement point.
    Stale,
    /// The range reaches past anything that was ever sent.
    BeyondSendNext,
}

impl fmt::Display for SackRangeInvalid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SackRangeInvalid::Inverted => write!(f, "inverted SACK range"),
            SackRangeInvalid::Stale => write!(f, "stale SACK range"),
            SackRangeInvalid::BeyondSendNext => write!(f, "SACK range beyond send next"),
        }
    }
}

impl core::error::Error for SackRangeInvalid {}

impl SackRange {
    pub const fn new(left: SeqNumber, right: SeqNumber) -> SackRange {
        SackRange { left, right }
    }

    /// Number of octets covered, or zero for an inverted range.
    pub fn len(&self) -> usize {
        self.right.distance(self.left).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return whether `[start, start + len)` lies entirely inside this range.
    pub fn covers(&self, start: SeqNumber, len: usize) -> bool {
        start.distance(self.left) >= 0 && self.right.distance(start + len) >= 0
    }

    /// Validate the range against the sender's window `[snd_una, snd_nxt]`.
    pub fn check(&self, snd_una: SeqNumber, snd_nxt: SeqNumber) -> core::result::Result<(), SackRangeInvalid> {
        if !self.left.before(self.right) {
            Err(SackRangeInvalid::Inverted)
        } else if !self.right.after(snd_una) {
            Err(SackRangeInvalid::Stale)
        } else if self.right.after(snd_nxt) {
            Err(SackRangeInvalid::BeyondSendNext)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for SackRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.left, self.right)
    }
}

/// The blocks of a SACK option, decoded lazily.
///
/// A `SackBlocks` is only ever constructed over a non-empty payload whose length is
/// a multiple of [SACK_BLOCK_LEN].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SackBlocks<'a> {
    data: &'a [u8],
}

impl<'a> SackBlocks<'a> {
    /// Number of blocks not yet yielded.
    pub fn len(&self) -> usize {
        self.data.len() / SACK_BLOCK_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw, not yet yielded block octets.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for SackBlocks<'a> {
    type Item = SackRange;

    fn next(&mut self) -> Option<SackRange> {
        let block = self.data.get(..SACK_BLOCK_LEN)?;
        self.data = self.data.get(SACK_BLOCK_LEN..)?;
        Some(SackRange {
            left: SeqNumber(NetworkEndian::read_u32(&block[field::SACK_LEFT])),
            right: SeqNumber(NetworkEndian::read_u32(&block[field::SACK_RIGHT])),
        })
    }
}

/// The values of a timestamp option, see RFC 7323.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimestampRepr {
    pub tsval: u32,
    pub tsecr: u32,
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackRange(SackBlocks<'a>),
    TimeStamp(TimestampRepr),
    Unknown { kind: u8, data: &'a [u8] },
}

/// Return the payload of a fixed-length option, checking both the declared
/// length and the buffer bound.
fn fixed_data(buffer: &[u8], length: u8, expected: u8) -> Result<&[u8]> {
    if length != expected {
        return Err(Error);
    }
    buffer.get(field::DATA(expected)).ok_or(Error)
}

impl<'a> TcpOption<'a> {
    /// Parse the option at the start of `buffer`, returning the rest of the buffer
    /// after it.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let kind = OptionKind::from(*buffer.get(field::KIND).ok_or(Error)?);
        if kind == OptionKind::End {
            return Ok((&[], TcpOption::EndOfList));
        }
        if kind == OptionKind::NoOperation {
            return Ok((buffer.get(1..).ok_or(Error)?, TcpOption::NoOperation));
        }

        let length = *buffer.get(field::LENGTH).ok_or(Error)?;
        let option = match kind {
            OptionKind::MaxSegmentSize => {
                let data = fixed_data(buffer, length, OPT_MSS_LEN)?;
                TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
            }
            OptionKind::WindowScale => {
                let data = fixed_data(buffer, length, OPT_WS_LEN)?;
                TcpOption::WindowScale(data[0])
            }
            OptionKind::SackPermitted => {
                fixed_data(buffer, length, OPT_SACK_PERM_LEN)?;
                TcpOption::SackPermitted
            }
            OptionKind::Timestamp => {
                let data = fixed_data(buffer, length, OPT_TS_LEN)?;
                TcpOption::TimeStamp(TimestampRepr {
                    tsval: NetworkEndian::read_u32(&data[field::TSVAL]),
                    tsecr: NetworkEndian::read_u32(&data[field::TSECR]),
                })
            }
            OptionKind::SackRange => {
                let data = buffer.get(field::DATA(length)).ok_or(Error)?;
                if data.is_empty() || data.len() % SACK_BLOCK_LEN != 0 {
                    return Err(Error);
                }
                TcpOption::SackRange(SackBlocks { data })
            }
            OptionKind::Unknown(kind) => {
                let data = buffer.get(field::DATA(length)).ok_or(Error)?;
                TcpOption::Unknown { kind, data }
            }
            OptionKind::End | OptionKind::NoOperation => return Err(Error),
        };
        let rest = buffer.get(length as usize..).ok_or(Error)?;
        Ok((rest, option))
    }

    pub fn kind(&self) -> OptionKind {
        match *self {
            TcpOption::EndOfList => OptionKind::End,
            TcpOption::NoOperation => OptionKind::NoOperation,
            TcpOption::MaxSegmentSize(_) => OptionKind::MaxSegmentSize,
            TcpOption::WindowScale(_) => OptionKind::WindowScale,
            TcpOption::SackPermitted => OptionKind::SackPermitted,
            TcpOption::SackRange(_) => OptionKind::SackRange,
            TcpOption::TimeStamp(_) => OptionKind::Timestamp,
            TcpOption::Unknown { kind, .. } => OptionKind::Unknown(kind),
        }
    }

    /// Return the length of the option when emitted.
    pub fn buffer_len(&self) -> usize {
        match *self {
            TcpOption::EndOfList | TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => OPT_MSS_LEN as usize,
            TcpOption::WindowScale(_) => OPT_WS_LEN as usize,
            TcpOption::SackPermitted => OPT_SACK_PERM_LEN as usize,
            TcpOption::SackRange(ref blocks) => OPT_HEADER_LEN + blocks.as_bytes().len(),
            TcpOption::TimeStamp(_) => OPT_TS_LEN as usize,
            TcpOption::Unknown { data, .. } => OPT_HEADER_LEN + data.len(),
        }
    }

    /// Emit the option into the start of `buffer`, returning the rest of the buffer.
    ///
    /// Returns `Err(Error)` if `buffer` is too short or the option cannot be encoded.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> Result<&'b mut [u8]> {
        let length = self.buffer_len();
        let length_octet = u8::try_from(length).map_err(|_| Error)?;
        if buffer.len() < length {
            return Err(Error);
        }
        let (option, rest) = buffer.split_at_mut(length);
        option[field::KIND] = self.kind().into();
        if length > 1 {
            option[field::LENGTH] = length_octet;
        }
        let data = &mut option[OPT_HEADER_LEN.min(length)..];
        match *self {
            TcpOption::EndOfList | TcpOption::NoOperation | TcpOption::SackPermitted => (),
            TcpOption::MaxSegmentSize(value) => NetworkEndian::write_u16(data, value),
            TcpOption::WindowScale(value) => data[0] = value,
            TcpOption::SackRange(ref blocks) => data.copy_from_slice(blocks.as_bytes()),
            TcpOption::TimeStamp(TimestampRepr { tsval, tsecr }) => {
                NetworkEndian::write_u32(&mut data[field::TSVAL], tsval);
                NetworkEndian::write_u32(&mut data[field::TSECR], tsecr);
            }
            TcpOption::Unknown { data: payload, .. } => data.copy_from_slice(payload),
        }
        Ok(rest)
    }
}

impl<'a> fmt::Display for TcpOption<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TcpOption::MaxSegmentSize(mss) => write!(f, "MSS={mss}"),
            TcpOption::WindowScale(shift) => write!(f, "WS={shift}"),
            TcpOption::SackRange(ref blocks) => write!(f, "SACK blocks={}", blocks.len()),
            TcpOption::TimeStamp(ts) => write!(f, "TS={}/{}", ts.tsval, ts.tsecr),
            ref other => write!(f, "{}", other.kind()),
        }
    }
}

/// Emit a SACK option carrying `ranges` into the start of `buffer`.
///
/// Returns the number of octets written.
pub fn emit_sack(ranges: &[SackRange], buffer: &mut [u8]) -> Result<usize> {
    let length = OPT_HEADER_LEN + ranges.len() * SACK_BLOCK_LEN;
    if ranges.is_empty() || length > u8::MAX as usize || buffer.len() < length {
        return Err(Error);
    }
    buffer[field::KIND] = OptionKind::SackRange.into();
    buffer[field::LENGTH] = length as u8;
    for (range, block) in ranges
        .iter()
        .zip(buffer[OPT_HEADER_LEN..length].chunks_exact_mut(SACK_BLOCK_LEN))
    {
        NetworkEndian::write_u32(&mut block[field::SACK_LEFT], range.left.0);
        NetworkEndian::write_u32(&mut block[field::SACK_RIGHT], range.right.0);
    }
    Ok(length)
}

/// An option that could not be decoded.
///
/// Decoding stops at the first malformed option; options before it stay valid.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MalformedOption {
    /// Offset of the faulty option inside the option region.
    pub offset: usize,
    pub kind: OptionKind,
}

impl fmt::Display for MalformedOption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed TCP option {} at offset {}", self.kind, self.offset)
    }
}

impl core::error::Error for MalformedOption {}

/// An iterator over the options of a TCP header.
///
/// Iteration ends after `END`, at the end of the buffer, or right after the first
/// malformed option.
#[derive(Debug, Clone)]
pub struct TcpOptionsIterator<'a> {
    pos: usize,
    data: &'a [u8],
    finished: bool,
}

impl<'a> TcpOptionsIterator<'a> {
    pub fn new(data: &'a [u8]) -> TcpOptionsIterator<'a> {
        Self::with_cursor(data, 0)
    }

    /// Iterate over the options of `data` starting at offset `pos`.
    ///
    /// A cursor at or past the end of `data` yields nothing. Offsets reported in
    /// [MalformedOption] stay relative to the start of `data`.
    pub fn with_cursor(data: &'a [u8], pos: usize) -> TcpOptionsIterator<'a> {
        TcpOptionsIterator {
            pos,
            data,
            finished: false,
        }
    }
}

impl<'a> Iterator for TcpOptionsIterator<'a> {
    type Item = core::result::Result<TcpOption<'a>, MalformedOption>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let remaining = match self.data.get(self.pos..) {
            Some(remaining) if !remaining.is_empty() => remaining,
            _ => {
                self.finished = true;
                return None;
            }
        };

        match TcpOption::parse(remaining) {
            Ok((rest, option)) => {
                self.pos = self.data.len() - rest.len();
                if option == TcpOption::EndOfList {
                    self.finished = true;
                }
                Some(Ok(option))
            }
            Err(Error) => {
                self.finished = true;
                Some(Err(MalformedOption {
                    offset: self.pos,
                    kind: OptionKind::from(remaining[field::KIND]),
                }))
            }
        }
    }
}

/// Everything the option region of one segment announced.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct TcpOptions {
    pub max_seg_size: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamp: Option<TimestampRepr>,
    /// SACK ranges in wire order.
    pub sack_ranges: Vec<SackRange, TCP_MAX_SACK_RANGES>,
    /// Well-formed SACK ranges that did not fit in `sack_ranges`.
    pub sack_ranges_dropped: usize,
    /// The option that stopped decoding, if any.
    pub error: Option<MalformedOption>,
}

impl TcpOptions {
    /// Decode every option of `buffer`.
    ///
    /// Options decoded before a malformed one are kept.
    pub fn parse(buffer: &[u8]) -> TcpOptions {
        let mut options = TcpOptions::default();
        for option in TcpOptionsIterator::new(buffer) {
            match option {
                Ok(TcpOption::MaxSegmentSize(mss)) => options.max_seg_size = Some(mss),
                Ok(TcpOption::WindowScale(shift)) => options.window_scale = Some(shift),
                Ok(TcpOption::SackPermitted) => options.sack_permitted = true,
                Ok(TcpOption::TimeStamp(ts)) => options.timestamp = Some(ts),
                Ok(TcpOption::SackRange(blocks)) => {
                    for range in blocks {
                        if options.sack_ranges.push(range).is_err() {
                            options.sack_ranges_dropped += 1;
                        }
                    }
                }
                Ok(_) => (),
                Err(err) => {
                    net_debug!("{}", err);
                    options.error = Some(err);
                }
            }
        }
        if options.sack_ranges_dropped > 0 {
            net_debug!(
                "dropped {} SACK ranges over the limit of {}",
                options.sack_ranges_dropped,
                TCP_MAX_SACK_RANGES
            );
        }
        options
    }
}

/// A high-level representation of the TCP header fields the window engine consumes.
///
/// The transport layer decodes the fixed header; the option region is handed over
/// as raw octets and parsed here.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr<'a> {
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub payload_len: usize,
    pub options: &'a [u8],
}

impl<'a> Repr<'a> {
    /// Iterate over the options of this segment.
    pub fn options(&self) -> TcpOptionsIterator<'a> {
        TcpOptionsIterator::new(self.options)
    }
}

impl<'a> fmt::Display for Repr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP seq={}", self.seq_number)?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={ack_number}")?;
        }
        write!(f, " win={} len={}", self.window_len, self.payload_len)?;
        for option in self.options() {
            match option {
                Ok(TcpOption::EndOfList) | Ok(TcpOption::NoOperation) => (),
                Ok(option) => write!(f, " {option}")?,
                Err(err) => write!(f, " ({err})")?,
            }
        }
        Ok(())
    }
}
