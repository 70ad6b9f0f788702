/*! Low-level access to TCP option bytes and sequence numbers.

The `wire` module deals with the TCP option *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in
   [TcpOption::parse] and [TcpOption::emit].
 * Second, it provides a compact, high-level summary of everything a segment's
   option region announced, in [TcpOptions].

Option bytes arrive straight from the network and are fully attacker-controlled.
Every accessor in this module reads through bounds-checked slice operations; for
any buffer length and any content, parsing either succeeds or returns an error,
it never panics.

# Examples

To emit a SACK option into an octet buffer, and then parse it back:

```rust
use tcpwin::wire::*;

let ranges = [SackRange::new(TcpSeqNumber(200), TcpSeqNumber(400))];
let mut buffer = [0u8; 10];
let len = emit_sack(&ranges, &mut buffer).expect("buffer too short");

let options = TcpOptions::parse(&buffer[..len]);
assert_eq!(options.sack_ranges.as_slice(), &ranges[..]);
assert_eq!(options.error, None);
```

[TcpOption::parse]: enum.TcpOption.html#method.parse
[TcpOption::emit]: enum.TcpOption.html#method.emit
[TcpOptions]: struct.TcpOptions.html
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

mod tcp;

use core::fmt;

pub use self::tcp::{
    MalformedOption, OptionKind as TcpOptionKind, Repr as TcpRepr, SackBlocks, SackRange,
    SackRangeInvalid, SeqNumber as TcpSeqNumber, TcpOption, TcpOptions, TcpOptionsIterator,
    TimestampRepr as TcpTimestampRepr, emit_sack,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by tcpwin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
