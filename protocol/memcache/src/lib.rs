//! memcached ASCII wire format for dumping a live server.
//!
//! Only the two command shapes a dump needs are covered:
//!
//! - `lru_crawler metadump all`, answered by a stream of
//!   `key=<urlenc> exp=<int> la=<int> ...\n` lines and a terminating `END`.
//! - `get <k1> <k2> ...`, answered by zero or more
//!   `VALUE <key> <flags> <bytes>\r\n<data>\r\n` records and `END\r\n`.
//!
//! Both parsers work over a window of bytes supplied by the caller and report
//! how many bytes they consumed, so the caller can keep the unconsumed tail and
//! append the next socket read after it.
//!
//! # Example
//!
//! ```
//! use protocol_memcache::{Parsed, Request, ValueParser};
//!
//! let keys: &[&[u8]] = &[b"abc"];
//! let mut buf = [0u8; 32];
//! let len = Request::gets(keys).encode(&mut buf);
//! assert_eq!(&buf[..len], b"get abc\r\n");
//!
//! let mut parser = ValueParser::new();
//! let (parsed, consumed) = parser.parse(b"VALUE abc 0 3\r\nxyz\r\nEND\r\n").unwrap();
//! match parsed {
//!     Parsed::Value(value) => assert_eq!(value.data, b"xyz"),
//!     _ => unreachable!(),
//! }
//! assert_eq!(consumed, 20);
//! ```

mod metadump;
mod request;
mod response;

pub use metadump::{MetadumpLine, MetadumpRecord, parse_metadump_line, percent_decode};
pub use request::Request;
pub use response::{MAX_KEY_LEN, MAX_VALUE_LEN, Parsed, ParserState, Value, ValueParser};

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A response line that is neither a value, a terminator, nor an error.
    #[error("unexpected response: {0}")]
    Unexpected(String),
    /// A key longer than the protocol allows.
    #[error("key exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLong,
    /// A numeric field that is not a non-negative decimal.
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    /// A byte count above the parser's maximum value length.
    #[error("value of {len} bytes exceeds the {max} byte limit")]
    ValueTooLarge { len: usize, max: usize },
    /// A value payload not followed by `\r\n`.
    #[error("value payload is not terminated by CRLF")]
    MissingTerminator,
}

/// Find the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Render bytes for an error message, replacing anything non-UTF-8.
pub(crate) fn lossy(bytes: &[u8]) -> String {
    const MAX: usize = 64;
    let bytes = &bytes[..bytes.len().min(MAX)];
    String::from_utf8_lossy(bytes).into_owned()
}
