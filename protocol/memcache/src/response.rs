//! Incremental parser for bulk `get` responses.
//!
//! A response is zero or more value records followed by a terminator:
//!
//! ```text
//! VALUE <key> <flags> <bytes>\r\n
//! <data>\r\n
//! ...
//! END\r\n
//! ```
//!
//! The parser walks each record one token at a time and remembers which token
//! it is waiting for, so a record may be split across any number of socket
//! reads. Header tokens are only consumed once complete; the payload is
//! consumed as it arrives, so values larger than the caller's buffer are
//! accumulated inside the parser. A byte count above the parser's maximum
//! value length is rejected before any payload is buffered.

use crate::{ParseError, find, lossy};

/// Longest key memcached accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Longest numeric field we are willing to wait for.
const MAX_NUMBER_LEN: usize = 20;

/// Longest error line we are willing to wait for.
const MAX_LINE_LEN: usize = 1024;

/// Largest item memcached can be configured to store (`-I 1024m`).
pub const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

/// Payload buffers grow from here instead of trusting the advertised length.
const INITIAL_DATA_CAPACITY: usize = 64 * 1024;

/// The token the parser is currently looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Start of a record: `VALUE `, `END\r\n` or an error line.
    ValueDelimiter,
    /// The key, terminated by a space.
    Key,
    /// The flags, terminated by a space.
    Flags,
    /// The byte count, terminated by `\r\n`.
    Length,
    /// The payload plus its trailing `\r\n`.
    Data,
}

/// A value returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Vec<u8>,
}

/// Outcome of one call to [`ValueParser::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A complete value record.
    Value(Value),
    /// The `END\r\n` terminator.
    End,
    /// An `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR` line, which also
    /// terminates the response.
    Error(String),
    /// The window ends inside a record. See [`ValueParser::state`].
    Incomplete,
}

/// Streaming parser for bulk `get` responses.
#[derive(Debug)]
pub struct ValueParser {
    state: ParserState,
    key: Vec<u8>,
    flags: u32,
    len: usize,
    data: Vec<u8>,
    max_value_len: usize,
}

impl Default for ValueParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueParser {
    pub fn new() -> Self {
        Self::with_max_value_len(MAX_VALUE_LEN)
    }

    /// A parser that rejects values longer than `max` bytes.
    pub fn with_max_value_len(max: usize) -> Self {
        Self {
            state: ParserState::ValueDelimiter,
            key: Vec::new(),
            flags: 0,
            len: 0,
            data: Vec::new(),
            max_value_len: max,
        }
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    /// The token the parser will look for next.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// True when the parser holds no partial record.
    pub fn is_idle(&self) -> bool {
        self.state == ParserState::ValueDelimiter
    }

    /// Drop any partial record, e.g. after the connection was lost.
    pub fn reset(&mut self) {
        self.state = ParserState::ValueDelimiter;
        self.key.clear();
        self.flags = 0;
        self.len = 0;
        self.data = Vec::new();
    }

    /// Parse from the front of `window`.
    ///
    /// Returns the outcome and the number of bytes consumed. Consumed bytes
    /// belong to the parser and must not be offered again; any remaining
    /// bytes must be offered again, followed by newly received ones. On
    /// `Incomplete` some bytes may still have been consumed.
    pub fn parse(&mut self, window: &[u8]) -> Result<(Parsed, usize), ParseError> {
        let mut pos = 0;

        loop {
            let remaining = &window[pos..];

            match self.state {
                ParserState::ValueDelimiter => {
                    if remaining.starts_with(b"VALUE ") {
                        pos += 6;
                        self.state = ParserState::Key;
                        continue;
                    }
                    return parse_terminator(remaining).map(|(parsed, n)| (parsed, pos + n));
                }
                ParserState::Key => {
                    let Some(end) = remaining.iter().position(|&b| b == b' ') else {
                        if remaining.len() > MAX_KEY_LEN {
                            return Err(ParseError::KeyTooLong);
                        }
                        return Ok((Parsed::Incomplete, pos));
                    };
                    if end == 0 {
                        return Err(ParseError::Unexpected("empty key".to_string()));
                    }
                    if end > MAX_KEY_LEN {
                        return Err(ParseError::KeyTooLong);
                    }
                    self.key.clear();
                    self.key.extend_from_slice(&remaining[..end]);
                    pos += end + 1;
                    self.state = ParserState::Flags;
                }
                ParserState::Flags => {
                    let Some(end) = remaining.iter().position(|&b| b == b' ') else {
                        if remaining.len() > MAX_NUMBER_LEN {
                            return Err(ParseError::InvalidNumber(lossy(remaining)));
                        }
                        return Ok((Parsed::Incomplete, pos));
                    };
                    self.flags = parse_decimal(&remaining[..end])?;
                    pos += end + 1;
                    self.state = ParserState::Length;
                }
                ParserState::Length => {
                    let Some(end) = find(remaining, b"\r\n") else {
                        if remaining.len() > MAX_NUMBER_LEN * 2 {
                            return Err(ParseError::InvalidNumber(lossy(remaining)));
                        }
                        return Ok((Parsed::Incomplete, pos));
                    };
                    // `gets` would append a cas unique; only the length matters
                    let field = &remaining[..end];
                    let field = match field.iter().position(|&b| b == b' ') {
                        Some(space) => &field[..space],
                        None => field,
                    };
                    let len: usize = parse_decimal(field)?;
                    if len > self.max_value_len {
                        return Err(ParseError::ValueTooLarge {
                            len,
                            max: self.max_value_len,
                        });
                    }
                    let Some(total) = len.checked_add(2) else {
                        return Err(ParseError::InvalidNumber(lossy(field)));
                    };
                    self.len = len;
                    self.data = Vec::with_capacity(total.min(INITIAL_DATA_CAPACITY));
                    pos += end + 2;
                    self.state = ParserState::Data;
                }
                ParserState::Data => {
                    let needed = self.len + 2 - self.data.len();
                    let take = needed.min(remaining.len());
                    self.data.extend_from_slice(&remaining[..take]);
                    pos += take;

                    if self.data.len() < self.len + 2 {
                        return Ok((Parsed::Incomplete, pos));
                    }
                    if !self.data.ends_with(b"\r\n") {
                        return Err(ParseError::MissingTerminator);
                    }

                    self.data.truncate(self.len);
                    let value = Value {
                        key: std::mem::take(&mut self.key),
                        flags: self.flags,
                        data: std::mem::take(&mut self.data),
                    };
                    self.state = ParserState::ValueDelimiter;
                    return Ok((Parsed::Value(value), pos));
                }
            }
        }
    }
}

/// Recognize `END\r\n` or an error line at the front of `data`.
fn parse_terminator(data: &[u8]) -> Result<(Parsed, usize), ParseError> {
    const END: &[u8] = b"END\r\n";
    const PREFIXES: [&[u8]; 5] = [b"VALUE ", END, b"ERROR", b"CLIENT_ERROR", b"SERVER_ERROR"];

    if data.starts_with(END) {
        return Ok((Parsed::End, END.len()));
    }

    if data.starts_with(b"ERROR")
        || data.starts_with(b"CLIENT_ERROR")
        || data.starts_with(b"SERVER_ERROR")
    {
        return match find(data, b"\r\n") {
            Some(end) => {
                let message = String::from_utf8_lossy(&data[..end]).into_owned();
                Ok((Parsed::Error(message), end + 2))
            }
            None if data.len() > MAX_LINE_LEN => Err(ParseError::Unexpected(lossy(data))),
            None => Ok((Parsed::Incomplete, 0)),
        };
    }

    // a short window may still turn into one of the recognized prefixes
    let could_match = PREFIXES
        .iter()
        .any(|prefix| data.len() < prefix.len() && prefix.starts_with(data));
    if could_match {
        return Ok((Parsed::Incomplete, 0));
    }

    Err(ParseError::Unexpected(lossy(data)))
}

fn parse_decimal<T: std::str::FromStr>(bytes: &[u8]) -> Result<T, ParseError> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::InvalidNumber(lossy(bytes)));
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidNumber(lossy(bytes)))
}
