//! Parser for `lru_crawler metadump` output lines.
//!
//! Each item is reported on its own line:
//!
//! ```text
//! key=foo%20bar exp=1700000000 la=1699999999 cas=12 fetch=no cls=1 size=68\n
//! ```
//!
//! Keys are percent-encoded by the server. An `exp` of `-1` means the item
//! never expires. The stream ends with an `END` line.

use crate::find;

/// One item reported by the crawler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadumpRecord {
    /// The decoded key.
    pub key: Vec<u8>,
    /// Absolute expiry time in unix seconds, or -1 for no expiry.
    pub expiry: i64,
    /// Last access time in unix seconds.
    pub last_access: i64,
}

/// Result of parsing one line from the front of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadumpLine {
    /// A complete item record.
    Record(MetadumpRecord),
    /// The `END` terminator line.
    End,
    /// A complete line that is not an item record (blank lines, error
    /// replies, lines missing one of the required fields).
    Unrecognized,
    /// No complete line is available; the window must be extended with
    /// more bytes before parsing again.
    Incomplete,
}

/// Parse the first line of `window`.
///
/// Returns the parsed line and the number of bytes consumed. A line is only
/// parsed once its terminating `\n` is in the window, so a record is never
/// split across two calls. On `Incomplete` nothing is consumed and the caller
/// should move the window to the start of its buffer and append the next read.
pub fn parse_metadump_line(window: &[u8]) -> (MetadumpLine, usize) {
    let Some(newline) = window.iter().position(|&b| b == b'\n') else {
        return (MetadumpLine::Incomplete, 0);
    };
    let consumed = newline + 1;

    let mut line = &window[..newline];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }

    if line == b"END" {
        return (MetadumpLine::End, consumed);
    }

    match parse_record(line) {
        Some(record) => (MetadumpLine::Record(record), consumed),
        None => (MetadumpLine::Unrecognized, consumed),
    }
}

fn parse_record(line: &[u8]) -> Option<MetadumpRecord> {
    let key_start = find(line, b"key=")? + 4;
    let rest = &line[key_start..];

    let exp_pos = find(rest, b"exp=")?;
    let encoded_key = trim_trailing_spaces(&rest[..exp_pos]);
    let rest = &rest[exp_pos + 4..];

    let la_pos = find(rest, b"la=")?;
    let expiry = parse_field(&rest[..la_pos])?;
    let last_access = parse_field(&rest[la_pos + 3..])?;

    if encoded_key.is_empty() {
        return None;
    }

    Some(MetadumpRecord {
        key: percent_decode(encoded_key),
        expiry,
        last_access,
    })
}

/// Parse a signed decimal field that ends at the next space or the end of
/// the line.
fn parse_field(bytes: &[u8]) -> Option<i64> {
    let end = bytes.iter().position(|&b| b == b' ').unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).ok()?.parse().ok()
}

fn trim_trailing_spaces(mut bytes: &[u8]) -> &[u8] {
    while let Some(stripped) = bytes.strip_suffix(b" ") {
        bytes = stripped;
    }
    bytes
}

/// Decode a percent-encoded key: `%XX` becomes the byte `0xXX` and `+`
/// becomes a space. A `%` that does not start a valid escape is kept as is.
pub fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'%' => {
                let hi = input.get(i + 1).copied().and_then(hex_value);
                let lo = input.get(i + 2).copied().and_then(hex_value);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(hi << 4 | lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
