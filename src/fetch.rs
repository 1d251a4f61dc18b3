//! Bulk retrieval of values for a stream of keys.
//!
//! Keys enter as `Pending`. Once enough are pending, one `get` command is
//! issued for a batch of them and they become `AwaitingValue`. The response is
//! read into a single fixed buffer and parsed incrementally; a partial token at
//! the end of the buffer is moved to the front before the next read. Values
//! that arrive move their key to `Complete`. When the response ends, keys the
//! server did not return go back to `Pending` until they run out of attempts
//! and become `Missing`.
//!
//! Completed values are appended to a [`RotatingWriter`] as
//! `<key> <expiry> <flags> <len>\r\n<value>\r\n` once they add up to a buffer's
//! worth, and on [`ValueFetcher::finalize`].
//!
//! Completed values live on the heap until they are written, so a fetcher
//! holds at most about one buffer's worth of them plus one value of up to
//! `max_item_size` bytes. A larger value from the server fails the dump.

use crate::connection::Connection;
use crate::error::{DumpError, Result};
use crate::config::Config;
use crate::writer::{FinalizedFile, RotatingWriter};
use bytes::Bytes;
use protocol_memcache::{ParseError, Parsed, Request, Value, ValueParser, MAX_KEY_LEN};
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::io::IoSlice;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Consecutive broken connections tolerated within a single round.
const MAX_BROKEN_ROUNDS: u32 = 5;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Pending keys that trigger a `get`, and the most keys per command
    pub bulk_get_threshold: usize,
    /// Responses without the key before it is declared missing
    pub max_get_attempts: u32,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    /// Largest value payload accepted from the server
    pub max_item_size: usize,
}

impl FetchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bulk_get_threshold: config.dump.bulk_get_threshold,
            max_get_attempts: config.dump.max_get_attempts,
            reconnect_attempts: config.memcached.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff(),
            max_item_size: config.dump.max_item_size,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            bulk_get_threshold: 30,
            max_get_attempts: 3,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(1000),
            max_item_size: 1024 * 1024,
        }
    }
}

/// Where a key is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    Pending,
    AwaitingValue,
    Complete { flags: u32, data: Bytes },
    Missing,
}

#[derive(Debug)]
struct Entry {
    expiry: i64,
    attempts: u32,
    state: KeyState,
}

/// Counters for one fetcher.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    /// Distinct keys accepted
    pub enqueued: u64,
    /// Records written to data files
    pub written: u64,
    /// Keys given up on after `max_get_attempts`
    pub missing: u64,
    /// Keys that cannot be sent in a `get` command
    pub rejected: u64,
    /// Keys enqueued again while already tracked
    pub duplicates: u64,
    /// Record bytes written
    pub bytes: u64,
    /// `get` commands sent
    pub rounds: u64,
    pub reconnects: u64,
}

/// Fetches values over one connection, using one buffer, into one writer.
pub struct ValueFetcher<'a> {
    conn: &'a mut Connection,
    buf: &'a mut [u8],
    filled: usize,
    parser: ValueParser,
    writer: RotatingWriter,
    options: FetchOptions,
    entries: HashMap<Vec<u8>, Entry>,
    pending: usize,
    in_flight: bool,
    complete_bytes: usize,
    stats: FetchStats,
}

impl<'a> ValueFetcher<'a> {
    pub fn new(
        conn: &'a mut Connection,
        buf: &'a mut [u8],
        writer: RotatingWriter,
        options: FetchOptions,
    ) -> Self {
        Self {
            conn,
            buf,
            filled: 0,
            parser: ValueParser::with_max_value_len(options.max_item_size),
            writer,
            options,
            entries: HashMap::new(),
            pending: 0,
            in_flight: false,
            complete_bytes: 0,
            stats: FetchStats::default(),
        }
    }

    /// Open the first data file.
    pub fn init(&mut self) -> Result<()> {
        self.writer.init()
    }

    /// Add a key to fetch. Issues a `get` round once enough keys are pending.
    ///
    /// A key that is already tracked is ignored.
    pub fn enqueue(&mut self, key: Vec<u8>, expiry: i64) -> Result<()> {
        if !is_valid_key(&key) {
            warn!(key = %String::from_utf8_lossy(&key), "key cannot be requested, skipping");
            self.stats.rejected += 1;
            return Ok(());
        }

        match self.entries.entry(key) {
            MapEntry::Occupied(_) => {
                self.stats.duplicates += 1;
                return Ok(());
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    expiry,
                    attempts: 0,
                    state: KeyState::Pending,
                });
            }
        }
        self.pending += 1;
        self.stats.enqueued += 1;

        if self.pending >= self.options.bulk_get_threshold {
            self.round(false)?;
        }
        Ok(())
    }

    /// Fetch every remaining key, write everything, and close the writer.
    pub fn finalize(mut self) -> Result<(FetchStats, Vec<FinalizedFile>)> {
        while !self.entries.is_empty() {
            self.round(true)?;
        }
        self.writer.finish()?;

        let stats = self.stats;
        if stats.enqueued != stats.written + stats.missing {
            warn!(
                enqueued = stats.enqueued,
                written = stats.written,
                missing = stats.missing,
                "key accounting mismatch"
            );
        }
        Ok((stats, self.writer.finalized().to_vec()))
    }

    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    pub fn key_state(&self, key: &[u8]) -> Option<&KeyState> {
        self.entries.get(key).map(|e| &e.state)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Keys still tracked in any state.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    fn round(&mut self, flush: bool) -> Result<()> {
        let mut broken = 0;
        loop {
            match self.try_round(flush) {
                Ok(()) => return Ok(()),
                Err(DumpError::ConnectionBroken(reason)) => {
                    broken += 1;
                    warn!(addr = self.conn.addr(), %reason, broken, "connection broken during get");
                    if broken > MAX_BROKEN_ROUNDS {
                        return Err(DumpError::ConnectionBroken(reason));
                    }
                    self.recover()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_round(&mut self, flush: bool) -> Result<()> {
        if !self.in_flight {
            self.issue()?;
        }
        while self.in_flight {
            self.receive()?;
            self.parse()?;
            if self.complete_bytes >= self.buf.len() {
                self.write_complete()?;
            }
        }
        self.demote();
        if flush || self.complete_bytes >= self.buf.len() {
            self.write_complete()?;
        }
        Ok(())
    }

    /// Send a `get` for up to `bulk_get_threshold` pending keys.
    fn issue(&mut self) -> Result<()> {
        let batch: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == KeyState::Pending)
            .take(self.options.bulk_get_threshold.max(1))
            .map(|(k, _)| k.clone())
            .collect();
        if batch.is_empty() {
            return Ok(());
        }

        let keys: Vec<&[u8]> = batch.iter().map(Vec::as_slice).collect();
        let command = Request::gets(&keys).to_vec();
        self.conn.send(&command)?;

        for key in &batch {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.state = KeyState::AwaitingValue;
            }
        }
        self.pending -= batch.len();
        self.in_flight = true;
        self.stats.rounds += 1;
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        if self.filled == self.buf.len() {
            return Err(ParseError::Unexpected(
                "response token does not fit in the receive buffer".to_string(),
            )
            .into());
        }
        let n = self.conn.recv(&mut self.buf[self.filled..])?;
        self.filled += n;
        Ok(())
    }

    /// Consume everything parseable in the buffer, keeping any partial token.
    fn parse(&mut self) -> Result<()> {
        let mut offset = 0;
        loop {
            let (parsed, consumed) = match self.parser.parse(&self.buf[offset..self.filled]) {
                Ok(result) => result,
                Err(e @ ParseError::ValueTooLarge { .. }) => {
                    error!(addr = self.conn.addr(), "{}; raise dump.max_item_size to dump it", e);
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            offset += consumed;
            match parsed {
                Parsed::Value(value) => self.complete(value)?,
                Parsed::End => {
                    self.in_flight = false;
                    break;
                }
                Parsed::Error(message) => {
                    warn!(addr = self.conn.addr(), %message, "server rejected get");
                    self.in_flight = false;
                    break;
                }
                Parsed::Incomplete => break,
            }
        }

        if !self.in_flight && offset < self.filled {
            warn!(bytes = self.filled - offset, "discarding data after end of response");
            offset = self.filled;
        }
        self.buf.copy_within(offset..self.filled, 0);
        self.filled -= offset;
        Ok(())
    }

    fn complete(&mut self, value: Value) -> Result<()> {
        let Some(entry) = self.entries.get_mut(&value.key) else {
            return Err(DumpError::UnknownKey(
                String::from_utf8_lossy(&value.key).into_owned(),
            ));
        };
        if entry.state != KeyState::AwaitingValue {
            return Err(DumpError::UnknownKey(
                String::from_utf8_lossy(&value.key).into_owned(),
            ));
        }
        self.complete_bytes += value.key.len() + value.data.len() + 32;
        entry.state = KeyState::Complete {
            flags: value.flags,
            data: Bytes::from(value.data),
        };
        Ok(())
    }

    /// Keys left waiting after a full response were not returned.
    fn demote(&mut self) {
        let max_attempts = self.options.max_get_attempts.max(1);
        for entry in self.entries.values_mut() {
            if entry.state != KeyState::AwaitingValue {
                continue;
            }
            entry.attempts += 1;
            if entry.attempts >= max_attempts {
                entry.state = KeyState::Missing;
            } else {
                entry.state = KeyState::Pending;
                self.pending += 1;
            }
        }

        let stats = &mut self.stats;
        self.entries.retain(|key, entry| {
            if entry.state == KeyState::Missing {
                debug!(key = %String::from_utf8_lossy(key), "key not found");
                stats.missing += 1;
                false
            } else {
                true
            }
        });
    }

    /// Write every complete value and stop tracking its key.
    fn write_complete(&mut self) -> Result<()> {
        let done: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, KeyState::Complete { .. }))
            .map(|(k, _)| k.clone())
            .collect();
        if done.is_empty() {
            self.complete_bytes = 0;
            return Ok(());
        }

        let mut records = Vec::with_capacity(done.len());
        for key in done {
            if let Some(entry) = self.entries.remove(&key) {
                if let KeyState::Complete { flags, data } = entry.state {
                    let mut header = key;
                    header.extend_from_slice(
                        format!(" {} {} {}\r\n", entry.expiry, flags, data.len()).as_bytes(),
                    );
                    records.push((header, data));
                }
            }
        }

        let mut slices = Vec::with_capacity(records.len() * 3);
        for (header, data) in &records {
            slices.push(IoSlice::new(header));
            slices.push(IoSlice::new(data));
            slices.push(IoSlice::new(b"\r\n"));
        }
        let written = self.writer.write_vectored(&slices)?;

        self.stats.written += records.len() as u64;
        self.stats.bytes += written as u64;
        self.complete_bytes = 0;
        Ok(())
    }

    /// Reconnect and put every key of the interrupted round back in line.
    fn recover(&mut self) -> Result<()> {
        self.conn
            .reconnect(self.options.reconnect_attempts, self.options.reconnect_backoff)?;
        self.parser.reset();
        self.filled = 0;
        self.in_flight = false;
        for entry in self.entries.values_mut() {
            if entry.state == KeyState::AwaitingValue {
                entry.state = KeyState::Pending;
                self.pending += 1;
            }
        }
        self.stats.reconnects += 1;
        Ok(())
    }
}

fn is_valid_key(key: &[u8]) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.iter().all(|b| b.is_ascii_graphic() || *b >= 0x80)
}
