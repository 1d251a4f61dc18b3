//! Decoder: turns one key file into one or more data files.
//!
//! Each metadump record is checked against the expiry horizon and the key
//! filter; survivors go to a [`ValueFetcher`]. When the key file is exhausted
//! the fetcher is drained, the key file is appended to this worker's
//! checkpoint log, and the run metrics are updated.

use crate::dumper::DumpContext;
use crate::error::{DumpError, IoResultExt, Result};
use crate::fetch::{FetchOptions, FetchStats, ValueFetcher};
use crate::metrics::DumpMetrics;
use crate::task::{Task, Worker};
use crate::writer::{RotatingWriter, WriterOptions};
use protocol_memcache::{MetadumpLine, MetadumpRecord, ParseError, parse_metadump_line};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub struct DecodeTask {
    ctx: Arc<DumpContext>,
    key_file: String,
}

impl DecodeTask {
    pub fn new(ctx: Arc<DumpContext>, key_file: String) -> Self {
        Self { ctx, key_file }
    }
}

impl Task for DecodeTask {
    fn name(&self) -> String {
        format!("decode {}", self.key_file)
    }

    fn execute(self: Box<Self>, worker: &Worker) -> Result<()> {
        let ctx = &self.ctx;
        let config = &ctx.config;

        let mut conn = ctx
            .connections
            .acquire()
            .ok_or(DumpError::ConnectionPoolExhausted)?;
        let mut read_buf = ctx.buffers.acquire().ok_or(DumpError::BufferPoolExhausted)?;
        let mut fetch_buf = ctx.buffers.acquire().ok_or(DumpError::BufferPoolExhausted)?;

        let writer = RotatingWriter::new(WriterOptions {
            staging_dir: ctx.layout.staging_dir(),
            dest_dir: ctx.layout.completed_dir(),
            prefix: ctx.layout.data_prefix(&self.key_file),
            max_file_size: config.output.data_file_size as u64,
            checksum: config.output.checksum,
            upload: ctx.upload_target(),
        });
        let mut fetcher = ValueFetcher::new(
            &mut *conn,
            &mut *fetch_buf,
            writer,
            FetchOptions::from_config(config),
        );
        fetcher.init()?;

        let gate = Gate {
            horizon: unix_now() + config.dump.only_expire_after_secs,
            ctx,
        };
        let path = ctx.layout.key_file_path(&self.key_file);
        let mut file = File::open(&path).with_path(&path)?;

        let mut records = 0u64;
        let mut unrecognized = 0u64;
        let mut filled = 0;
        loop {
            if filled == read_buf.len() {
                return Err(ParseError::Unexpected(format!(
                    "line in {} does not fit in the read buffer",
                    self.key_file
                ))
                .into());
            }
            let n = match file.read(&mut read_buf[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(DumpError::file(&path, e)),
            };
            if n == 0 {
                break;
            }
            filled += n;

            let mut offset = 0;
            loop {
                let (line, consumed) = parse_metadump_line(&read_buf[offset..filled]);
                offset += consumed;
                match line {
                    MetadumpLine::Record(record) => {
                        records += 1;
                        gate.admit(record, &mut fetcher)?;
                    }
                    MetadumpLine::End => {}
                    MetadumpLine::Unrecognized => unrecognized += 1,
                    MetadumpLine::Incomplete => break,
                }
            }
            read_buf.copy_within(offset..filled, 0);
            filled -= offset;
        }
        if filled > 0 {
            warn!(file = %self.key_file, bytes = filled, "ignoring unterminated last line");
        }

        let (stats, files) = fetcher.finalize()?;
        record_stats(&ctx.metrics, records, &stats);
        ctx.layout.append_checkpoint(worker.name(), &self.key_file)?;
        ctx.metrics.inc_key_files_processed();

        info!(
            file = %self.key_file,
            records,
            dumped = stats.written,
            not_found = stats.missing,
            data_files = files.len(),
            "key file processed"
        );
        if unrecognized > 0 {
            debug!(file = %self.key_file, unrecognized, "skipped unrecognized lines");
        }
        Ok(())
    }
}

/// Decides which records are fetched.
struct Gate<'a> {
    /// Records expiring at or before this time are skipped
    horizon: i64,
    ctx: &'a DumpContext,
}

impl Gate<'_> {
    fn admit(&self, record: MetadumpRecord, fetcher: &mut ValueFetcher<'_>) -> Result<()> {
        if expires_before(record.expiry, self.horizon) {
            self.ctx.metrics.inc_skipped();
            return Ok(());
        }
        if let Some(filter) = &self.ctx.filter {
            if filter.filter(&record.key) {
                self.ctx.metrics.inc_filtered();
                return Ok(());
            }
        }
        fetcher.enqueue(record.key, record.expiry)
    }
}

/// `-1` never expires.
pub fn expires_before(expiry: i64, horizon: i64) -> bool {
    expiry != -1 && expiry <= horizon
}

fn record_stats(metrics: &DumpMetrics, records: u64, stats: &FetchStats) {
    metrics.add_total(records);
    metrics.add_dumped(stats.written);
    metrics.add_not_found(stats.missing);
    metrics.add_bytes_written(stats.bytes);
    metrics.add_skipped(stats.rejected + stats.duplicates);
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
