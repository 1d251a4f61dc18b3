//! Crawler: streams `lru_crawler metadump all` into size-bounded key files.
//!
//! The response is read into one pool buffer. Only whole lines are written, so
//! a key file never ends in the middle of a record; the trailing partial line
//! is moved to the front of the buffer before the next read. As each key file
//! is closed a [`DecodeTask`] is submitted for it. After the terminating
//! `END`, a marker file records that every key file exists.

use crate::decode::DecodeTask;
use crate::dumper::DumpContext;
use crate::error::{DumpError, IoResultExt, Result};
use crate::connection::Connection;
use crate::layout::OutputLayout;
use crate::task::{Task, Worker};
use protocol_memcache::Request;
use rand::Rng;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const END: &[u8] = b"END\r\n";

pub struct CrawlTask {
    ctx: Arc<DumpContext>,
}

impl CrawlTask {
    pub fn new(ctx: Arc<DumpContext>) -> Self {
        Self { ctx }
    }
}

impl Task for CrawlTask {
    fn name(&self) -> String {
        "crawl".to_string()
    }

    fn execute(self: Box<Self>, worker: &Worker) -> Result<()> {
        let ctx = &self.ctx;
        let mut conn = ctx
            .connections
            .acquire()
            .ok_or(DumpError::ConnectionPoolExhausted)?;
        let mut chunk = ctx.buffers.acquire().ok_or(DumpError::BufferPoolExhausted)?;
        let crawl = &ctx.config.crawl;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut sink = KeyFileSink::new(&ctx.layout, ctx.config.output.key_file_size as u64);
            let result = crawl_into(&mut conn, &mut chunk, &mut sink, &mut |name: String, lines: u64| {
                debug!(file = %name, lines, "key file complete");
                worker.submit(Box::new(DecodeTask::new(ctx.clone(), name)));
            });

            match result {
                Ok(()) => {
                    let files = sink.completed;
                    let marker = ctx.layout.key_files_done_path();
                    ctx.layout
                        .write_marker(&marker, &format!("{} key files dumped.\n", files))?;
                    info!(files, lines = sink.lines, "crawl complete");
                    return Ok(());
                }
                Err(e) if e.is_transient() && sink.completed == 0 && attempt < crawl.max_attempts => {
                    sink.abandon()?;
                    let delay =
                        rand::thread_rng().gen_range(crawl.retry_min_secs..=crawl.retry_max_secs);
                    warn!(error = %e, attempt, delay, "crawl failed, retrying");
                    std::thread::sleep(Duration::from_secs(delay));
                    conn.reconnect(
                        ctx.config.memcached.reconnect_attempts,
                        ctx.config.reconnect_backoff(),
                    )?;
                }
                Err(e) => {
                    if sink.completed > 0 && e.is_transient() {
                        warn!(
                            files = sink.completed,
                            "crawl interrupted after key files were handed off, not restarting"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Run one metadump, calling `on_file` with each finished key file's name and
/// line count.
pub fn crawl_into(
    conn: &mut Connection,
    buf: &mut [u8],
    sink: &mut KeyFileSink<'_>,
    on_file: &mut dyn FnMut(String, u64),
) -> Result<()> {
    conn.send(&Request::metadump_all().to_vec())?;

    let mut filled = 0;
    let mut first_line = true;
    loop {
        if filled == buf.len() {
            return Err(DumpError::Server(
                "metadump line does not fit in the receive buffer".to_string(),
            ));
        }
        filled += conn.recv(&mut buf[filled..])?;

        let Some(last_newline) = buf[..filled].iter().rposition(|b| *b == b'\n') else {
            continue;
        };
        let lines = &buf[..last_newline + 1];

        if first_line {
            check_first_line(lines)?;
            first_line = false;
        }

        let ended = is_terminated(lines);
        let body = if ended {
            &lines[..lines.len() - END.len()]
        } else {
            lines
        };
        sink.write_lines(body, on_file)?;

        buf.copy_within(last_newline + 1..filled, 0);
        filled -= last_newline + 1;

        if ended {
            if filled > 0 {
                warn!(bytes = filled, "discarding data after end of metadump");
            }
            return sink.finish(on_file);
        }
    }
}

/// The crawler answers `BUSY` while another crawl is running.
fn check_first_line(lines: &[u8]) -> Result<()> {
    let end = lines.iter().position(|b| *b == b'\n').unwrap_or(lines.len());
    let line = String::from_utf8_lossy(&lines[..end]);
    let line = line.trim_end();
    if line.starts_with("BUSY") {
        return Err(DumpError::CrawlerBusy);
    }
    if line.starts_with("ERROR") || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        return Err(DumpError::Server(line.to_string()));
    }
    Ok(())
}

fn is_terminated(lines: &[u8]) -> bool {
    lines.ends_with(END) && (lines.len() == END.len() || lines[lines.len() - END.len() - 1] == b'\n')
}

/// Writes whole lines into key files, starting a new one before a file would
/// exceed its size limit.
pub struct KeyFileSink<'a> {
    layout: &'a OutputLayout,
    max_file_size: u64,
    current: Option<OpenKeyFile>,
    next_index: usize,
    completed: usize,
    lines: u64,
}

struct OpenKeyFile {
    file: File,
    name: String,
    path: PathBuf,
    bytes: u64,
    lines: u64,
}

impl<'a> KeyFileSink<'a> {
    pub fn new(layout: &'a OutputLayout, max_file_size: u64) -> Self {
        Self {
            layout,
            max_file_size: max_file_size.max(1),
            current: None,
            next_index: 0,
            completed: 0,
            lines: 0,
        }
    }

    /// Key files closed so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// `data` must consist of whole lines.
    pub fn write_lines(&mut self, mut data: &[u8], on_file: &mut dyn FnMut(String, u64)) -> Result<()> {
        while !data.is_empty() {
            let room = match &self.current {
                Some(open) => self.max_file_size.saturating_sub(open.bytes) as usize,
                None => self.max_file_size as usize,
            };

            if data.len() <= room {
                self.append(data)?;
                return Ok(());
            }

            match data[..room].iter().rposition(|b| *b == b'\n') {
                Some(pos) => {
                    self.append(&data[..pos + 1])?;
                    data = &data[pos + 1..];
                    self.close(on_file)?;
                }
                None if self.current.as_ref().is_none_or(|open| open.bytes == 0) => {
                    // a single line longer than a whole file gets a file to itself
                    let end = data
                        .iter()
                        .position(|b| *b == b'\n')
                        .map_or(data.len(), |pos| pos + 1);
                    self.append(&data[..end])?;
                    data = &data[end..];
                    self.close(on_file)?;
                }
                None => self.close(on_file)?,
            }
        }
        Ok(())
    }

    /// Close the last key file, if any.
    pub fn finish(&mut self, on_file: &mut dyn FnMut(String, u64)) -> Result<()> {
        self.close(on_file)
    }

    /// Delete the key file being written.
    pub fn abandon(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            drop(open.file);
            fs::remove_file(&open.path).with_path(&open.path)?;
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.current.is_none() {
            let name = self.layout.key_file_name(self.next_index);
            let path = self.layout.key_file_path(&name);
            let file = File::create(&path).with_path(&path)?;
            self.next_index += 1;
            self.current = Some(OpenKeyFile {
                file,
                name,
                path,
                bytes: 0,
                lines: 0,
            });
        }
        let Some(open) = self.current.as_mut() else {
            unreachable!("a key file was just opened");
        };
        open.file.write_all(data).with_path(&open.path)?;
        open.bytes += data.len() as u64;
        open.lines += data.iter().filter(|b| **b == b'\n').count() as u64;
        Ok(())
    }

    fn close(&mut self, on_file: &mut dyn FnMut(String, u64)) -> Result<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        open.file.flush().with_path(&open.path)?;
        open.file.sync_all().with_path(&open.path)?;
        self.completed += 1;
        self.lines += open.lines;
        on_file(open.name, open.lines);
        Ok(())
    }
}
