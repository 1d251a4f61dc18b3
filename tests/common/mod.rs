//! In-process fake memcached for integration tests.
//!
//! Speaks just enough of the text protocol for a dump: `lru_crawler metadump
//! all` and multi-key `get`. Responses are written in small pieces so the
//! client sees partial reads.

#![allow(dead_code)]

use cachedump::Config;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u32,
    /// `-1` for no expiry
    pub expiry: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Answer this many metadump requests with `BUSY`
    pub busy_responses: usize,
    /// Cut the first `get` response off after this many bytes
    pub drop_get_after: Option<usize>,
    /// Keys listed by metadump but not returned by `get`
    pub hidden: HashSet<String>,
    /// Bytes per socket write, 0 for one write
    pub write_size: usize,
    /// Cut this many metadump responses off, then answer in full
    pub cut_metadumps: usize,
    /// Bytes of a cut metadump response sent before closing
    pub metadump_cut_after: usize,
    /// A `get` naming any of these keys ends with `SERVER_ERROR` instead of
    /// `END`, after the values of the other keys
    pub error_keys: HashSet<String>,
}

struct Shared {
    items: Vec<Item>,
    behavior: Behavior,
    busy_left: AtomicUsize,
    cuts_left: AtomicUsize,
    drop_pending: AtomicBool,
    metadumps: AtomicU64,
    gets: AtomicU64,
    connections: AtomicU64,
    requested: Mutex<Vec<String>>,
}

pub struct FakeMemcached {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeMemcached {
    pub fn start(items: Vec<Item>, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            busy_left: AtomicUsize::new(behavior.busy_responses),
            cuts_left: AtomicUsize::new(behavior.cut_metadumps),
            drop_pending: AtomicBool::new(behavior.drop_get_after.is_some()),
            items,
            behavior,
            metadumps: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            requested: Mutex::new(Vec::new()),
        });

        let server = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                server.connections.fetch_add(1, Ordering::Relaxed);
                let shared = server.clone();
                thread::spawn(move || handle(stream, &shared));
            }
        });

        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metadumps(&self) -> u64 {
        self.shared.metadumps.load(Ordering::Relaxed)
    }

    pub fn gets(&self) -> u64 {
        self.shared.gets.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Every key named in a `get`, in arrival order.
    pub fn requested(&self) -> Vec<String> {
        self.shared.requested.lock().clone()
    }
}

fn handle(stream: TcpStream, shared: &Shared) {
    let _ = stream.set_nodelay(true);
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut out = stream;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end();

        if command == "lru_crawler metadump all" {
            shared.metadumps.fetch_add(1, Ordering::Relaxed);
            let busy = shared
                .busy_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            let response = if busy {
                b"BUSY currently processing crawler request\r\n".to_vec()
            } else {
                metadump(&shared.items)
            };
            let cut = !busy
                && shared
                    .cuts_left
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                    .is_ok();
            if cut {
                let end = shared.behavior.metadump_cut_after.min(response.len());
                let _ = send(&mut out, &response[..end], shared.behavior.write_size);
                let _ = out.shutdown(Shutdown::Both);
                return;
            }
            if send(&mut out, &response, shared.behavior.write_size).is_err() {
                return;
            }
        } else if let Some(keys) = command.strip_prefix("get ") {
            shared.gets.fetch_add(1, Ordering::Relaxed);
            let response = get_response(shared, keys);
            if shared.drop_pending.swap(false, Ordering::Relaxed) {
                let cut = shared.behavior.drop_get_after.unwrap_or(0).min(response.len());
                let _ = send(&mut out, &response[..cut], shared.behavior.write_size);
                let _ = out.shutdown(Shutdown::Both);
                return;
            }
            if send(&mut out, &response, shared.behavior.write_size).is_err() {
                return;
            }
        } else if send(&mut out, b"ERROR\r\n", 0).is_err() {
            return;
        }
    }
}

fn metadump(items: &[Item]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(
            format!(
                "key={} exp={} la=1700000000 cas=1 fetch=no cls=1 size={}\n",
                urlencoding::encode(&item.key),
                item.expiry,
                item.value.len()
            )
            .as_bytes(),
        );
    }
    out.extend_from_slice(b"END\r\n");
    out
}

fn get_response(shared: &Shared, keys: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut requested = shared.requested.lock();
    let mut failed = false;
    for key in keys.split(' ').filter(|k| !k.is_empty()) {
        requested.push(key.to_string());
        if shared.behavior.error_keys.contains(key) {
            failed = true;
            continue;
        }
        if shared.behavior.hidden.contains(key) {
            continue;
        }
        if let Some(item) = shared.items.iter().find(|i| i.key == key) {
            out.extend_from_slice(
                format!("VALUE {} {} {}\r\n", item.key, item.flags, item.value.len()).as_bytes(),
            );
            out.extend_from_slice(&item.value);
            out.extend_from_slice(b"\r\n");
        }
    }
    if failed {
        out.extend_from_slice(b"SERVER_ERROR out of memory storing object\r\n");
    } else {
        out.extend_from_slice(b"END\r\n");
    }
    out
}

fn send(out: &mut TcpStream, data: &[u8], write_size: usize) -> std::io::Result<()> {
    if write_size == 0 {
        return out.write_all(data);
    }
    for piece in data.chunks(write_size) {
        out.write_all(piece)?;
    }
    Ok(())
}

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// `count` items with varied value sizes, none expiring.
pub fn items(count: usize) -> Vec<Item> {
    (0..count)
        .map(|i| Item {
            key: format!("user:{:04}", i),
            value: (0..(i * 7) % 300 + 1).map(|j| b'a' + ((i + j) % 26) as u8).collect(),
            flags: (i % 4) as u32,
            expiry: -1,
        })
        .collect()
}

/// A configuration small enough to rotate every kind of file.
pub fn config(port: u16, dir: &Path) -> Config {
    let mut config = Config::default();
    config.memcached.port = port;
    config.memcached.recv_timeout_ms = 2000;
    config.memcached.reconnect_backoff_ms = 10;
    config.workers.threads = 2;
    config.memory.chunk_size = 2048;
    config.memory.limit = 16 * 1024;
    config.output.dir = dir.to_path_buf();
    config.output.key_file_size = 1024;
    config.output.data_file_size = 4096;
    config.dump.bulk_get_threshold = 8;
    config.crawl.retry_min_secs = 0;
    config.crawl.retry_max_secs = 0;
    config
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub expiry: i64,
    pub flags: u32,
    pub value: Vec<u8>,
}

/// Parse every record in one data file.
pub fn read_records(path: &Path) -> Vec<Record> {
    let data = fs::read(path).unwrap();
    let mut records = Vec::new();
    let mut rest = data.as_slice();
    while !rest.is_empty() {
        let header_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
        let header = std::str::from_utf8(&rest[..header_end]).unwrap();
        let fields: Vec<&str> = header.split(' ').collect();
        assert_eq!(fields.len(), 4, "bad header {:?}", header);
        let len: usize = fields[3].parse().unwrap();
        let value_start = header_end + 2;
        let value = rest[value_start..value_start + len].to_vec();
        assert_eq!(&rest[value_start + len..value_start + len + 2], b"\r\n");
        records.push(Record {
            key: fields[0].to_string(),
            expiry: fields[1].parse().unwrap(),
            flags: fields[2].parse().unwrap(),
            value,
        });
        rest = &rest[value_start + len + 2..];
    }
    records
}

/// Data files in a directory, skipping the run summary.
pub fn data_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("data_"))
        })
        .collect();
    files.sort();
    files
}

/// Every record in every data file of a directory.
pub fn read_all_records(dir: &Path) -> Vec<Record> {
    data_files(dir).iter().flat_map(|p| read_records(p)).collect()
}
