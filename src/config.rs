//! Dump configuration.
//!
//! Loaded once from a TOML file at startup, validated, and then shared
//! read-only (behind an `Arc`) with every component of a run.

use crate::error::DumpError;
use protocol_memcache::MAX_VALUE_LEN;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest chunk that still holds any metadump line or value header.
pub const MIN_CHUNK_SIZE: usize = 2 * 1024;

/// Upper bound on worker threads.
pub const MAX_THREADS: usize = 48;

/// Smallest accepted `dump.max_item_size`.
pub const MIN_ITEM_SIZE: usize = 1024;

/// Dump configuration loaded from TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The server to dump
    #[serde(default)]
    pub memcached: MemcachedConfig,

    /// Worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Socket buffer memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Where and how files are written
    pub output: OutputConfig,

    /// Key selection and fetch behavior
    #[serde(default)]
    pub dump: DumpConfig,

    /// Crawler retry behavior
    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Restrict the dump to keys owned by some instances
    #[serde(default)]
    pub filter: FilterConfig,

    /// Object storage target for finished data files
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for the server being dumped.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemcachedConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Socket receive timeout in milliseconds
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Reconnect attempts before a broken connection is fatal
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// First reconnect delay in milliseconds, doubled per attempt
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            recv_timeout_ms: default_recv_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

/// Socket buffer memory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Size of one socket buffer (e.g., "1MB", "64KB")
    #[serde(default = "default_chunk_size", deserialize_with = "deserialize_size")]
    pub chunk_size: usize,

    /// Total memory for socket buffers (e.g., "64MB")
    #[serde(default = "default_memory_limit", deserialize_with = "deserialize_size")]
    pub limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            limit: default_memory_limit(),
        }
    }
}

/// Output files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Root directory for key files, data files and markers
    pub dir: PathBuf,

    /// Rotation threshold for key files
    #[serde(default = "default_key_file_size", deserialize_with = "deserialize_size")]
    pub key_file_size: usize,

    /// Rotation threshold for data files
    #[serde(default = "default_data_file_size", deserialize_with = "deserialize_size")]
    pub data_file_size: usize,

    /// Suffix finished data files with their MD5 digest
    #[serde(default = "default_true")]
    pub checksum: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("dump"),
            key_file_size: default_key_file_size(),
            data_file_size: default_data_file_size(),
            checksum: true,
        }
    }
}

/// Key selection and fetch behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpConfig {
    /// Identifies this dump in upload paths
    #[serde(default = "default_req_id")]
    pub req_id: String,

    /// Keys per `get` command
    #[serde(default = "default_bulk_get_threshold")]
    pub bulk_get_threshold: usize,

    /// Keys expiring within this many seconds are skipped
    #[serde(default = "default_only_expire_after_secs")]
    pub only_expire_after_secs: i64,

    /// Continue a previous run from its checkpoints
    #[serde(default)]
    pub resume: bool,

    /// Gets that may come back without a key before it counts as missing
    #[serde(default = "default_max_get_attempts")]
    pub max_get_attempts: u32,

    /// Largest value accepted from the server; a larger one fails the dump
    #[serde(default = "default_max_item_size", deserialize_with = "deserialize_size")]
    pub max_item_size: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            req_id: default_req_id(),
            bulk_get_threshold: default_bulk_get_threshold(),
            only_expire_after_secs: default_only_expire_after_secs(),
            resume: false,
            max_get_attempts: default_max_get_attempts(),
            max_item_size: default_max_item_size(),
        }
    }
}

/// Crawler retry behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlConfig {
    #[serde(default = "default_crawl_retry_min_secs")]
    pub retry_min_secs: u64,

    #[serde(default = "default_crawl_retry_max_secs")]
    pub retry_max_secs: u64,

    #[serde(default = "default_crawl_max_attempts")]
    pub max_attempts: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            retry_min_secs: default_crawl_retry_min_secs(),
            retry_max_secs: default_crawl_retry_max_secs(),
            max_attempts: default_crawl_max_attempts(),
        }
    }
}

/// Consistent-hash filter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Instances whose keys are kept (`host:port`)
    #[serde(default)]
    pub dest_ips: Vec<String>,

    /// Every instance of the cluster, in ring order (`host:port`)
    #[serde(default)]
    pub all_ips: Vec<String>,

    /// Ring points per instance, four per digest
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dest_ips: Vec::new(),
            all_ips: Vec::new(),
            bucket_size: default_bucket_size(),
        }
    }
}

impl FilterConfig {
    pub fn is_enabled(&self) -> bool {
        !self.dest_ips.is_empty()
    }
}

/// Object storage target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Mount point of the object store
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub bucket: String,

    /// Prefix inside the bucket
    #[serde(default)]
    pub path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the module target
    #[serde(default)]
    pub target: bool,

    /// Include thread names
    #[serde(default = "default_true")]
    pub thread_names: bool,

    /// Write logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-field output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
    /// Single-line human-readable output
    Compact,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11211
}

fn default_recv_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_threads() -> usize {
    4
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_memory_limit() -> usize {
    64 * 1024 * 1024
}

fn default_key_file_size() -> usize {
    64 * 1024 * 1024
}

fn default_data_file_size() -> usize {
    256 * 1024 * 1024
}

fn default_req_id() -> String {
    "local".to_string()
}

fn default_bulk_get_threshold() -> usize {
    30
}

fn default_only_expire_after_secs() -> i64 {
    9000
}

fn default_max_get_attempts() -> u32 {
    3
}

fn default_max_item_size() -> usize {
    1024 * 1024
}

fn default_crawl_retry_min_secs() -> u64 {
    3
}

fn default_crawl_retry_max_secs() -> u64 {
    19
}

fn default_crawl_max_attempts() -> u32 {
    20
}

fn default_bucket_size() -> u32 {
    160
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64KB", "1MB", "4GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

/// Format a size in bytes as a human-readable string.
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;

    if bytes >= GB && bytes.is_multiple_of(GB) {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB && bytes.is_multiple_of(MB) {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes.is_multiple_of(KB) {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memcached: MemcachedConfig::default(),
            workers: WorkersConfig::default(),
            memory: MemoryConfig::default(),
            output: OutputConfig::default(),
            dump: DumpConfig::default(),
            crawl: CrawlConfig::default(),
            filter: FilterConfig::default(),
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, DumpError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| DumpError::file(path, e))?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| DumpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), DumpError> {
        let fail = |msg: String| Err(DumpError::Config(msg));

        if self.memcached.host.is_empty() {
            return fail("memcached.host must not be empty".into());
        }

        if self.memcached.port == 0 {
            return fail("memcached.port must not be 0".into());
        }

        if self.workers.threads == 0 || self.workers.threads > MAX_THREADS {
            return fail(format!(
                "workers.threads ({}) must be between 1 and {}",
                self.workers.threads, MAX_THREADS
            ));
        }

        if self.memory.chunk_size < MIN_CHUNK_SIZE {
            return fail(format!(
                "memory.chunk_size ({}) must be at least {}",
                format_size(self.memory.chunk_size),
                format_size(MIN_CHUNK_SIZE)
            ));
        }

        let required = self.required_chunks() * self.memory.chunk_size;
        if self.memory.limit < required {
            return fail(format!(
                "memory.limit ({}) must hold two chunks per worker plus one for the crawler ({})",
                format_size(self.memory.limit),
                format_size(required)
            ));
        }

        if self.output.key_file_size == 0 || self.output.data_file_size == 0 {
            return fail("output file sizes must be positive".into());
        }

        if self.dump.bulk_get_threshold == 0 {
            return fail("dump.bulk_get_threshold must be positive".into());
        }

        if self.dump.max_get_attempts == 0 {
            return fail("dump.max_get_attempts must be positive".into());
        }

        if self.dump.max_item_size < MIN_ITEM_SIZE || self.dump.max_item_size > MAX_VALUE_LEN {
            return fail(format!(
                "dump.max_item_size ({}) must be between {} and {}",
                format_size(self.dump.max_item_size),
                format_size(MIN_ITEM_SIZE),
                format_size(MAX_VALUE_LEN)
            ));
        }

        if self.dump.req_id.is_empty() || self.dump.req_id.contains('/') {
            return fail("dump.req_id must be a non-empty path segment".into());
        }

        if self.crawl.retry_min_secs > self.crawl.retry_max_secs {
            return fail("crawl.retry_min_secs must not exceed crawl.retry_max_secs".into());
        }

        if !self.filter.dest_ips.is_empty() && self.filter.all_ips.is_empty() {
            return fail("filter.dest_ips requires filter.all_ips".into());
        }

        if self.upload.enabled && (self.upload.root.is_none() || self.upload.bucket.is_empty()) {
            return fail("upload requires both upload.root and upload.bucket".into());
        }

        Ok(())
    }

    /// Chunks the buffer pool must hold for the configured thread count.
    pub fn required_chunks(&self) -> usize {
        2 * self.workers.threads + 1
    }

    /// Number of chunks the memory limit pays for.
    pub fn chunk_count(&self) -> usize {
        self.memory.limit / self.memory.chunk_size
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.memcached.recv_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.memcached.reconnect_backoff_ms)
    }

    /// `host:port` of the server being dumped.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.memcached.host, self.memcached.port)
    }
}
