//! cachedump binary.

use cachedump::banner::{BannerConfig, print_banner};
use cachedump::{Config, Dumper, logging};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cachedump")]
#[command(about = "Dump the contents of a running memcached to disk")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Continue an interrupted dump in the configured output directory
    #[arg(long)]
    resume: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a config path or use --print-config");
            std::process::exit(1);
        }
    };
    if args.resume {
        config.dump.resume = true;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    print_banner(&BannerConfig {
        version: env!("CARGO_PKG_VERSION"),
        config: &config,
    });

    match Dumper::new(Arc::new(config)).run() {
        Ok(metrics) => {
            tracing::info!(
                dumped = metrics.keyvalue_metrics.dumped,
                elapsed = %metrics.time_elapsed,
                "finished"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "dump failed");
            std::process::exit(1);
        }
    }
}

fn print_default_config() {
    let config = r#"# cachedump configuration

[memcached]
host = "127.0.0.1"
port = 11211
# Receive timeout; a read is retried 3 times before the connection is
# considered broken
recv_timeout_ms = 2000
# Reconnect attempts after a broken connection, with doubling backoff
reconnect_attempts = 5
reconnect_backoff_ms = 1000

[workers]
# Decode tasks run in parallel on this many threads (1-48)
threads = 4

[memory]
# Size of each I/O buffer
chunk_size = "1MB"
# Total buffer memory; must hold (2 * threads + 1) chunks
limit = "64MB"

[output]
dir = "/var/tmp/cachedump"
# Key files are rotated at line boundaries once they reach this size
key_file_size = "64MB"
# Data files are rotated once they grow past this size
data_file_size = "256MB"
# Append the MD5 of each data file to its name
checksum = true

[dump]
# Identifies this dump in uploaded object names
req_id = "local"
# Keys per get command
bulk_get_threshold = 30
# Skip keys expiring within this many seconds
only_expire_after_secs = 9000
# Continue a previous dump in the same output directory
resume = false
# Responses without a key before it is counted as not found
max_get_attempts = 3
# Largest value accepted; a larger one fails the dump
max_item_size = "1MB"

[crawl]
# Random pause between crawl attempts while the crawler is busy
retry_min_secs = 3
retry_max_secs = 19
max_attempts = 20

[filter]
# Keep only keys that consistent hashing over all_ips assigns to dest_ips
# all_ips = ["10.0.0.1:11211", "10.0.0.2:11211"]
# dest_ips = ["10.0.0.1:11211"]
bucket_size = 160

[upload]
# Copy finished data files to <root>/<bucket>/<path>/<req_id>/
enabled = false
# root = "/mnt/objects"
# bucket = "cache-dumps"
# path = "memcached"

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty" (human-readable), "json", or "compact"
format = "pretty"
timestamps = true
thread_names = true
target = false
# Write logs to a file instead of stdout
# file = "/var/log/cachedump.log"
"#;
    print!("{}", config);
}
