//! Dump the contents of a running memcached.
//!
//! A dump has two stages that run on a shared pool of worker threads. The
//! crawl task streams `lru_crawler metadump all` into size-bounded key files.
//! Each finished key file becomes a decode task, which fetches the values of
//! its keys with batched `get` commands and writes them to size-rotated,
//! MD5-suffixed data files. Progress is checkpointed per key file so an
//! interrupted dump can resume.
//!
//! ```no_run
//! use cachedump::{Config, Dumper};
//! use std::sync::Arc;
//!
//! let mut config = Config::default();
//! config.output.dir = "/var/tmp/dump".into();
//! let metrics = Dumper::new(Arc::new(config)).run()?;
//! println!("dumped {} keys", metrics.keyvalue_metrics.dumped);
//! # Ok::<(), cachedump::DumpError>(())
//! ```

pub mod banner;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod crawl;
pub mod decode;
pub mod dumper;
pub mod error;
pub mod fetch;
pub mod ketama;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod resume;
pub mod task;
pub mod upload;
pub mod writer;

pub use config::Config;
pub use dumper::Dumper;
pub use error::DumpError;
