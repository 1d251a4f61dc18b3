//! Top level of a dump run.

use crate::config::Config;
use crate::connection::ConnectionPool;
use crate::buffer_pool::BufferPool;
use crate::crawl::CrawlTask;
use crate::decode::DecodeTask;
use crate::error::Result;
use crate::ketama::KeyFilter;
use crate::layout::OutputLayout;
use crate::metrics::{DumpMetrics, MetricsSnapshot};
use crate::resume;
use crate::task::TaskEngine;
use crate::upload::{DirectoryUploader, Uploader};
use crate::writer::UploadTarget;
use std::sync::Arc;
use tracing::info;

/// Name prefix of worker threads; also names their checkpoint logs.
pub const WORKER_PREFIX: &str = "dump-worker";

/// Shared, read-only state handed to every task.
pub struct DumpContext {
    pub config: Arc<Config>,
    pub layout: OutputLayout,
    pub connections: ConnectionPool,
    pub buffers: BufferPool,
    pub filter: Option<KeyFilter>,
    pub metrics: Arc<DumpMetrics>,
    pub uploader: Option<Arc<dyn Uploader>>,
}

impl DumpContext {
    /// Upload destination for finished data files, if uploads are on.
    pub fn upload_target(&self) -> Option<UploadTarget> {
        let uploader = self.uploader.clone()?;
        let mut prefix = String::new();
        let path = self.config.upload.path.trim_matches('/');
        if !path.is_empty() {
            prefix.push_str(path);
            prefix.push('/');
        }
        prefix.push_str(&self.config.dump.req_id);
        prefix.push('/');
        Some(UploadTarget { uploader, prefix })
    }
}

pub struct Dumper {
    config: Arc<Config>,
    uploader: Option<Arc<dyn Uploader>>,
    metrics: Arc<DumpMetrics>,
}

impl Dumper {
    /// A dumper for `config`. When uploads are enabled the bundled
    /// [`DirectoryUploader`] is used unless another one is supplied.
    pub fn new(config: Arc<Config>) -> Self {
        let uploader = match (&config.upload.root, config.upload.enabled) {
            (Some(root), true) => Some(Arc::new(DirectoryUploader::new(
                root.clone(),
                config.upload.bucket.clone(),
            )) as Arc<dyn Uploader>),
            _ => None,
        };
        Self {
            config,
            uploader,
            metrics: Arc::new(DumpMetrics::new()),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Live counters, readable while the dump runs.
    pub fn metrics(&self) -> Arc<DumpMetrics> {
        self.metrics.clone()
    }

    /// Run the dump to completion.
    pub fn run(self) -> Result<MetricsSnapshot> {
        let config = self.config;
        config.validate()?;

        let layout = OutputLayout::new(&config.output.dir, &config.memcached.host);
        let plan = if config.dump.resume {
            let plan = resume::plan(&layout)?;
            if plan.is_none() {
                layout.clear()?;
            }
            plan
        } else {
            layout.create_fresh()?;
            None
        };

        let filter = if config.filter.is_enabled() {
            Some(KeyFilter::new(
                &config.filter.all_ips,
                &config.filter.dest_ips,
                config.filter.bucket_size,
            )?)
        } else {
            None
        };

        let threads = config.workers.threads;
        let buffers = BufferPool::preallocate(config.memory.chunk_size, config.chunk_count());
        let connections =
            ConnectionPool::prime(&config.server_address(), threads + 1, config.recv_timeout())?;

        let ctx = Arc::new(DumpContext {
            config: config.clone(),
            layout,
            connections,
            buffers,
            filter,
            metrics: self.metrics.clone(),
            uploader: self.uploader,
        });

        let engine = TaskEngine::start(threads, WORKER_PREFIX)?;
        match plan {
            Some(plan) => {
                for name in plan.remaining {
                    engine.submit(Box::new(DecodeTask::new(ctx.clone(), name)));
                }
            }
            None => engine.submit(Box::new(CrawlTask::new(ctx.clone()))),
        }
        engine.await_all()?;

        let snapshot = self.metrics.snapshot();
        ctx.layout
            .write_marker(&ctx.layout.done_path(), &self.metrics.to_json())?;
        info!(
            total = snapshot.keyvalue_metrics.total,
            dumped = snapshot.keyvalue_metrics.dumped,
            not_found = snapshot.keyvalue_metrics.not_found,
            skipped = snapshot.keyvalue_metrics.skipped,
            filtered = snapshot.keyvalue_metrics.filtered,
            elapsed = %snapshot.time_elapsed,
            "dump complete"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_upload_prefix() {
        let mut config = Config::default();
        config.upload.path = "/dumps/".to_string();
        config.dump.req_id = "r1".to_string();
        let dir = tempfile::tempdir().unwrap();
        let ctx = DumpContext {
            config: Arc::new(config),
            layout: OutputLayout::new(dir.path(), "h"),
            connections: ConnectionPool::prime("127.0.0.1:1", 0, Duration::from_secs(1)).unwrap(),
            buffers: BufferPool::preallocate(1024, 1),
            filter: None,
            metrics: Arc::new(DumpMetrics::new()),
            uploader: Some(Arc::new(DirectoryUploader::new(dir.path(), "b"))),
        };
        assert_eq!(ctx.upload_target().unwrap().prefix, "dumps/r1/");

        let ctx = DumpContext { uploader: None, ..ctx };
        assert!(ctx.upload_target().is_none());
    }

    #[test]
    fn test_fresh_run_refuses_used_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leftover"), b"x").unwrap();
        let mut config = Config::default();
        config.output.dir = dir.path().to_path_buf();
        let err = Dumper::new(Arc::new(config)).run().unwrap_err();
        assert!(matches!(err, crate::error::DumpError::Config(_)));
    }
}
