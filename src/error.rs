use std::path::PathBuf;

/// Errors that end a dump run.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid key filter: {0}")]
    Filter(String),
    #[error("connection broken: {0}")]
    ConnectionBroken(String),
    #[error("crawler busy")]
    CrawlerBusy,
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol_memcache::ParseError),
    #[error("server error: {0}")]
    Server(String),
    #[error("response names a key that was not requested: {0}")]
    UnknownKey(String),
    #[error("buffer pool exhausted")]
    BufferPoolExhausted,
    #[error("connection pool exhausted")]
    ConnectionPoolExhausted,
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

impl DumpError {
    /// Attach a path to an I/O error.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DumpError::File {
            path: path.into(),
            source,
        }
    }

    /// Errors a task may retry after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, DumpError::ConnectionBroken(_) | DumpError::CrawlerBusy)
    }
}

/// Extension for attaching a path to `io::Result`s.
pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> std::result::Result<T, DumpError>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> std::result::Result<T, DumpError> {
        self.map_err(|e| DumpError::file(path, e))
    }
}

pub type Result<T> = std::result::Result<T, DumpError>;
