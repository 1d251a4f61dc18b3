//! Object storage hand-off for finished data files.

use crate::error::{DumpError, Result};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Ships finished files to object storage and announces them.
pub trait Uploader: Send + Sync {
    /// Upload the file at `local_path` under `logical_name`, returning the
    /// URI of the stored object.
    fn upload(&self, local_path: &Path, logical_name: &str) -> Result<String>;

    /// Announce a stored object to downstream consumers.
    fn notify(&self, uri: &str, metadata_json: &str) -> Result<()>;
}

/// An object store mounted as a directory: `<root>/<bucket>/<logical name>`.
///
/// Notifications are appended as JSON lines to `<root>/notifications.jsonl`.
pub struct DirectoryUploader {
    root: PathBuf,
    bucket: String,
    notifications: Mutex<()>,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
            notifications: Mutex::new(()),
        }
    }

    pub fn notifications_path(&self) -> PathBuf {
        self.root.join("notifications.jsonl")
    }
}

impl Uploader for DirectoryUploader {
    fn upload(&self, local_path: &Path, logical_name: &str) -> Result<String> {
        if logical_name.split('/').any(|part| part == "..") {
            return Err(DumpError::Upload(format!(
                "refusing object name '{}'",
                logical_name
            )));
        }

        let dest = self.root.join(&self.bucket).join(logical_name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| DumpError::file(parent, e))?;
        }
        fs::copy(local_path, &dest).map_err(|e| DumpError::file(&dest, e))?;

        Ok(format!("file://{}/{}", self.bucket, logical_name))
    }

    fn notify(&self, uri: &str, metadata_json: &str) -> Result<()> {
        let _guard = self.notifications.lock();
        let path = self.notifications_path();
        let line = serde_json::json!({ "uri": uri, "metadata": metadata_json });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DumpError::file(&path, e))?;
        writeln!(file, "{}", line).map_err(|e| DumpError::file(&path, e))
    }
}
