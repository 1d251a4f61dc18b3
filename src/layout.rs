//! On-disk layout of a dump.
//!
//! ```text
//! <dir>/keyfile/key_<host>_<n>              crawler output
//! <dir>/keyfile/CHECKPOINTS_<worker>        key files fully processed
//! <dir>/keyfile/ALL_KEYFILES_DUMPED         crawl completion marker
//! <dir>/datafiles_staging/                  data files being written
//! <dir>/datafiles_completed/                finished data files
//! <dir>/datafiles_completed/DONE            run summary
//! ```

use crate::error::{DumpError, IoResultExt, Result};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const KEY_DIR: &str = "keyfile";
pub const STAGING_DIR: &str = "datafiles_staging";
pub const COMPLETED_DIR: &str = "datafiles_completed";
pub const KEY_FILES_DONE_MARKER: &str = "ALL_KEYFILES_DUMPED";
pub const DONE_FILE: &str = "DONE";
pub const CHECKPOINT_PREFIX: &str = "CHECKPOINTS_";

/// Paths and names for one dump.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    host: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, host: &str) -> Self {
        let host = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        Self {
            root: root.into(),
            host,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_dir(&self) -> PathBuf {
        self.root.join(KEY_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join(COMPLETED_DIR)
    }

    pub fn key_file_name(&self, index: usize) -> String {
        format!("key_{}_{}", self.host, index)
    }

    pub fn key_file_path(&self, name: &str) -> PathBuf {
        self.key_dir().join(name)
    }

    /// Data files produced from a key file share its index:
    /// `key_<host>_<n>` becomes `data_<host>_<n>`.
    pub fn data_prefix(&self, key_file_name: &str) -> String {
        match key_file_name.strip_prefix("key_") {
            Some(rest) => format!("data_{}", rest),
            None => format!("data_{}", key_file_name),
        }
    }

    pub fn checkpoint_path(&self, worker_name: &str) -> PathBuf {
        self.key_dir()
            .join(format!("{}{}", CHECKPOINT_PREFIX, worker_name))
    }

    pub fn key_files_done_path(&self) -> PathBuf {
        self.key_dir().join(KEY_FILES_DONE_MARKER)
    }

    pub fn done_path(&self) -> PathBuf {
        self.completed_dir().join(DONE_FILE)
    }

    /// Create the directory tree for a fresh run. An existing, non-empty
    /// output directory is refused.
    pub fn create_fresh(&self) -> Result<()> {
        if self.root.exists() {
            let mut entries = fs::read_dir(&self.root).with_path(&self.root)?;
            if entries.next().is_some() {
                return Err(DumpError::Config(format!(
                    "output directory {} is not empty",
                    self.root.display()
                )));
            }
        }
        self.create_dirs()
    }

    /// Delete everything under the output directory and recreate the tree.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            for entry in fs::read_dir(&self.root).with_path(&self.root)? {
                let path = entry.with_path(&self.root)?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path).with_path(&path)?;
                } else {
                    fs::remove_file(&path).with_path(&path)?;
                }
            }
        }
        self.create_dirs()
    }

    fn create_dirs(&self) -> Result<()> {
        for dir in [self.key_dir(), self.staging_dir(), self.completed_dir()] {
            fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(())
    }

    /// Key file names currently on disk, ordered by index.
    pub fn list_key_files(&self) -> Result<Vec<String>> {
        let dir = self.key_dir();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let name = entry.with_path(&dir)?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("key_") {
                files.push(name.to_string());
            }
        }
        files.sort_by_key(|name| (key_file_index(name), name.clone()));
        Ok(files)
    }

    /// Every key file named in any worker's checkpoint log.
    pub fn read_checkpoints(&self) -> Result<HashSet<String>> {
        let dir = self.key_dir();
        let mut done = HashSet::new();
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            let is_checkpoint = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(CHECKPOINT_PREFIX));
            if !is_checkpoint {
                continue;
            }
            let path = entry.path();
            let contents = fs::read_to_string(&path).with_path(&path)?;
            done.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }
        Ok(done)
    }

    /// Durably record that `key_file_name` was fully processed by `worker_name`.
    pub fn append_checkpoint(&self, worker_name: &str, key_file_name: &str) -> Result<()> {
        let path = self.checkpoint_path(worker_name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        writeln!(file, "{}", key_file_name).with_path(&path)?;
        file.sync_data().with_path(&path)
    }

    /// Write a small file and sync it.
    pub fn write_marker(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = File::create(path).with_path(path)?;
        file.write_all(contents.as_bytes()).with_path(path)?;
        file.sync_all().with_path(path)
    }

    /// Remove staged and finished data files made from `key_file_name`.
    pub fn remove_data_files(&self, key_file_name: &str) -> Result<usize> {
        let prefix = format!("{}_", self.data_prefix(key_file_name));
        let mut removed = 0;
        for dir in [self.staging_dir(), self.completed_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir).with_path(&dir)? {
                let entry = entry.with_path(&dir)?;
                let matches = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix));
                if matches {
                    let path = entry.path();
                    fs::remove_file(&path).with_path(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Index of `key_<host>_<n>`, taken after the last underscore.
pub fn key_file_index(name: &str) -> Option<usize> {
    name.rsplit('_').next()?.parse().ok()
}
