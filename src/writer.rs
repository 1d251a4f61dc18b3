//! Size-rotated output files with per-file MD5 digests.
//!
//! Files are written under a staging directory as `<prefix>_<n>`. Once a file
//! grows past the size limit (or the writer is finished) it is synced, its
//! digest is finalized, and it is renamed into the destination directory as
//! `<prefix>_<n>_<MD5>` (or just `<prefix>_<n>` without checksums). The
//! destination directory is synced after every rename so a finished file
//! survives a crash. Finished files can then be handed to an [`Uploader`].

use crate::error::{DumpError, IoResultExt, Result};
use crate::upload::Uploader;
use md5::{Digest, Md5};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, IoSlice, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where finished files go after they are renamed.
#[derive(Clone)]
pub struct UploadTarget {
    pub uploader: Arc<dyn Uploader>,
    /// Prepended to the file name to form the object name
    pub prefix: String,
}

#[derive(Clone)]
pub struct WriterOptions {
    pub staging_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub prefix: String,
    /// A file is rotated once it holds more than this many bytes
    pub max_file_size: u64,
    pub checksum: bool,
    pub upload: Option<UploadTarget>,
}

/// A file that has been finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedFile {
    pub name: String,
    /// Local path, or `None` once the file was uploaded and removed
    pub path: Option<PathBuf>,
    pub bytes: u64,
    /// Uppercase hex MD5 of the contents
    pub checksum: Option<String>,
    pub uri: Option<String>,
}

struct OpenFile {
    file: File,
    name: String,
    path: PathBuf,
    bytes: u64,
    digest: Option<Md5>,
}

/// Sequential sink that rotates files by size.
pub struct RotatingWriter {
    options: WriterOptions,
    current: Option<OpenFile>,
    next_index: u32,
    bytes_written: u64,
    finalized: Vec<FinalizedFile>,
}

impl RotatingWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self {
            options,
            current: None,
            next_index: 0,
            bytes_written: 0,
            finalized: Vec::new(),
        }
    }

    /// Open the first staging file.
    pub fn init(&mut self) -> Result<()> {
        if self.current.is_none() {
            self.open_next()?;
        }
        Ok(())
    }

    /// Append `bufs` to the current file, rotating afterwards if it grew past
    /// the size limit. Returns the number of bytes written.
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.init()?;
        let Some(current) = self.current.as_mut() else {
            unreachable!("init opens a file");
        };

        if let Some(digest) = current.digest.as_mut() {
            for buf in bufs {
                digest.update(&**buf);
            }
        }

        let mut slices: Vec<IoSlice<'_>> = bufs.iter().copied().filter(|b| !b.is_empty()).collect();
        let total: usize = slices.iter().map(|b| b.len()).sum();
        let mut remaining = &mut slices[..];
        while !remaining.is_empty() {
            match current.file.write_vectored(remaining) {
                Ok(0) => {
                    return Err(DumpError::file(
                        &current.path,
                        std::io::Error::new(ErrorKind::WriteZero, "failed to write data file"),
                    ));
                }
                Ok(n) => IoSlice::advance_slices(&mut remaining, n),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(DumpError::file(&current.path, e)),
            }
        }

        current.bytes += total as u64;
        self.bytes_written += total as u64;

        if current.bytes > self.options.max_file_size {
            self.rotate()?;
        }

        Ok(total)
    }

    /// Finalize the current file without opening another.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            self.finalize(open)?;
        }
        Ok(())
    }

    /// Total bytes written across all files.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Files finalized so far, in order.
    pub fn finalized(&self) -> &[FinalizedFile] {
        &self.finalized
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            self.finalize(open)?;
        }
        self.open_next()
    }

    fn open_next(&mut self) -> Result<()> {
        let name = format!("{}_{}", self.options.prefix, self.next_index);
        let path = self.options.staging_dir.join(&name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_path(&path)?;

        self.next_index += 1;
        self.current = Some(OpenFile {
            file,
            name,
            path,
            bytes: 0,
            digest: self.options.checksum.then(Md5::new),
        });
        Ok(())
    }

    fn finalize(&mut self, open: OpenFile) -> Result<()> {
        let OpenFile {
            file,
            name,
            path,
            bytes,
            digest,
        } = open;

        if bytes == 0 {
            drop(file);
            fs::remove_file(&path).with_path(&path)?;
            return Ok(());
        }

        file.sync_all().with_path(&path)?;
        let checksum = digest.map(|d| to_hex(&d.finalize()));
        drop(file);

        let final_name = match &checksum {
            Some(sum) => format!("{}_{}", name, sum),
            None => name,
        };
        let dest = self.options.dest_dir.join(&final_name);
        fs::rename(&path, &dest).with_path(&dest)?;
        sync_dir(&self.options.dest_dir)?;

        let mut finalized = FinalizedFile {
            name: final_name,
            path: Some(dest),
            bytes,
            checksum,
            uri: None,
        };

        if let Some(target) = self.options.upload.clone() {
            upload(&target, &mut finalized)?;
        }

        tracing::debug!(
            file = %finalized.name,
            bytes = finalized.bytes,
            uploaded = finalized.uri.is_some(),
            "data file finalized"
        );
        self.finalized.push(finalized);
        Ok(())
    }
}

fn upload(target: &UploadTarget, file: &mut FinalizedFile) -> Result<()> {
    let Some(local) = file.path.clone() else {
        return Ok(());
    };

    let logical_name = if target.prefix.is_empty() {
        file.name.clone()
    } else {
        format!("{}/{}", target.prefix.trim_end_matches('/'), file.name)
    };

    let uri = target.uploader.upload(&local, &logical_name)?;
    fs::remove_file(&local).with_path(&local)?;
    file.path = None;

    let metadata = serde_json::json!({
        "name": file.name,
        "bytes": file.bytes,
        "checksum": file.checksum,
    });
    target.uploader.notify(&uri, &metadata.to_string())?;
    file.uri = Some(uri);
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_path(dir)
}

/// Uppercase hex rendering of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}
