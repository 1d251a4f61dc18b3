//! Rebuilds the work list of an interrupted dump.

use crate::error::Result;
use crate::layout::OutputLayout;
use tracing::{info, warn};

/// What is left to do after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Key files with no checkpoint, in index order
    pub remaining: Vec<String>,
    /// Key files already processed
    pub processed: usize,
    /// Data files deleted because their key file will be processed again
    pub removed_data_files: usize,
}

/// Work out which key files still need decoding.
///
/// Returns `None` when the previous crawl never finished, in which case the
/// output cannot be trusted and the dump has to start over.
pub fn plan(layout: &OutputLayout) -> Result<Option<ResumePlan>> {
    if !layout.key_files_done_path().exists() {
        warn!(
            dir = %layout.root().display(),
            "previous crawl did not finish, starting over"
        );
        return Ok(None);
    }

    let checkpoints = layout.read_checkpoints()?;
    let mut remaining = Vec::new();
    let mut processed = 0;
    for name in layout.list_key_files()? {
        if checkpoints.contains(&name) {
            processed += 1;
        } else {
            remaining.push(name);
        }
    }

    // partially written output of an unfinished key file would be duplicated
    let mut removed_data_files = 0;
    for name in &remaining {
        removed_data_files += layout.remove_data_files(name)?;
    }

    info!(
        processed,
        remaining = remaining.len(),
        removed_data_files,
        "resuming dump"
    );
    Ok(Some(ResumePlan {
        remaining,
        processed,
        removed_data_files,
    }))
}
