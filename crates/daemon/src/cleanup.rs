//! Work-file lifecycle.
//!
//! Every candidate gets a pair of uniquely named work files. [`WorkFiles`]
//! removes both when dropped, which covers every exit path of an iteration.
//! [`sweep_stale_media`] clears leftovers from a process that died mid-run.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Media extensions the sweep removes (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv", "tmp", "part"];

/// Checks if a file has a work-media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            MEDIA_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Removes a file, ignoring one that is already gone.
pub fn remove_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not remove work file");
            false
        }
    }
}

/// Download and output paths for one candidate.
#[derive(Debug)]
pub struct WorkFiles {
    pub id: Uuid,
    pub source: PathBuf,
    pub output: PathBuf,
}

impl WorkFiles {
    /// `{uuid}.mp4` in `download_dir` and `{uuid}_vertical.mp4` in `output_dir`.
    pub fn new(download_dir: &Path, output_dir: &Path) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            source: download_dir.join(format!("{}.mp4", id)),
            output: output_dir.join(format!("{}_vertical.mp4", id)),
        }
    }
}

impl Drop for WorkFiles {
    fn drop(&mut self) {
        let removed = [&self.source, &self.output]
            .into_iter()
            .filter(|p| remove_quietly(p))
            .count();
        debug!(work_id = %self.id, removed, "Cleaned work files");
    }
}

/// Deletes media files directly inside each directory.
///
/// Subdirectories and non-media files are left alone. Returns the number of
/// files removed.
pub fn sweep_stale_media(dirs: &[PathBuf]) -> usize {
    let mut removed = 0;

    for dir in dirs {
        if !dir.exists() {
            continue;
        }

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file() && is_media_file(path) && remove_quietly(path) {
                removed += 1;
            }
        }
    }

    if removed > 0 {
        info!(removed, "Swept stale work files");
    }
    removed
}
