//! Durable record of processed and known-bad items.
//!
//! The store is a single JSON object with three sets. It is loaded once at
//! startup and written back after every mutation with a write-to-temp-then-rename
//! so a crash mid-write leaves either the previous or the new file on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while persisting the state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// Writing or renaming the state file failed.
    #[error("Failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Serializing the state failed.
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The three persisted sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeenState {
    /// Candidate ids that were delivered.
    #[serde(default)]
    pub seen_ids: BTreeSet<String>,
    /// Urls excluded by an operator or by policy.
    #[serde(default)]
    pub blacklisted_urls: BTreeSet<String>,
    /// Urls whose retrieval exhausted every attempt.
    #[serde(default)]
    pub failed_urls: BTreeSet<String>,
}

impl SeenState {
    /// Total number of entries across all sets.
    pub fn len(&self) -> usize {
        self.seen_ids.len() + self.blacklisted_urls.len() + self.failed_urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which set an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Seen,
    Blacklisted,
    Failed,
}

/// File-backed state store with a single owner.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: SeenState,
}

impl StateStore {
    /// Loads the store from `path`.
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// moved aside to `<name>.corrupt` and also yields an empty store; this
    /// never fails the process.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<SeenState>(&content) {
                Ok(state) => {
                    debug!(
                        path = %path.display(),
                        entries = state.len(),
                        "Loaded state file"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "State file is corrupt, starting with empty state"
                    );
                    quarantine(&path);
                    SeenState::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file yet, starting empty");
                SeenState::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "State file unreadable, starting with empty state"
                );
                SeenState::default()
            }
        };

        Self { path, state }
    }

    /// Read-only view of the current sets.
    pub fn snapshot(&self) -> &SeenState {
        &self.state
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.state.seen_ids.contains(id)
    }

    /// True if the url is blacklisted or previously failed.
    pub fn is_blocked(&self, url: &str) -> bool {
        self.state.blacklisted_urls.contains(url) || self.state.failed_urls.contains(url)
    }

    fn set_mut(&mut self, kind: StateKind) -> &mut BTreeSet<String> {
        match kind {
            StateKind::Seen => &mut self.state.seen_ids,
            StateKind::Blacklisted => &mut self.state.blacklisted_urls,
            StateKind::Failed => &mut self.state.failed_urls,
        }
    }

    /// Adds `key` to the chosen set and flushes if it was new.
    ///
    /// Returns whether the entry was newly inserted. If the flush fails the
    /// entry is taken back out, so the in-memory sets never hold more than
    /// the file and a retry flushes again.
    pub fn add(&mut self, kind: StateKind, key: &str) -> Result<bool, StateError> {
        if !self.set_mut(kind).insert(key.to_string()) {
            return Ok(false);
        }

        if let Err(e) = self.flush() {
            self.set_mut(kind).remove(key);
            return Err(e);
        }
        Ok(true)
    }

    pub fn add_seen(&mut self, id: &str) -> Result<bool, StateError> {
        self.add(StateKind::Seen, id)
    }

    pub fn add_failed(&mut self, url: &str) -> Result<bool, StateError> {
        self.add(StateKind::Failed, url)
    }

    pub fn add_blacklisted(&mut self, url: &str) -> Result<bool, StateError> {
        self.add(StateKind::Blacklisted, url)
    }

    /// Clears every set and persists the empty state.
    ///
    /// This is the only path that removes entries.
    pub fn reset(&mut self) -> Result<(), StateError> {
        self.state = SeenState::default();
        self.flush()
    }

    /// Writes the current state atomically. Safe to call repeatedly.
    pub fn flush(&self) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json).map_err(|source| StateError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}

/// Temporary sibling used during an atomic write.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    Ok(())
}

fn quarantine(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    if let Err(e) = fs::rename(path, PathBuf::from(&aside)) {
        warn!(path = %path.display(), error = %e, "Could not move corrupt state file aside");
    }
}
