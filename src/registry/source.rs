//! Where filter definitions come from.
//!
//! # Responsibilities
//! - Enumerate definitions as (identity, checksum, text, disabled) entries
//! - Report unreadable items individually, never failing the whole listing
//!   because of one bad item
//!
//! # Design Decisions
//! - Checksums are SHA-256 over the raw bytes, hex encoded
//! - A list-level error (directory gone, permissions) is distinct from an
//!   item error so the watcher never infers removals from an unreadable source

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex-encoded SHA-256 of a definition.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// One enumerated filter definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub identity: String,
    pub checksum: String,
    pub text: String,
    /// Soft-disabled: kept and tracked, but left out of the snapshot.
    pub disabled: bool,
}

impl SourceEntry {
    pub fn new(identity: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            identity: identity.into(),
            checksum: checksum(text.as_bytes()),
            text,
            disabled: false,
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// The source as a whole could not be listed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot list filter source {}: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("filter source unavailable: {0}")]
    Failed(String),
}

/// One definition could not be read.
#[derive(Debug, Clone, Error)]
#[error("cannot read filter '{identity}': {reason}")]
pub struct ItemError {
    pub identity: String,
    pub reason: String,
}

pub type SourceItem = Result<SourceEntry, ItemError>;

/// Enumerates filter definitions on demand.
pub trait FilterSource: Send + Sync {
    /// Human readable location, for logs.
    fn describe(&self) -> String;

    fn list(&self) -> Result<Vec<SourceItem>, SourceError>;
}

/// Definitions stored as `*.toml` files in one directory.
///
/// The identity is the file stem. A sibling `<stem>.disabled` file, or the
/// stem appearing in the configured disabled list, soft-disables a filter.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    directory: PathBuf,
    disabled: HashSet<String>,
}

impl DirectorySource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            disabled: HashSet::new(),
        }
    }

    pub fn with_disabled(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.disabled.extend(names);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn is_disabled(&self, identity: &str) -> bool {
        self.disabled.contains(identity)
            || self
                .directory
                .join(format!("{identity}.disabled"))
                .exists()
    }
}

impl FilterSource for DirectorySource {
    fn describe(&self) -> String {
        self.directory.display().to_string()
    }

    fn list(&self) -> Result<Vec<SourceItem>, SourceError> {
        let entries = fs::read_dir(&self.directory).map_err(|source| SourceError::Unavailable {
            path: self.directory.clone(),
            source,
        })?;

        let mut files = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Unavailable {
                path: self.directory.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") || !path.is_file() {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => {
                    files.insert(stem.to_string(), path);
                }
                None => tracing::warn!(path = ?path, "Skipping filter file with non UTF-8 name"),
            }
        }

        Ok(files
            .into_iter()
            .map(|(identity, path)| match fs::read_to_string(&path) {
                Ok(text) => {
                    let disabled = self.is_disabled(&identity);
                    Ok(SourceEntry::new(identity, text).disabled(disabled))
                }
                Err(e) => Err(ItemError {
                    identity,
                    reason: e.to_string(),
                }),
            })
            .collect())
    }
}

/// In-memory source, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<String, SourceItem>,
    unavailable: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    pub fn insert(&self, identity: &str, text: &str) {
        self.with_state(|s| {
            s.items
                .insert(identity.to_string(), Ok(SourceEntry::new(identity, text)))
        });
    }

    pub fn remove(&self, identity: &str) {
        self.with_state(|s| s.items.remove(identity));
    }

    pub fn set_disabled(&self, identity: &str, disabled: bool) {
        self.with_state(|s| {
            if let Some(Ok(entry)) = s.items.get_mut(identity) {
                entry.disabled = disabled;
            }
        });
    }

    /// Make one item unreadable until it is inserted again.
    pub fn break_item(&self, identity: &str, reason: &str) {
        self.with_state(|s| {
            s.items.insert(
                identity.to_string(),
                Err(ItemError {
                    identity: identity.to_string(),
                    reason: reason.to_string(),
                }),
            )
        });
    }

    /// Make the whole listing fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|s| s.unavailable = unavailable);
    }
}

impl FilterSource for MemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn list(&self) -> Result<Vec<SourceItem>, SourceError> {
        self.with_state(|s| {
            if s.unavailable {
                return Err(SourceError::Failed("marked unavailable".to_string()));
            }
            Ok(s.items.values().cloned().collect())
        })
    }
}
