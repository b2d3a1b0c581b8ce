//! Archive container: a directory of independent entry streams plus a
//! manifest.
//!
//! ```text
//! <root>/archive.json           manifest, written last
//! <root>/archive.lock           advisory lock held by the active writer
//! <root>/entries/<name>.jsonl   one JSON-lines stream per entry, header first
//! ```
//!
//! A container is valid only once `archive.json` exists. Entry files without
//! a manifest line are ignored by readers, so an interrupted export is
//! recognisable as incomplete.

mod reader;
mod writer;

pub use reader::ArchiveReader;
pub use writer::{ArchiveWriter, EntryWriter};

use chrono::{DateTime, Utc};
use gatehouse_protocol::SchemaInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "archive.json";
pub const LOCK_FILE: &str = "archive.lock";
pub const ENTRIES_DIR: &str = "entries";
const ENTRY_EXTENSION: &str = "jsonl";

/// Errors raised by the archive container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("archive entry '{0}' already exists")]
    DuplicateEntry(String),

    #[error("archive entry '{0}' not found")]
    MissingEntry(String),

    #[error("archive {} is incomplete: no committed manifest", .0.display())]
    Incomplete(PathBuf),

    #[error("archive entry '{entry}' is corrupt: {reason}")]
    Corrupt { entry: String, reason: String },

    #[error("invalid archive manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported archive format version {0}")]
    UnsupportedVersion(u32),

    #[error("archive {} is locked by another writer", .0.display())]
    Locked(PathBuf),

    #[error("invalid archive entry name '{0}'")]
    InvalidName(String),

    #[error("archive I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContainerError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ContainerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Container metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    /// Entries in the order they were committed.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// Path of the entry file relative to the archive root.
    pub file: String,
    pub schema: SchemaInfo,
    pub rows: u64,
    /// Hex blake3 digest of the entry file.
    pub blake3: String,
}

/// Entry names become file names: ASCII letters, digits, `_`, `-` and `.`,
/// not starting with a dot.
pub fn validate_entry_name(name: &str) -> Result<(), ContainerError> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ContainerError::InvalidName(name.to_string()))
    }
}

pub(crate) fn entry_file(name: &str) -> String {
    format!("{}/{}.{}", ENTRIES_DIR, name, ENTRY_EXTENSION)
}

pub(crate) fn read_manifest(root: &Path) -> Result<Option<Manifest>, ContainerError> {
    let path = root.join(MANIFEST_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ContainerError::io(&path, err)),
    };
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|source| ContainerError::Manifest {
            path: path.clone(),
            source,
        })?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(ContainerError::UnsupportedVersion(manifest.format_version));
    }
    Ok(Some(manifest))
}

pub(crate) fn digest_file(path: &Path) -> Result<String, ContainerError> {
    let mut file = std::fs::File::open(path).map_err(|e| ContainerError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| ContainerError::io(path, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names() {
        assert!(validate_entry_name("users").is_ok());
        assert!(validate_entry_name("main.orders-2024").is_ok());
        for bad in ["", ".hidden", "a/b", "..", "spaced name", "a\\b"] {
            assert!(
                matches!(validate_entry_name(bad), Err(ContainerError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn missing_manifest_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_manifest(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn future_format_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            format_version: 99,
            created_at: Utc::now(),
            committed_at: Utc::now(),
            entries: vec![],
        };
        std::fs::write(
            tmp.path().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            read_manifest(tmp.path()),
            Err(ContainerError::UnsupportedVersion(99))
        ));
    }
}
