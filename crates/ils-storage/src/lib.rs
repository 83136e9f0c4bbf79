//! Incident database + commit pointer persistence for ILS.

use std::path::{Path, PathBuf};

use ils_core::IncidentRecord;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ils-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed incident database {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Replace `path` with `bytes` via a temp file in the same directory and a
/// rename, so readers never observe a partially written file and a crash
/// leaves the previous contents intact.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
    }

    let temp_name = format!(".{}.tmp", Uuid::new_v4());
    let temp_path = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
        _ => PathBuf::from(temp_name),
    };

    fs::write(&temp_path, bytes).await.map_err(write_err)?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(write_err(err))
        }
    }
}

/// The `incidents.json` file: an ordered JSON array of [`IncidentRecord`]s.
#[derive(Debug, Clone)]
pub struct IncidentStore {
    path: PathBuf,
}

impl IncidentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records. A database that does not exist yet is an empty
    /// database; a file that exists but does not parse is fatal.
    pub async fn load(&self) -> Result<Vec<IncidentRecord>, StorageError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "incident database absent, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Atomically replace the database with `records`, pretty-printed.
    pub async fn save(&self, records: &[IncidentRecord]) -> Result<(), StorageError> {
        let mut bytes =
            serde_json::to_vec_pretty(records).map_err(|source| StorageError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        bytes.push(b'\n');
        replace_file(&self.path, &bytes).await
    }
}

/// Single-line file recording the last upstream commit successfully merged.
#[derive(Debug, Clone)]
pub struct CommitPointerFile {
    path: PathBuf,
}

impl CommitPointerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored commit hash. Absent, empty, or implausible contents
    /// mean "no prior sync" and are never an error; only a real I/O failure
    /// is surfaced.
    pub async fn read(&self) -> Result<Option<String>, StorageError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "commit pointer absent");
                return Ok(None);
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let hash = text.trim();
        if hash.is_empty() {
            debug!(path = %self.path.display(), "commit pointer empty");
            return Ok(None);
        }
        if !is_plausible_commit_hash(hash) {
            warn!(
                path = %self.path.display(),
                contents = hash,
                "ignoring malformed commit pointer"
            );
            return Ok(None);
        }
        Ok(Some(hash.to_string()))
    }

    /// Atomically replace the pointer with `hash`.
    pub async fn write(&self, hash: &str) -> Result<(), StorageError> {
        replace_file(&self.path, format!("{hash}\n").as_bytes()).await
    }
}

/// Abbreviated through full sha256 object names, hex only.
fn is_plausible_commit_hash(token: &str) -> bool {
    (7..=64).contains(&token.len()) && token.chars().all(|c| c.is_ascii_hexdigit())
}
