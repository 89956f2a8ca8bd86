//! File-backed record store for posts and analysis reports.
//!
//! Keys are slash-separated paths (`posts/<forum>/<id>`,
//! `reports/<type>/<forum>/<interval>`) mapped to JSON files under the data
//! directory. Writes are idempotent: identical content is a no-op, different
//! content overwrites (used deliberately for report regeneration).

pub mod models;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use models::{AnalysisKind, Scope};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record store I/O failure for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record key '{0}'")]
    InvalidKey(String),
    #[error("failed to encode or decode record '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of a `put` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key did not exist before.
    Written,
    /// The key existed with byte-identical content; nothing was written.
    Unchanged,
    /// The key existed with different content and was overwritten.
    Overwritten,
}

/// Content-addressed key-value persistence rooted at a data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    /// Open (and create if missing) a store rooted at `root`.
    ///
    /// Probes writability up front so that an unusable store fails the run
    /// immediately instead of surfacing later as scattered I/O errors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the directory cannot be
    /// created or written to.
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: root.to_path_buf(),
                source,
            })?;

        // Starting a write requires more than the directory existing (e.g. a
        // volume mounted read-only), so probe with a real file.
        let probe = root.join(".write-probe");
        tokio::fs::write(&probe, b"probe")
            .await
            .map_err(|source| StoreError::Unavailable {
                path: root.to_path_buf(),
                source,
            })?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: root.to_path_buf(),
                source,
            })?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Write raw JSON bytes under a key, idempotently.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid key or I/O failure.
    pub async fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let path = self.path_for(key)?;

        let outcome = match self.read_bytes(key, &path).await? {
            Some(existing) if content_hash(&existing) == content_hash(bytes) => {
                debug!(key, "Record unchanged, skipping write");
                return Ok(PutOutcome::Unchanged);
            }
            Some(_) => PutOutcome::Overwritten,
            None => PutOutcome::Written,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    key: key.to_string(),
                    source,
                })?;
        }

        // Write to a sibling temp file then rename, so readers never observe
        // a half-written record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;

        Ok(outcome)
    }

    /// Serialize a value as compact JSON and write it under a key.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid key, serialization failure, or I/O failure.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<PutOutcome, StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.put_raw(key, &bytes).await
    }

    /// Read and deserialize the record at a key, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid key, I/O failure, or if the stored
    /// bytes do not deserialize as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let path = self.path_for(key)?;
        match self.read_bytes(key, &path).await? {
            Some(bytes) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Whether a record exists at a key.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid key or I/O failure.
    pub async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::try_exists(&path).await {
            Ok(exists) => Ok(exists),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// List all keys under a prefix, sorted ascending for determinism.
    ///
    /// A prefix with no matching directory yields an empty list, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid prefix or I/O failure while walking.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        validate_key(prefix)?;
        let base = self.root.join(prefix);

        let mut keys = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        key: prefix.to_string(),
                        source,
                    })
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
                key: prefix.to_string(),
                source,
            })? {
                let file_type = entry.file_type().await.map_err(|source| StoreError::Io {
                    key: prefix.to_string(),
                    source,
                })?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(key) = self.key_for(&path) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let raw = relative.to_str()?;
        raw.strip_suffix(".json").map(ToString::to_string)
    }

    async fn read_bytes(&self, key: &str, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// The store key for a post record.
#[must_use]
pub fn post_key(forum: &str, id: &str) -> String {
    format!("posts/{}/{}", sanitize_segment(forum), sanitize_segment(id))
}

/// The key prefix selecting one forum's posts, or all posts.
#[must_use]
pub fn posts_prefix(forum: Option<&str>) -> String {
    match forum {
        Some(f) => format!("posts/{}", sanitize_segment(f)),
        None => "posts".to_string(),
    }
}

/// The store key for an analysis report. One key per `(type, scope)`, so
/// re-running the same scope overwrites the previous report.
#[must_use]
pub fn report_key(kind: AnalysisKind, scope: &Scope) -> String {
    let forum = scope.forum.as_deref().unwrap_or("all");
    format!(
        "reports/{}/{}/{}--{}",
        kind.as_str(),
        sanitize_segment(forum),
        scope.start.format("%Y%m%dT%H%M%SZ"),
        scope.end.format("%Y%m%dT%H%M%SZ"),
    )
}

/// Replace anything outside `[A-Za-z0-9._-]` so arbitrary forum names and
/// post ids cannot escape the key namespace.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != ".."
                && segment != "."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
