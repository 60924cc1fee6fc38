//! Directory-backed local cache
//!
//! Layout under the root directory:
//!
//! | Path | Contents |
//! |------|----------|
//! | `action/<xx>/<sha256(key)>` | JSON record: output id, size, time |
//! | `output/<output id>` | stored body |
//! | `tmp/` | scratch space for remote downloads |
//!
//! Bodies are written before their action record and both go through
//! [`AtomicFile`](crate::atomic::AtomicFile), so a record that can be read
//! always names a complete output file.

use super::{CacheObject, LocalCache, LocalEntry};
use crate::atomic;
use crate::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing::{debug, trace};

const FILE_MODE: u32 = 0o644;

/// Record stored per action key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionRecord {
    output_id: String,
    size: u64,
    time: DateTime<Utc>,
}

/// Local cache rooted at a directory
#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> ProxyResult<Self> {
        let root = root.into();
        for sub in ["action", "output", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .map_err(|e| ProxyError::io(format!("creating directory {}", dir.display()), e))?;
        }
        debug!("Opened local cache at {}", root.display());
        Ok(Self { root })
    }

    #[cfg(test)]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Scratch directory on the same filesystem as the cache
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn action_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join("action").join(&digest[..2]).join(digest)
    }

    fn output_path(&self, output_id: &str) -> PathBuf {
        let name = if is_plain_name(output_id) {
            output_id.to_string()
        } else {
            hex::encode(Sha256::digest(output_id.as_bytes()))
        };
        self.root.join("output").join(name)
    }

    fn get_blocking(&self, key: &str) -> ProxyResult<Option<LocalEntry>> {
        let record_path = self.action_path(key);
        let raw = match fs::read(&record_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::io(
                    format!("reading action record {}", record_path.display()),
                    e,
                ))
            }
        };

        let record: ActionRecord = serde_json::from_slice(&raw)
            .map_err(|e| ProxyError::local(&record_path, format!("corrupt action record: {}", e)))?;

        let path = self.output_path(&record.output_id);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() == record.size => Ok(Some(LocalEntry {
                output_id: record.output_id,
                path,
            })),
            Ok(meta) => {
                debug!(
                    key,
                    expected = record.size,
                    actual = meta.len(),
                    "Output size mismatch, treating as miss"
                );
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key, "Output file missing, treating as miss");
                Ok(None)
            }
            Err(e) => Err(ProxyError::io(format!("inspecting {}", path.display()), e)),
        }
    }

    fn put_blocking(&self, object: CacheObject) -> ProxyResult<PathBuf> {
        let CacheObject {
            key,
            size,
            mut body,
            output_id,
        } = object;

        let output_id = if output_id.is_empty() {
            derived_output_id(&key)
        } else {
            output_id
        };

        let path = self.output_path(&output_id);
        let written = atomic::transact(&path, FILE_MODE, |file| {
            let written = io::copy(&mut (&mut body).take(size), file)?;
            if written != size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {} bytes", written, size),
                ));
            }
            Ok(written)
        })
        .map_err(|e| ProxyError::local(&path, format!("writing output: {}", e)))?;

        let record_path = self.action_path(&key);
        if let Some(parent) = record_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::io(format!("creating directory {}", parent.display()), e))?;
        }
        let record = ActionRecord {
            output_id,
            size: written,
            time: Utc::now(),
        };
        let encoded = serde_json::to_vec(&record)?;
        atomic::write_data(&record_path, &encoded, FILE_MODE)
            .map_err(|e| ProxyError::local(&record_path, format!("writing action record: {}", e)))?;

        trace!(key = %key, size = written, path = %path.display(), "Stored local entry");
        Ok(path)
    }
}

#[async_trait]
impl LocalCache for DirCache {
    async fn get(&self, key: &str) -> ProxyResult<Option<LocalEntry>> {
        let cache = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.get_blocking(&key))
            .await
            .map_err(ProxyError::join)?
    }

    async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.put_blocking(object))
            .await
            .map_err(ProxyError::join)?
    }
}

/// Output id recorded for content whose id was not supplied
fn derived_output_id(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"remote\0");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_plain_name(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
