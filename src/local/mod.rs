//! Local cache tier
//!
//! The local tier is authoritative once populated: every response handed
//! back to the build tool points at a file owned by a [`LocalCache`].

pub mod dir;

pub use dir::DirCache;

use crate::error::ProxyResult;
use async_trait::async_trait;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;

/// Request payload for a single put: key, declared size, body and output id
pub struct CacheObject {
    pub key: String,
    pub size: u64,
    pub body: Box<dyn Read + Send>,
    /// Opaque id owned by the protocol consumer. Empty when the content was
    /// fetched from the remote tier and no id is known.
    pub output_id: String,
}

impl CacheObject {
    pub fn new(
        key: impl Into<String>,
        output_id: impl Into<String>,
        size: u64,
        body: impl Read + Send + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            size,
            body: Box::new(body),
            output_id: output_id.into(),
        }
    }

    /// Build an object from an in-memory body
    pub fn from_bytes(key: impl Into<String>, output_id: impl Into<String>, body: Vec<u8>) -> Self {
        let size = body.len() as u64;
        Self::new(key, output_id, size, std::io::Cursor::new(body))
    }

    /// Same object under a different key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

impl fmt::Debug for CacheObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheObject")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("output_id", &self.output_id)
            .finish_non_exhaustive()
    }
}

/// Content materialized on disk by the local tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub output_id: String,
    pub path: PathBuf,
}

/// Content-addressed on-disk store
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Look up `key`, returning `None` when nothing is stored for it
    async fn get(&self, key: &str) -> ProxyResult<Option<LocalEntry>>;

    /// Store the object's body and return the path it can be read from
    async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf>;
}
