//! Remote cache tier
//!
//! The remote tier is shared, slow and eventually consistent. Loads
//! distinguish "no blob yet" ([`RemoteError::NotFound`]) from failures, and
//! saves distinguish "someone else already wrote it"
//! ([`RemoteError::Conflict`]).
//!
//! [`RemoteError::NotFound`]: crate::error::RemoteError::NotFound
//! [`RemoteError::Conflict`]: crate::error::RemoteError::Conflict

pub mod actions;
pub mod listing;

pub use actions::{ActionsCache, ApiVersion};
pub use listing::{pages, GithubKeyLister, KeyLister, KeyPage};

use crate::error::RemoteResult;
use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

/// HTTP-backed blob store
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Check for `key` and return a handle to its content
    async fn load(&self, key: &str) -> RemoteResult<Box<dyn RemoteEntry>>;

    /// Upload `blob` under `key`
    async fn save(&self, key: &str, blob: Blob) -> RemoteResult<()>;
}

/// Handle to remote content returned by [`RemoteCache::load`]
#[async_trait]
pub trait RemoteEntry: Send + Sync {
    /// Fetch the content. The returned [`Download`] owns its backing file
    /// and releases it when dropped.
    async fn download(&self) -> RemoteResult<Download>;
}

/// Random-access copy of remote content
///
/// Spooled downloads are deleted when the `Download` is dropped.
#[derive(Debug)]
pub struct Download {
    file: File,
    size: u64,
    spool: Option<PathBuf>,
}

impl Download {
    /// Copy `src` into a fresh file under `dir`
    pub fn spool(dir: &Path, src: &mut dyn Read) -> io::Result<Self> {
        let path = dir.join(format!("download-{}.part", uuid::Uuid::new_v4().simple()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        match io::copy(src, &mut file) {
            Ok(size) => Ok(Self {
                file,
                size,
                spool: Some(path),
            }),
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Wrap an existing file; the file is left in place on drop
    #[cfg(test)]
    pub fn from_file(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            spool: None,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reader positioned at the start of the content
    pub fn reader(&self) -> io::Result<File> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        if let Some(path) = self.spool.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Upload payload: an open file bounded to a declared size
#[derive(Debug)]
pub struct Blob {
    file: File,
    size: u64,
}

impl Blob {
    pub fn new(file: File, size: u64) -> Self {
        Self { file, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reader that stops after the declared size
    pub fn into_reader(self) -> Take<File> {
        self.file.take(self.size)
    }
}
