//! In-memory collaborators for unit tests

use crate::error::{ProxyResult, RemoteError, RemoteResult};
use crate::local::{CacheObject, DirCache, LocalCache, LocalEntry};
use crate::remote::{Blob, Download, KeyLister, KeyPage, RemoteCache, RemoteEntry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Lister over a fixed key set, filtered by prefix
pub struct FakeLister {
    keys: Vec<String>,
    per_page: usize,
    fail_page: Option<u32>,
    calls: AtomicUsize,
    last_ref: Mutex<Option<String>>,
}

impl FakeLister {
    pub fn new(keys: Vec<String>, per_page: usize) -> Self {
        Self {
            keys,
            per_page,
            fail_page: None,
            calls: AtomicUsize::new(0),
            last_ref: Mutex::new(None),
        }
    }

    pub fn failing_on_page(mut self, page: u32) -> Self {
        self.fail_page = Some(page);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_ref(&self) -> Option<String> {
        self.last_ref.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyLister for FakeLister {
    async fn list_page(&self, prefix: &str, git_ref: Option<&str>, page: u32) -> RemoteResult<KeyPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_ref.lock().unwrap() = git_ref.map(str::to_string);
        if self.fail_page == Some(page) {
            return Err(RemoteError::Status {
                operation: "list caches",
                status: 502,
                message: "bad gateway".into(),
            });
        }

        let matching: Vec<String> = self
            .keys
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let start = (page as usize - 1) * self.per_page;
        let keys = matching
            .iter()
            .skip(start)
            .take(self.per_page)
            .cloned()
            .collect();
        Ok(KeyPage {
            keys,
            total: matching.len() as u64,
        })
    }
}

/// How the fake remote answers saves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Store,
    Conflict,
    Fail,
}

/// Remote cache keeping blobs as files in a temp directory
pub struct FakeRemote {
    dir: TempDir,
    blobs: Mutex<BTreeMap<String, PathBuf>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    save_outcome: Mutex<SaveOutcome>,
    load_failure: Mutex<bool>,
    load_delay: Mutex<Duration>,
    save_gate: Option<Arc<Semaphore>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            blobs: Mutex::new(BTreeMap::new()),
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            save_outcome: Mutex::new(SaveOutcome::Store),
            load_failure: Mutex::new(false),
            load_delay: Mutex::new(Duration::ZERO),
            save_gate: None,
        }
    }

    /// Saves block until [`release_saves`](Self::release_saves) lets them through
    pub fn gated() -> Self {
        Self {
            save_gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    pub fn release_saves(&self, n: usize) {
        if let Some(gate) = &self.save_gate {
            gate.add_permits(n);
        }
    }

    pub fn with_blob(self, key: &str, body: &[u8]) -> Self {
        self.insert(key, body);
        self
    }

    pub fn set_save_outcome(&self, outcome: SaveOutcome) {
        *self.save_outcome.lock().unwrap() = outcome;
    }

    pub fn fail_loads(&self) {
        *self.load_failure.lock().unwrap() = true;
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.blobs.lock().unwrap().get(key).cloned()?;
        std::fs::read(path).ok()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    fn insert(&self, key: &str, body: &[u8]) {
        let path = self.dir.path().join(hex::encode(key));
        std::fs::write(&path, body).unwrap();
        self.blobs.lock().unwrap().insert(key.to_string(), path);
    }
}

struct FakeEntry {
    path: PathBuf,
}

#[async_trait]
impl RemoteEntry for FakeEntry {
    async fn download(&self) -> RemoteResult<Download> {
        let file = File::open(&self.path).map_err(|e| RemoteError::io("opening fake blob", e))?;
        Download::from_file(file).map_err(|e| RemoteError::io("sizing fake blob", e))
    }
}

#[async_trait]
impl RemoteCache for FakeRemote {
    async fn load(&self, key: &str) -> RemoteResult<Box<dyn RemoteEntry>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.load_failure.lock().unwrap() {
            return Err(RemoteError::Status {
                operation: "cache lookup",
                status: 500,
                message: "internal error".into(),
            });
        }
        let path = self.blobs.lock().unwrap().get(key).cloned();
        match path {
            Some(path) => Ok(Box::new(FakeEntry { path })),
            None => Err(RemoteError::not_found(key)),
        }
    }

    async fn save(&self, key: &str, blob: Blob) -> RemoteResult<()> {
        if let Some(gate) = &self.save_gate {
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }
        self.saves.fetch_add(1, Ordering::SeqCst);

        let outcome = *self.save_outcome.lock().unwrap();
        match outcome {
            SaveOutcome::Conflict => Err(RemoteError::conflict(key)),
            SaveOutcome::Fail => Err(RemoteError::Status {
                operation: "reserve",
                status: 503,
                message: "unavailable".into(),
            }),
            SaveOutcome::Store => {
                let mut body = Vec::new();
                blob.into_reader()
                    .read_to_end(&mut body)
                    .map_err(|e| RemoteError::io("reading blob", e))?;
                self.insert(key, &body);
                Ok(())
            }
        }
    }
}

/// The fake remote can list what it holds, like the real service does
#[async_trait]
impl KeyLister for FakeRemote {
    async fn list_page(&self, prefix: &str, _git_ref: Option<&str>, page: u32) -> RemoteResult<KeyPage> {
        let keys: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        let total = keys.len() as u64;
        let keys = if page == 1 { keys } else { Vec::new() };
        Ok(KeyPage { keys, total })
    }
}

/// Directory cache that counts calls
pub struct CountingLocal {
    inner: DirCache,
    gets: AtomicUsize,
    puts: AtomicUsize,
    _dir: TempDir,
}

impl CountingLocal {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            inner: DirCache::open(dir.path()).unwrap(),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            _dir: dir,
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalCache for CountingLocal {
    async fn get(&self, key: &str) -> ProxyResult<Option<LocalEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(object).await
    }
}
