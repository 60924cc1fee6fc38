//! Request coordination across the local and remote tiers
//!
//! Gets consult the local tier before the remote one and copy remote hits
//! into the local tier. Puts complete against the local tier and replicate
//! to the remote tier in the background; the response never waits on the
//! upload. Concurrent requests for one key are collapsed so that at most one
//! remote load and one remote upload per key are in flight.

use crate::error::{ProxyError, ProxyResult};
use crate::flight::Flight;
use crate::index::{KeyIndex, Presence};
use crate::local::{CacheObject, LocalCache, LocalEntry};
use crate::remote::{Blob, RemoteCache};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Result of a get
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Miss,
    Hit {
        /// Local store's id when served locally; `None` when the content was
        /// just fetched from the remote tier.
        output_id: Option<String>,
        disk_path: PathBuf,
    },
}

impl Lookup {
    fn local(entry: Option<LocalEntry>) -> Self {
        match entry {
            Some(entry) => Self::Hit {
                output_id: Some(entry.output_id),
                disk_path: entry.path,
            },
            None => Self::Miss,
        }
    }
}

type SharedLookup = Result<Lookup, Arc<ProxyError>>;

/// Request counters
#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    uploads_skipped: AtomicU64,
}

/// Point-in-time copy of the request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub uploads_skipped: u64,
}

/// Coordinates Get/Put across the two tiers. One instance per server.
pub struct Coordinator {
    prefix: String,
    local: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteCache>,
    index: Arc<KeyIndex>,
    gets: Flight<SharedLookup>,
    puts: Arc<Flight<()>>,
    uploads: TaskTracker,
    counters: Arc<Counters>,
}

impl Coordinator {
    pub fn new(
        local: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteCache>,
        index: Arc<KeyIndex>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            local,
            remote,
            index,
            gets: Flight::new(),
            puts: Arc::new(Flight::new()),
            uploads: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    fn effective_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Look up `key`, falling back to the remote tier on a local miss.
    pub async fn get(&self, key: &str) -> ProxyResult<Lookup> {
        let key = self.effective_key(key);

        if self.index.lookup(&key).await == Presence::Absent {
            trace!(key = %key, "Not in remote index, local tier only");
            let lookup = Lookup::local(self.local.get(&key).await?);
            count_into(&self.counters, &lookup);
            return Ok(lookup);
        }

        let local = Arc::clone(&self.local);
        let remote = Arc::clone(&self.remote);
        let counters = Arc::clone(&self.counters);
        let owned = key.clone();
        self.gets
            .run(&key, move || async move {
                let lookup = fetch(local, remote, owned).await.map_err(Arc::new)?;
                count_into(&counters, &lookup);
                Ok(lookup)
            })
            .await
            .map_err(|e| Arc::try_unwrap(e).unwrap_or_else(ProxyError::Shared))
    }

    /// Read `key` from the local tier only. Not counted in [`Stats`].
    pub async fn local_entry(&self, key: &str) -> ProxyResult<Option<LocalEntry>> {
        self.local.get(&self.effective_key(key)).await
    }

    /// Store `object` locally and replicate it to the remote tier in the
    /// background. Returns as soon as the local copy is in place.
    pub async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf> {
        let key = self.effective_key(&object.key);
        let size = object.size;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        let path = self.local.put(object.with_key(key.clone())).await?;

        // Upload from an independent handle, not the local tier's writer.
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ProxyError::io(format!("reopening {}", path.display()), e))?;
        let blob = Blob::new(file.into_std().await, size);

        if self.index.exists(&key).await {
            debug!(key = %key, "Already in remote cache, skipping upload");
            self.counters.uploads_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }

        let remote = Arc::clone(&self.remote);
        let puts = Arc::clone(&self.puts);
        self.uploads.spawn(async move {
            let flight_key = key.clone();
            puts.run(&flight_key, move || upload(remote, key, blob)).await;
        });

        Ok(path)
    }

    /// Wait for every background upload to finish or fail.
    pub async fn close(&self) {
        self.uploads.close();
        let pending = self.uploads.len();
        if pending > 0 {
            info!(pending, "Waiting for background uploads");
        }
        self.uploads.wait().await;

        let stats = self.stats();
        info!(
            local_hits = stats.local_hits,
            remote_hits = stats.remote_hits,
            misses = stats.misses,
            puts = stats.puts,
            uploads_skipped = stats.uploads_skipped,
            "Cache session finished"
        );
    }

    /// Uploads started but not yet finished
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            local_hits: c.local_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            puts: c.puts.load(Ordering::Relaxed),
            uploads_skipped: c.uploads_skipped.load(Ordering::Relaxed),
        }
    }
}

fn count_into(counters: &Counters, lookup: &Lookup) {
    let counter = match lookup {
        Lookup::Miss => &counters.misses,
        Lookup::Hit { output_id: None, .. } => &counters.remote_hits,
        Lookup::Hit { .. } => &counters.local_hits,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Local tier first, then the remote tier, copying a remote hit locally
async fn fetch(
    local: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteCache>,
    key: String,
) -> ProxyResult<Lookup> {
    if let Some(entry) = local.get(&key).await? {
        return Ok(Lookup::local(Some(entry)));
    }

    let entry = match remote.load(&key).await {
        Ok(entry) => entry,
        Err(e) if e.is_not_found() => {
            trace!(key = %key, "Not in remote cache");
            return Ok(Lookup::Miss);
        }
        Err(e) => return Err(e.into()),
    };

    let download = match entry.download().await {
        Ok(download) => download,
        Err(e) if e.is_not_found() => {
            debug!(key = %key, "Remote entry vanished before download");
            return Ok(Lookup::Miss);
        }
        Err(e) => return Err(e.into()),
    };
    let body = download
        .reader()
        .map_err(|e| ProxyError::io(format!("reading download of {}", key), e))?;

    let object = CacheObject::new(key.as_str(), "", download.size(), body);
    let disk_path = local.put(object).await?;
    debug!(key = %key, size = download.size(), "Fetched from remote cache");

    Ok(Lookup::Hit {
        output_id: None,
        disk_path,
    })
}

async fn upload(remote: Arc<dyn RemoteCache>, key: String, blob: Blob) {
    let size = blob.size();
    match remote.save(&key, blob).await {
        Ok(()) => info!(key = %key, size, "Uploaded to remote cache"),
        Err(e) if e.is_conflict() => {
            debug!(key = %key, "Remote cache already has key")
        }
        Err(e) => warn!(
            key = %key,
            status = ?e.status(),
            error = %e,
            "Background upload failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingLocal, FakeLister, FakeRemote, SaveOutcome};
    use std::time::Duration;

    struct Harness {
        local: Arc<CountingLocal>,
        remote: Arc<FakeRemote>,
        coordinator: Arc<Coordinator>,
    }

    fn harness_with(remote: FakeRemote, index: KeyIndex, prefix: &str) -> Harness {
        let local = Arc::new(CountingLocal::new());
        let remote = Arc::new(remote);
        let coordinator = Arc::new(Coordinator::new(
            local.clone(),
            remote.clone(),
            Arc::new(index),
            prefix,
        ));
        Harness {
            local,
            remote,
            coordinator,
        }
    }

    fn harness(remote: FakeRemote) -> Harness {
        harness_with(remote, KeyIndex::disabled(), "")
    }

    fn body(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn missing_key_is_a_clean_miss() {
        let h = harness(FakeRemote::new());
        let lookup = h.coordinator.get("missing-key").await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
        assert_eq!(h.remote.loads(), 1);
        assert_eq!(h.coordinator.stats().misses, 1);
    }

    #[tokio::test]
    async fn remote_hit_is_copied_locally_without_output_id() {
        let h = harness(FakeRemote::new().with_blob("abc", b"from remote"));

        let lookup = h.coordinator.get("abc").await.unwrap();
        let Lookup::Hit { output_id, disk_path } = lookup else {
            panic!("expected hit");
        };
        assert_eq!(output_id, None);
        assert_eq!(std::fs::read(&disk_path).unwrap(), b"from remote");

        // Second get is served by the local tier.
        let again = h.coordinator.get("abc").await.unwrap();
        assert!(matches!(again, Lookup::Hit { output_id: Some(_), .. }));
        assert_eq!(h.remote.loads(), 1);
        assert_eq!(h.coordinator.stats().remote_hits, 1);
        assert_eq!(h.coordinator.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn concurrent_gets_load_once() {
        let remote = FakeRemote::new().with_blob("shared", &body(4096));
        remote.set_load_delay(Duration::from_millis(50));
        let h = harness(remote);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = Arc::clone(&h.coordinator);
            handles.push(tokio::spawn(async move { coordinator.get("shared").await }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Lookup::Hit { disk_path, .. } => paths.push(disk_path),
                Lookup::Miss => panic!("expected hit"),
            }
        }

        assert_eq!(h.remote.loads(), 1);
        assert_eq!(h.local.puts(), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn remote_failure_propagates_on_get() {
        let remote = FakeRemote::new();
        remote.fail_loads();
        let h = harness(remote);

        let err = h.coordinator.get("k").await.unwrap_err();
        assert_eq!(err.remote().and_then(|e| e.status()), Some(500));
    }

    #[tokio::test]
    async fn indexed_absence_skips_remote() {
        let lister = Arc::new(FakeLister::new(vec!["other".into()], 10));
        let index = KeyIndex::new(Some(lister), "", None);
        let h = harness_with(FakeRemote::new().with_blob("k", b"unlisted"), index, "");

        assert_eq!(h.coordinator.get("k").await.unwrap(), Lookup::Miss);
        assert_eq!(h.remote.loads(), 0);
        assert_eq!(h.local.gets(), 1);
    }

    #[tokio::test]
    async fn put_then_get_is_served_locally() {
        let h = harness(FakeRemote::new());
        let object = CacheObject::from_bytes("k1", "out1", b"built".to_vec());

        let path = h.coordinator.put(object).await.unwrap();
        let lookup = h.coordinator.get("k1").await.unwrap();

        assert_eq!(
            lookup,
            Lookup::Hit {
                output_id: Some("out1".into()),
                disk_path: path,
            }
        );
        assert_eq!(h.remote.loads(), 0);
        h.coordinator.close().await;
    }

    #[tokio::test]
    async fn put_does_not_wait_for_upload() {
        let h = harness(FakeRemote::gated());

        let path = tokio::time::timeout(
            Duration::from_secs(5),
            h.coordinator
                .put(CacheObject::from_bytes("slow", "o", b"data".to_vec())),
        )
        .await
        .expect("put blocked on upload")
        .unwrap();

        assert!(path.exists());
        assert_eq!(h.coordinator.pending_uploads(), 1);
        assert_eq!(h.remote.saves(), 0);

        h.remote.release_saves(1);
        h.coordinator.close().await;
        assert_eq!(h.remote.blob("slow").unwrap(), b"data");
    }

    #[tokio::test]
    async fn close_waits_for_every_pending_upload() {
        let h = harness(FakeRemote::gated());
        for i in 0..3 {
            h.coordinator
                .put(CacheObject::from_bytes(format!("k{}", i), "o", body(64)))
                .await
                .unwrap();
        }

        let closer = {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move { coordinator.close().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        h.remote.release_saves(3);
        closer.await.unwrap();
        assert_eq!(h.remote.saves(), 3);
        assert_eq!(h.coordinator.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn conflict_is_success_and_not_retried() {
        let remote = FakeRemote::new();
        remote.set_save_outcome(SaveOutcome::Conflict);
        let h = harness(remote);

        let path = h
            .coordinator
            .put(CacheObject::from_bytes("dup", "o", b"x".to_vec()))
            .await
            .unwrap();
        h.coordinator.close().await;

        assert!(path.exists());
        assert_eq!(h.remote.saves(), 1);
    }

    #[tokio::test]
    async fn upload_failure_is_not_surfaced() {
        let remote = FakeRemote::new();
        remote.set_save_outcome(SaveOutcome::Fail);
        let h = harness(remote);

        let result = h
            .coordinator
            .put(CacheObject::from_bytes("k", "o", b"x".to_vec()))
            .await;
        h.coordinator.close().await;

        assert!(result.is_ok());
        assert_eq!(h.remote.saves(), 1);
    }

    #[tokio::test]
    async fn indexed_key_skips_upload() {
        let lister = Arc::new(FakeLister::new(vec!["known".into()], 10));
        let index = KeyIndex::new(Some(lister), "", None);
        let h = harness_with(FakeRemote::new(), index, "");

        h.coordinator
            .put(CacheObject::from_bytes("known", "o", b"x".to_vec()))
            .await
            .unwrap();
        h.coordinator.close().await;

        assert_eq!(h.remote.saves(), 0);
        assert_eq!(h.coordinator.stats().uploads_skipped, 1);
    }

    #[tokio::test]
    async fn concurrent_puts_upload_once() {
        let h = harness(FakeRemote::gated());
        for _ in 0..4 {
            h.coordinator
                .put(CacheObject::from_bytes("same", "o", b"same body".to_vec()))
                .await
                .unwrap();
        }
        assert_eq!(h.coordinator.pending_uploads(), 4);

        // Let every upload task join the leader's flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.remote.release_saves(4);
        h.coordinator.close().await;
        assert_eq!(h.remote.saves(), 1);
    }

    #[tokio::test]
    async fn prefix_namespaces_both_tiers() {
        let h = harness_with(FakeRemote::new(), KeyIndex::disabled(), "go-");
        h.coordinator
            .put(CacheObject::from_bytes("abc", "o", b"x".to_vec()))
            .await
            .unwrap();
        h.coordinator.close().await;

        assert_eq!(h.remote.keys(), vec!["go-abc".to_string()]);
        assert!(h.local.get("go-abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn uploaded_key_is_indexed_by_a_fresh_process() {
        let h = harness(FakeRemote::new());
        let payload = body(1024);

        let path = h
            .coordinator
            .put(CacheObject::from_bytes("build-42", "o", payload.clone()))
            .await
            .unwrap();
        assert!(path.exists());
        h.coordinator.close().await;
        assert_eq!(h.remote.blob("build-42").unwrap(), payload);

        let index = KeyIndex::new(Some(h.remote.clone()), "", None);
        assert!(index.exists("build-42").await);
    }
}
