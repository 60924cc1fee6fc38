//! Index of keys known to exist in the remote cache
//!
//! Built once, on first use, from the paginated remote listing and never
//! changed afterwards. Only a listing that ran to completion can prove a key
//! absent; without a lister, or after a listing error, keys outside the
//! snapshot are reported as [`Presence::Unknown`] so callers fall back to
//! asking the remote tier directly.

use crate::remote::{pages, KeyLister};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// What the index can say about a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Listed remotely
    Present,
    /// Not listed, and the listing was complete
    Absent,
    /// Not listed, but the listing was unavailable or cut short
    Unknown,
}

#[derive(Debug, Default)]
struct Snapshot {
    keys: HashSet<String>,
    complete: bool,
}

/// Lazily-built remote key index
pub struct KeyIndex {
    lister: Option<Arc<dyn KeyLister>>,
    prefix: String,
    git_ref: Option<String>,
    snapshot: OnceCell<Snapshot>,
}

impl KeyIndex {
    pub fn new(lister: Option<Arc<dyn KeyLister>>, prefix: impl Into<String>, git_ref: Option<String>) -> Self {
        Self {
            lister,
            prefix: prefix.into(),
            git_ref,
            snapshot: OnceCell::new(),
        }
    }

    /// Index with no listing source; never authoritative
    pub fn disabled() -> Self {
        Self::new(None, "", None)
    }

    /// Whether `key` is known to exist remotely
    pub async fn exists(&self, key: &str) -> bool {
        self.lookup(key).await == Presence::Present
    }

    pub async fn lookup(&self, key: &str) -> Presence {
        let snapshot = self.snapshot().await;
        if snapshot.keys.contains(key) {
            Presence::Present
        } else if snapshot.complete {
            Presence::Absent
        } else {
            Presence::Unknown
        }
    }

    /// Number of indexed keys, building the index if needed
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.snapshot().await.keys.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn snapshot(&self) -> &Snapshot {
        self.snapshot.get_or_init(|| self.build()).await
    }

    async fn build(&self) -> Snapshot {
        let Some(lister) = self.lister.clone() else {
            debug!("No key listing configured, remote index disabled");
            return Snapshot::default();
        };

        let mut snapshot = Snapshot::default();
        let mut batches = Box::pin(pages(lister, self.prefix.clone(), self.git_ref.clone()));
        while let Some(batch) = batches.next().await {
            match batch {
                Ok(keys) => snapshot.keys.extend(keys),
                Err(e) => {
                    warn!(
                        error = %e,
                        status = ?e.status(),
                        indexed = snapshot.keys.len(),
                        "Remote key listing failed, index left partial"
                    );
                    return snapshot;
                }
            }
        }

        snapshot.complete = true;
        info!(keys = snapshot.keys.len(), prefix = %self.prefix, "Built remote key index");
        snapshot
    }
}
