//! Paginated listing of keys present in the remote cache

use crate::error::{ProxyError, ProxyResult, RemoteError, RemoteResult};
use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use ureq::Agent;

/// Page size requested from the listing endpoint
pub const PER_PAGE: u32 = 100;

/// One page of listed keys plus the total the service reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub total: u64,
}

/// Source of remote key listings
#[async_trait]
pub trait KeyLister: Send + Sync {
    /// Fetch one page (1-based) of keys starting with `prefix`, optionally
    /// restricted to a git ref
    async fn list_page(&self, prefix: &str, git_ref: Option<&str>, page: u32) -> RemoteResult<KeyPage>;
}

struct PageCursor {
    lister: Arc<dyn KeyLister>,
    prefix: String,
    git_ref: Option<String>,
    page: u32,
    seen: u64,
    done: bool,
}

/// Lazily page through every key under `prefix`.
///
/// The stream ends once the cumulative count reaches the reported total, a
/// page comes back empty, or after the first error is yielded. Starting over
/// requires calling `pages` again.
pub fn pages(
    lister: Arc<dyn KeyLister>,
    prefix: impl Into<String>,
    git_ref: Option<String>,
) -> impl Stream<Item = RemoteResult<Vec<String>>> + Send {
    let cursor = PageCursor {
        lister,
        prefix: prefix.into(),
        git_ref,
        page: 1,
        seen: 0,
        done: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }

        let result = cursor
            .lister
            .list_page(&cursor.prefix, cursor.git_ref.as_deref(), cursor.page)
            .await;

        match result {
            Ok(page) => {
                cursor.seen += page.keys.len() as u64;
                debug!(
                    page = cursor.page,
                    total = page.total,
                    keys = page.keys.len(),
                    prefix = %cursor.prefix,
                    "Listed key page"
                );
                if page.keys.is_empty() || cursor.seen >= page.total {
                    cursor.done = true;
                } else {
                    cursor.page += 1;
                }
                Some((Ok(page.keys), cursor))
            }
            Err(e) => {
                cursor.done = true;
                Some((Err(e), cursor))
            }
        }
    })
}

/// Lists caches through the GitHub REST API
#[derive(Clone)]
pub struct GithubKeyLister {
    agent: Agent,
    api_url: String,
    repository: String,
    auth: String,
}

impl GithubKeyLister {
    pub fn new(api_url: &str, repository: &str, token: &str, timeout: Duration) -> ProxyResult<Self> {
        if repository.split('/').count() != 2 {
            return Err(ProxyError::Internal(format!(
                "repository must be owner/name, got {:?}",
                repository
            )));
        }

        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .user_agent(concat!("tiercache/", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self {
            agent: Agent::new_with_config(config),
            api_url: api_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            auth: format!("Bearer {}", token),
        })
    }

    fn caches_url(&self) -> String {
        format!("{}/repos/{}/actions/caches", self.api_url, self.repository)
    }

    fn list_page_blocking(&self, prefix: &str, git_ref: Option<&str>, page: u32) -> RemoteResult<KeyPage> {
        let mut request = self
            .agent
            .get(&self.caches_url())
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", &self.auth)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .query("per_page", PER_PAGE.to_string())
            .query("page", page.to_string());
        if !prefix.is_empty() {
            request = request.query("key", prefix);
        }
        if let Some(git_ref) = git_ref.filter(|r| !r.is_empty()) {
            request = request.query("ref", git_ref);
        }

        let mut resp = request
            .call()
            .map_err(|e| RemoteError::transport("list caches", e))?;
        if !resp.status().is_success() {
            return Err(RemoteError::Status {
                operation: "list caches",
                status: resp.status().as_u16(),
                message: resp.body_mut().read_to_string().unwrap_or_default(),
            });
        }

        let listing: CacheListing = resp
            .body_mut()
            .read_json()
            .map_err(|e| RemoteError::Protocol {
                operation: "list caches",
                reason: e.to_string(),
            })?;
        Ok(listing.into_page())
    }
}

#[async_trait]
impl KeyLister for GithubKeyLister {
    async fn list_page(&self, prefix: &str, git_ref: Option<&str>, page: u32) -> RemoteResult<KeyPage> {
        let lister = self.clone();
        let prefix = prefix.to_string();
        let git_ref = git_ref.map(str::to_string);
        tokio::task::spawn_blocking(move || lister.list_page_blocking(&prefix, git_ref.as_deref(), page))
            .await
            .map_err(|e| RemoteError::io("joining listing task", std::io::Error::other(e)))?
    }
}

#[derive(Debug, Deserialize)]
struct CacheListing {
    total_count: u64,
    #[serde(default)]
    actions_caches: Vec<ListedCache>,
}

#[derive(Debug, Deserialize)]
struct ListedCache {
    key: String,
}

impl CacheListing {
    fn into_page(self) -> KeyPage {
        KeyPage {
            keys: self.actions_caches.into_iter().map(|c| c.key).collect(),
            total: self.total_count,
        }
    }
}
