//! GitHub Actions cache client
//!
//! Speaks both generations of the Actions cache service:
//!
//! - v1: the `_apis/artifactcache` REST endpoints under `ACTIONS_CACHE_URL`
//! - v2: the twirp `CacheService` under `ACTIONS_RESULTS_URL`, with blobs
//!   stored through signed storage URLs
//!
//! ureq is blocking, so every call runs under `spawn_blocking`.

use super::{Blob, Download, RemoteCache, RemoteEntry};
use crate::error::{ProxyError, ProxyResult, RemoteError, RemoteResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use ureq::http::Response;
use ureq::{Agent, Body, SendBody};

const V1_ACCEPT: &str = "application/json;api-version=6.0-preview.1";
const TWIRP_SERVICE: &str = "twirp/github.actions.results.api.v1.CacheService";
const VERSION_SALT: &str = "tiercache-1";
/// v1 uploads are split into ranged PATCH requests of this size
const UPLOAD_CHUNK: u64 = 32 * 1024 * 1024;
const MAX_ERROR_BODY: usize = 512;

/// Which cache service generation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    V1,
    V2,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Actions cache client; cheap to clone
#[derive(Clone)]
pub struct ActionsCache {
    inner: Arc<Inner>,
}

struct Inner {
    agent: Agent,
    api: ApiVersion,
    base_url: String,
    auth: String,
    scratch_dir: PathBuf,
    upload_chunk: u64,
}

impl fmt::Debug for ActionsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionsCache")
            .field("api", &self.inner.api)
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

impl ActionsCache {
    /// Create a client for `base_url`, spooling downloads into `scratch_dir`
    pub fn new(
        api: ApiVersion,
        base_url: &str,
        token: &str,
        scratch_dir: PathBuf,
        timeout: Duration,
    ) -> ProxyResult<Self> {
        if token.is_empty() {
            return Err(ProxyError::MissingConfig {
                name: "ACTIONS_RUNTIME_TOKEN",
            });
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ProxyError::Internal(format!(
                "cache service URL must be http(s): {:?}",
                base_url
            )));
        }

        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .user_agent(concat!("tiercache/", env!("CARGO_PKG_VERSION")))
            .build();

        debug!(api = %api, url = base_url, "Configured Actions cache client");
        Ok(Self {
            inner: Arc::new(Inner {
                agent: Agent::new_with_config(config),
                api,
                base_url: normalize_base(base_url),
                auth: format!("Bearer {}", token),
                scratch_dir,
                upload_chunk: UPLOAD_CHUNK,
            }),
        })
    }

    #[cfg(test)]
    fn with_upload_chunk(self, upload_chunk: u64) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(Inner {
                agent: inner.agent.clone(),
                api: inner.api,
                base_url: inner.base_url.clone(),
                auth: inner.auth.clone(),
                scratch_dir: inner.scratch_dir.clone(),
                upload_chunk,
            }),
        }
    }

    fn load_blocking(&self, key: &str) -> RemoteResult<ActionsEntry> {
        let url = match self.inner.api {
            ApiVersion::V1 => self.lookup_v1(key)?,
            ApiVersion::V2 => self.lookup_v2(key)?,
        };
        Ok(ActionsEntry {
            key: key.to_string(),
            url,
            cache: self.clone(),
        })
    }

    fn lookup_v1(&self, key: &str) -> RemoteResult<String> {
        let url = format!("{}_apis/artifactcache/cache", self.inner.base_url);
        let version = cache_version(key);
        let resp = self
            .inner
            .agent
            .get(&url)
            .header("Authorization", &self.inner.auth)
            .header("Accept", V1_ACCEPT)
            .query("keys", key)
            .query("version", &version)
            .call()
            .map_err(|e| RemoteError::transport("cache lookup", e))?;

        if matches!(resp.status().as_u16(), 204 | 404) {
            return Err(RemoteError::not_found(key));
        }
        let entry: ArtifactCacheEntry = read_json("cache lookup", expect_success("cache lookup", resp)?)?;

        // Lookup keys are prefix matches; only an exact hit counts.
        match entry {
            ArtifactCacheEntry {
                cache_key: Some(found),
                archive_location: Some(location),
            } if found == key => Ok(location),
            _ => Err(RemoteError::not_found(key)),
        }
    }

    fn lookup_v2(&self, key: &str) -> RemoteResult<String> {
        let version = cache_version(key);
        let request = DownloadUrlRequest {
            key,
            restore_keys: Vec::new(),
            version: &version,
        };
        let resp = self.twirp("GetCacheEntryDownloadURL", &request)?;
        if resp.status().as_u16() == 404 {
            return Err(RemoteError::not_found(key));
        }
        let body: DownloadUrlResponse =
            read_json("cache lookup", expect_success("cache lookup", resp)?)?;

        if !body.ok || body.signed_download_url.is_empty() {
            return Err(RemoteError::not_found(key));
        }
        if !body.matched_key.is_empty() && body.matched_key != key {
            return Err(RemoteError::not_found(key));
        }
        Ok(body.signed_download_url)
    }

    fn fetch_blocking(&self, key: &str, url: &str) -> RemoteResult<Download> {
        let resp = self
            .inner
            .agent
            .get(url)
            .call()
            .map_err(|e| RemoteError::transport("download", e))?;
        if resp.status().as_u16() == 404 {
            return Err(RemoteError::not_found(key));
        }
        let mut resp = expect_success("download", resp)?;
        let mut reader = resp.body_mut().as_reader();
        let download = Download::spool(&self.inner.scratch_dir, &mut reader)
            .map_err(|e| RemoteError::io(format!("spooling download of {}", key), e))?;
        trace!(key, size = download.size(), "Downloaded remote entry");
        Ok(download)
    }

    fn save_blocking(&self, key: &str, blob: Blob) -> RemoteResult<()> {
        match self.inner.api {
            ApiVersion::V1 => self.save_v1(key, blob),
            ApiVersion::V2 => self.save_v2(key, blob),
        }
    }

    fn save_v1(&self, key: &str, blob: Blob) -> RemoteResult<()> {
        let version = cache_version(key);
        let size = blob.size();
        let caches_url = format!("{}_apis/artifactcache/caches", self.inner.base_url);

        let resp = self
            .inner
            .agent
            .post(&caches_url)
            .header("Authorization", &self.inner.auth)
            .header("Accept", V1_ACCEPT)
            .send_json(&ReserveRequest {
                key,
                version: &version,
                cache_size: size,
            })
            .map_err(|e| RemoteError::transport("reserve", e))?;
        if resp.status().as_u16() == 409 {
            return Err(RemoteError::conflict(key));
        }
        let reserved: ReserveResponse = read_json("reserve", expect_success("reserve", resp)?)?;
        let entry_url = format!("{}/{}", caches_url, reserved.cache_id);

        let mut reader = blob.into_reader();
        let mut offset = 0u64;
        let mut chunk = Vec::new();
        while offset < size {
            chunk.clear();
            (&mut reader)
                .take(self.inner.upload_chunk)
                .read_to_end(&mut chunk)
                .map_err(|e| RemoteError::io(format!("reading upload body for {}", key), e))?;
            if chunk.is_empty() {
                return Err(RemoteError::io(
                    format!("reading upload body for {}", key),
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("body ended after {} of {} bytes", offset, size),
                    ),
                ));
            }

            let end = offset + chunk.len() as u64 - 1;
            let resp = self
                .inner
                .agent
                .patch(&entry_url)
                .header("Authorization", &self.inner.auth)
                .header("Accept", V1_ACCEPT)
                .header("Content-Type", "application/octet-stream")
                .header("Content-Range", format!("bytes {}-{}/*", offset, end))
                .send(&chunk[..])
                .map_err(|e| RemoteError::transport("upload chunk", e))?;
            expect_success("upload chunk", resp)?;
            offset = end + 1;
        }

        let resp = self
            .inner
            .agent
            .post(&entry_url)
            .header("Authorization", &self.inner.auth)
            .header("Accept", V1_ACCEPT)
            .send_json(&CommitRequest { size })
            .map_err(|e| RemoteError::transport("commit", e))?;
        expect_success("commit", resp)?;
        Ok(())
    }

    fn save_v2(&self, key: &str, blob: Blob) -> RemoteResult<()> {
        let version = cache_version(key);
        let size = blob.size();

        let resp = self.twirp(
            "CreateCacheEntry",
            &CreateEntryRequest {
                key,
                version: &version,
            },
        )?;
        if resp.status().as_u16() == 409 {
            return Err(RemoteError::conflict(key));
        }
        let created: CreateEntryResponse =
            read_json("create entry", expect_success("create entry", resp)?)?;
        if !created.ok || created.signed_upload_url.is_empty() {
            return Err(RemoteError::conflict(key));
        }

        let mut reader = blob.into_reader();
        let resp = self
            .inner
            .agent
            .put(&created.signed_upload_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Length", size.to_string())
            .send(SendBody::from_reader(&mut reader))
            .map_err(|e| RemoteError::transport("blob upload", e))?;
        expect_success("blob upload", resp)?;

        let resp = self.twirp(
            "FinalizeCacheEntryUpload",
            &FinalizeRequest {
                key,
                size_bytes: size.to_string(),
                version: &version,
            },
        )?;
        let finalized: FinalizeResponse =
            read_json("finalize", expect_success("finalize", resp)?)?;
        if !finalized.ok {
            return Err(RemoteError::Protocol {
                operation: "finalize",
                reason: format!("service rejected upload of {}", key),
            });
        }
        Ok(())
    }

    fn twirp<T: Serialize>(&self, method: &'static str, body: &T) -> RemoteResult<Response<Body>> {
        let url = format!("{}{}/{}", self.inner.base_url, TWIRP_SERVICE, method);
        self.inner
            .agent
            .post(&url)
            .header("Authorization", &self.inner.auth)
            .send_json(body)
            .map_err(|e| RemoteError::transport(method, e))
    }
}

#[async_trait]
impl RemoteCache for ActionsCache {
    async fn load(&self, key: &str) -> RemoteResult<Box<dyn RemoteEntry>> {
        let cache = self.clone();
        let key = key.to_string();
        let entry = tokio::task::spawn_blocking(move || cache.load_blocking(&key))
            .await
            .map_err(joined)??;
        Ok(Box::new(entry))
    }

    async fn save(&self, key: &str, blob: Blob) -> RemoteResult<()> {
        let cache = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.save_blocking(&key, blob))
            .await
            .map_err(joined)?
    }
}

/// Entry located by a successful lookup
struct ActionsEntry {
    key: String,
    url: String,
    cache: ActionsCache,
}

#[async_trait]
impl RemoteEntry for ActionsEntry {
    async fn download(&self) -> RemoteResult<Download> {
        let cache = self.cache.clone();
        let key = self.key.clone();
        let url = self.url.clone();
        tokio::task::spawn_blocking(move || cache.fetch_blocking(&key, &url))
            .await
            .map_err(joined)?
    }
}

/// Version string scoping entries written by this tool
pub fn cache_version(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(VERSION_SALT.as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    format!("{}/", trimmed)
}

fn joined(err: tokio::task::JoinError) -> RemoteError {
    RemoteError::io("joining blocking HTTP task", io::Error::other(err))
}

fn expect_success(operation: &'static str, mut resp: Response<Body>) -> RemoteResult<Response<Body>> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = resp.body_mut().read_to_string().unwrap_or_default();
    Err(RemoteError::Status {
        operation,
        status,
        message: truncate(message),
    })
}

fn read_json<T: DeserializeOwned>(operation: &'static str, mut resp: Response<Body>) -> RemoteResult<T> {
    resp.body_mut()
        .read_json()
        .map_err(|e| RemoteError::Protocol {
            operation,
            reason: e.to_string(),
        })
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message.trim().to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactCacheEntry {
    cache_key: Option<String>,
    archive_location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest<'a> {
    key: &'a str,
    version: &'a str,
    cache_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveResponse {
    cache_id: u64,
}

#[derive(Debug, Serialize)]
struct CommitRequest {
    size: u64,
}

#[derive(Debug, Serialize)]
struct DownloadUrlRequest<'a> {
    key: &'a str,
    restore_keys: Vec<&'a str>,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DownloadUrlResponse {
    ok: bool,
    signed_download_url: String,
    matched_key: String,
}

#[derive(Debug, Serialize)]
struct CreateEntryRequest<'a> {
    key: &'a str,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateEntryResponse {
    ok: bool,
    signed_upload_url: String,
}

/// int64 fields travel as strings in the twirp JSON encoding
#[derive(Debug, Serialize)]
struct FinalizeRequest<'a> {
    key: &'a str,
    size_bytes: String,
    version: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FinalizeResponse {
    ok: bool,
}
