//! Line-oriented request loop
//!
//! Requests are read sequentially from the input and dispatched
//! concurrently; responses are written by a single writer task, one JSON
//! object per line, in completion order.

use super::{base64_bytes, Request, Response};
use crate::coordinator::{Coordinator, Lookup};
use crate::error::{ProxyError, ProxyResult};
use crate::local::{CacheObject, LocalEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Operations the server dispatches to
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Look up a hex key; `None` is a miss
    async fn get(&self, key: &str) -> ProxyResult<Option<LocalEntry>>;

    /// Store an object and return where it lives on disk
    async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf>;

    /// Called once after the last request has been answered
    async fn close(&self);
}

#[async_trait]
impl Handler for Coordinator {
    async fn get(&self, key: &str) -> ProxyResult<Option<LocalEntry>> {
        match Coordinator::get(self, key).await? {
            Lookup::Hit {
                output_id: Some(output_id),
                disk_path,
            } => Ok(Some(LocalEntry {
                output_id,
                path: disk_path,
            })),
            // Just copied in from the remote tier; the local tier knows the
            // id it assigned.
            Lookup::Hit { output_id: None, .. } => self.local_entry(key).await,
            Lookup::Miss => Ok(None),
        }
    }

    async fn put(&self, object: CacheObject) -> ProxyResult<PathBuf> {
        Coordinator::put(self, object).await
    }

    async fn close(&self) {
        Coordinator::close(self).await
    }
}

/// Cache program server over a pair of byte streams
pub struct Server<H: Handler> {
    handler: Arc<H>,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Serve until `close` or end of input
    pub async fn run<R, W>(&self, input: R, output: W) -> ProxyResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.run_with_shutdown(input, output, std::future::pending())
            .await
    }

    /// Serve until `close`, end of input, or `shutdown` resolves.
    ///
    /// In every case in-flight requests are answered and the handler's
    /// close hook runs before this returns.
    pub async fn run_with_shutdown<R, W, S>(&self, input: R, output: W, shutdown: S) -> ProxyResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_responses(output, rx));
        let _ = tx.send(Response::hello());

        let requests = TaskTracker::new();
        let mut lines = BufReader::new(input).lines();
        let mut close_id = None;
        tokio::pin!(shutdown);

        let outcome = loop {
            let line = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, draining requests");
                    break Ok(());
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Input closed");
                    break Ok(());
                }
                Err(e) => break Err(ProxyError::io("reading request", e)),
            };
            if line.trim().is_empty() {
                continue;
            }

            let req: Request = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => break Err(ProxyError::Protocol(format!("malformed request: {}", e))),
            };
            trace!(id = req.id, command = %req.command, "Request");

            let command = req.command.clone();
            match command.as_str() {
                "get" => {
                    let handler = Arc::clone(&self.handler);
                    let tx = tx.clone();
                    requests.spawn(async move {
                        let _ = tx.send(handle_get(handler.as_ref(), &req).await);
                    });
                }
                "put" => {
                    let body = match read_body(&mut lines, req.body_size).await {
                        Ok(body) => body,
                        Err(e) => break Err(e),
                    };
                    let handler = Arc::clone(&self.handler);
                    let tx = tx.clone();
                    requests.spawn(async move {
                        let _ = tx.send(handle_put(handler.as_ref(), &req, body).await);
                    });
                }
                "close" => {
                    close_id = Some(req.id);
                    break Ok(());
                }
                other => {
                    warn!(id = req.id, command = %other, "Unknown command");
                    let _ = tx.send(Response::error(req.id, format!("unknown command {:?}", other)));
                }
            }
        };

        requests.close();
        requests.wait().await;
        self.handler.close().await;
        if let Some(id) = close_id {
            let _ = tx.send(Response::ok(id));
        }
        drop(tx);

        let written = writer
            .await
            .map_err(|e| ProxyError::Internal(format!("response writer failed: {}", e)))?;
        outcome.and(written)
    }
}

/// Read the body line following a put. The body is a JSON string holding
/// base64; a put without a body has no extra line.
async fn read_body<R>(lines: &mut Lines<BufReader<R>>, body_size: i64) -> ProxyResult<Body>
where
    R: AsyncRead + Unpin,
{
    if body_size <= 0 {
        return Ok(Body::Bytes(Vec::new()));
    }

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| ProxyError::io("reading put body", e))?
            .ok_or_else(|| ProxyError::Protocol("input closed before put body".into()))?;
        if line.trim().is_empty() {
            continue;
        }

        let encoded: String = match serde_json::from_str(&line) {
            Ok(encoded) => encoded,
            Err(e) => return Ok(Body::Invalid(format!("malformed put body: {}", e))),
        };
        return Ok(match base64_bytes::decode(&encoded) {
            Ok(bytes) => Body::Bytes(bytes),
            Err(e) => Body::Invalid(format!("malformed put body: {}", e)),
        });
    }
}

/// A put body, or why it could not be decoded. A bad body fails only its
/// own request.
enum Body {
    Bytes(Vec<u8>),
    Invalid(String),
}

async fn handle_get<H: Handler + ?Sized>(handler: &H, req: &Request) -> Response {
    if req.action_id.is_empty() {
        return Response::error(req.id, "get without ActionID");
    }
    let key = hex::encode(&req.action_id);

    let entry = match handler.get(&key).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return Response::miss(req.id),
        Err(e) => {
            warn!(id = req.id, key = %key, error = %e, "Get failed");
            return Response::error(req.id, e);
        }
    };

    match hit_response(req.id, &entry).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(id = req.id, key = %key, error = %e, "Get failed");
            Response::error(req.id, e)
        }
    }
}

async fn hit_response(id: i64, entry: &LocalEntry) -> ProxyResult<Response> {
    let output_id = hex::decode(&entry.output_id).map_err(|e| {
        ProxyError::Protocol(format!("stored output id {:?} is not hex: {}", entry.output_id, e))
    })?;
    let metadata = tokio::fs::metadata(&entry.path)
        .await
        .map_err(|e| ProxyError::io(format!("reading metadata of {}", entry.path.display()), e))?;
    let time = metadata.modified().ok().map(DateTime::<Utc>::from);

    Ok(Response {
        id,
        output_id,
        size: metadata.len() as i64,
        time,
        disk_path: entry.path.display().to_string(),
        ..Response::default()
    })
}

async fn handle_put<H: Handler + ?Sized>(handler: &H, req: &Request, body: Body) -> Response {
    let body = match body {
        Body::Bytes(bytes) => bytes,
        Body::Invalid(reason) => return Response::error(req.id, reason),
    };
    if req.action_id.is_empty() {
        return Response::error(req.id, "put without ActionID");
    }
    if body.len() as i64 != req.body_size.max(0) {
        return Response::error(
            req.id,
            format!("body size mismatch: declared {}, got {}", req.body_size, body.len()),
        );
    }

    let key = hex::encode(&req.action_id);
    let object = CacheObject::from_bytes(key.as_str(), hex::encode(req.output_id()), body);
    match handler.put(object).await {
        Ok(path) => Response {
            id: req.id,
            disk_path: path.display().to_string(),
            ..Response::default()
        },
        Err(e) => {
            warn!(id = req.id, key = %key, error = %e, "Put failed");
            Response::error(req.id, e)
        }
    }
}

async fn write_responses<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<Response>) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(resp) = rx.recv().await {
        let mut line = serde_json::to_vec(&resp)?;
        line.push(b'\n');
        output
            .write_all(&line)
            .await
            .map_err(|e| ProxyError::io("writing response", e))?;
        output
            .flush()
            .await
            .map_err(|e| ProxyError::io("flushing response", e))?;
    }
    Ok(())
}
