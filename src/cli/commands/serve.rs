//! Serve command - run the cache program on stdin/stdout

use crate::cli::args::ServeArgs;
use crate::config::{Config, ListingEnv, RemoteEnv};
use crate::coordinator::Coordinator;
use crate::error::{ProxyError, ProxyResult};
use crate::index::KeyIndex;
use crate::local::DirCache;
use crate::protocol::Server;
use crate::remote::{ActionsCache, GithubKeyLister, KeyLister};
use futures_util::stream;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

const STDIN_CHUNK: usize = 64 * 1024;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> ProxyResult<()> {
    let coordinator = Arc::new(build_coordinator(args, config)?);

    Server::new(coordinator)
        .run_with_shutdown(spawn_stdin_reader()?, tokio::io::stdout(), shutdown_signal())
        .await
}

/// Read stdin on a plain thread. A read blocked there is abandoned at exit
/// instead of holding up runtime shutdown while the build tool keeps the
/// pipe open.
fn spawn_stdin_reader() -> ProxyResult<impl AsyncRead + Unpin> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || pump(io::stdin().lock(), tx))
        .map_err(|e| ProxyError::io("starting stdin reader", e))?;
    Ok(channel_reader(rx))
}

fn pump<R: Read>(mut input: R, tx: mpsc::Sender<io::Result<Cursor<Vec<u8>>>>) {
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let chunk = match input.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(Cursor::new(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        if tx.blocking_send(chunk).is_err() || failed {
            return;
        }
    }
}

fn channel_reader(
    mut rx: mpsc::Receiver<io::Result<Cursor<Vec<u8>>>>,
) -> impl AsyncRead + Unpin {
    StreamReader::new(stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

/// Wire both tiers and the key index from configuration
pub fn build_coordinator(args: ServeArgs, config: &Config) -> ProxyResult<Coordinator> {
    let endpoint = config.remote_endpoint(&RemoteEnv {
        runtime_token: args.runtime_token,
        cache_url: args.cache_url,
        results_url: args.results_url,
        service_v2: args.service_v2,
    })?;

    let cache_dir = config.cache_dir(args.dir);
    let local = DirCache::open(&cache_dir)?;
    let remote = ActionsCache::new(
        endpoint.api,
        &endpoint.base_url,
        &endpoint.token,
        local.scratch_dir(),
        endpoint.timeout,
    )?;

    let listing = if args.no_listing {
        None
    } else {
        config.listing_source(&ListingEnv {
            token: args.github_token,
            repository: args.repository,
            git_ref: args.git_ref,
            api_url: args.api_url,
        })
    };
    let git_ref = listing.as_ref().and_then(|l| l.git_ref.clone());
    let lister: Option<Arc<dyn KeyLister>> = match listing {
        Some(source) => match GithubKeyLister::new(
            &source.api_url,
            &source.repository,
            &source.token,
            source.timeout,
        ) {
            Ok(lister) => Some(Arc::new(lister) as Arc<dyn KeyLister>),
            Err(e) => {
                warn!(error = %e, "Remote key listing disabled");
                None
            }
        },
        None => None,
    };

    let prefix = config.prefix(args.prefix);
    info!(
        dir = %cache_dir.display(),
        api = %endpoint.api,
        prefix = %prefix,
        listing = lister.is_some(),
        "Starting cache server"
    );

    let index = KeyIndex::new(lister, prefix.clone(), git_ref);
    Ok(Coordinator::new(
        Arc::new(local),
        Arc::new(remote),
        Arc::new(index),
        prefix,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for interrupt, running until input closes");
        std::future::pending::<()>().await;
    }
}
