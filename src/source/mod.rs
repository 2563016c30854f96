//! Static sources
//!
//! A static source is a publisher the server itself originates: the
//! supervisor attaches to a remote URL through the injected `StaticSource`
//! implementation, installs itself as the publisher of its path, and retries
//! with a pause when the upstream fails. The byte-level client (HLS, RTSP,
//! ...) is an external collaborator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::media::Description;
use crate::path::{PathHandle, SessionHandle, SessionKind};
use crate::stream::Stream;

static NEXT_STATIC_SOURCE_ID: AtomicU64 = AtomicU64::new(1 << 32);

/// Handed to a `StaticSource` run; carries everything needed to publish.
pub struct SourceContext {
    pub url: String,
    pub token: CancellationToken,
    path: PathHandle,
    session_id: u64,
}

impl SourceContext {
    /// Install the description learned from the upstream; the path becomes
    /// ready and the returned stream accepts units.
    pub async fn set_ready(&self, description: Description) -> Result<Arc<Stream>> {
        self.path
            .start_publisher(self.session_id, description)
            .await
    }
}

/// Upstream client collaborator.
///
/// `run` attaches to `ctx.url`, calls `ctx.set_ready` once the description
/// is known, then forwards units into the returned stream until the
/// upstream closes, an error occurs, or `ctx.token` is cancelled.
#[async_trait]
pub trait StaticSource: Send + Sync {
    async fn run(&self, ctx: SourceContext) -> Result<()>;
}

/// Retry loop around a `StaticSource`.
pub struct Supervisor {
    token: CancellationToken,
}

impl Supervisor {
    pub(crate) fn spawn(
        url: String,
        path: PathHandle,
        source: Arc<dyn StaticSource>,
        retry_pause: Duration,
        token: CancellationToken,
    ) -> Self {
        let loop_token = token.clone();
        tokio::spawn(async move {
            run_loop(url, path, source, retry_pause, loop_token).await;
        });

        Self { token }
    }

    /// Cancel the in-flight upstream client and stop retrying.
    pub fn close(&self) {
        self.token.cancel();
    }
}

async fn run_loop(
    url: String,
    path: PathHandle,
    source: Arc<dyn StaticSource>,
    retry_pause: Duration,
    token: CancellationToken,
) {
    tracing::info!(url = %url, path = %path.name(), "static source started");

    while !token.is_cancelled() {
        if let Err(err) = run_once(&url, &path, source.as_ref(), &token).await {
            match err {
                Error::Terminated => break,
                err => tracing::info!(url = %url, error = %err, "static source error"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_pause) => {}
            _ = token.cancelled() => break,
        }
    }

    tracing::info!(url = %url, "static source stopped");
}

async fn run_once(
    url: &str,
    path: &PathHandle,
    source: &dyn StaticSource,
    token: &CancellationToken,
) -> Result<()> {
    let session_id = NEXT_STATIC_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
    let (session, mut kick_rx) = SessionHandle::new(session_id, SessionKind::StaticSource);

    path.add_publisher(session).await?;

    let child = token.child_token();
    let ctx = SourceContext {
        url: url.to_string(),
        token: child.clone(),
        path: path.clone(),
        session_id,
    };

    let run_fut = source.run(ctx);
    tokio::pin!(run_fut);

    let result = tokio::select! {
        res = &mut run_fut => res,
        _ = token.cancelled() => {
            // wait for the client's teardown before returning
            run_fut.await.and(Err(Error::Terminated))
        }
        kicked = kick_rx.recv() => {
            child.cancel();
            let _ = run_fut.await;
            Err(kicked.unwrap_or(Error::Terminated))
        }
    };

    path.remove_publisher(session_id).await;
    result
}
