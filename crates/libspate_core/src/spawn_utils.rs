use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace};

#[derive(Debug)]
struct CancelledError {}
impl std::error::Error for CancelledError {}
impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

/// Spawns a long-running task instrumented with the given span. The task's
/// outcome is logged; an error terminates the task, leaving its supervisor
/// to observe the failure.
#[track_caller]
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        match fut.await {
            Ok(()) => trace!("finished"),
            Err(e) if e.is::<CancelledError>() => debug!("task cancelled"),
            Err(e) => error!("finished with error: {e:#}"),
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

/// Like [`spawn`], but the task also exits (cleanly) when the token fires.
#[track_caller]
pub fn spawn_with_cancel(
    span: tracing::Span,
    cancellation_token: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                bail!(CancelledError{})
            },
            r = fut => r
        }
    })
}

/// Runs blocking file I/O from async context without stalling the executor
/// where the runtime allows it.
#[derive(Clone, Copy, Debug)]
pub struct BlockingSpawner {
    allow_block_in_place: bool,
}

impl BlockingSpawner {
    pub fn new(allow_block_in_place: bool) -> Self {
        Self {
            allow_block_in_place,
        }
    }

    pub fn spawn_block_in_place<F: FnOnce() -> R, R>(&self, f: F) -> R {
        if self.allow_block_in_place {
            return tokio::task::block_in_place(f);
        }
        f()
    }
}

impl Default for BlockingSpawner {
    fn default() -> Self {
        let allow_block_in_place = !matches!(
            tokio::runtime::Handle::current().runtime_flavor(),
            tokio::runtime::RuntimeFlavor::CurrentThread
        );
        Self::new(allow_block_in_place)
    }
}
