/// Signal handling for emergency shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request shutdown: the runner stops the
/// worker, restores the patched config and reports the run as failed.
/// A second SIGINT while cleanup is running exits immediately.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, warn};

/// Exit code used when the operator insists on a second Ctrl-C.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared shutdown flag. Clones observe the same request.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns true for the first request only.
    pub fn request(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Install SIGINT/SIGTERM listeners that feed `shutdown`.
pub fn install(shutdown: Shutdown) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = int.recv() => warn!("received SIGINT, stopping worker and restoring config"),
            _ = term.recv() => warn!("received SIGTERM, stopping worker and restoring config"),
        }
        shutdown.request();

        if int.recv().await.is_some() {
            error!("second SIGINT, exiting without cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
    Ok(())
}
