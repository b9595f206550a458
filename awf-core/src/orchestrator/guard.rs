use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::host::SandboxHost;

/// Owns the cleanup obligation for one run.
///
/// [`release`](Self::release) performs cleanup in line. If the guard is dropped
/// while still armed (a panic, or the run future being cancelled) cleanup is
/// spawned on the current runtime instead.
pub(crate) struct CleanupGuard {
    host: Option<Arc<dyn SandboxHost>>,
}

impl CleanupGuard {
    pub(crate) fn arm(host: Arc<dyn SandboxHost>) -> Self {
        Self { host: Some(host) }
    }

    /// Run cleanup now. Returns whether it succeeded.
    pub(crate) async fn release(mut self) -> bool {
        match self.host.take() {
            Some(host) => cleanup(host).await,
            None => true,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(host) = self.host.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                warn!("sandbox run interrupted; cleaning up in the background");
                handle.spawn(cleanup(host));
            }
            Err(_) => {
                error!(
                    "sandbox run interrupted outside a runtime; host resources were not cleaned up"
                );
            }
        }
    }
}

async fn cleanup(host: Arc<dyn SandboxHost>) -> bool {
    match host.perform_cleanup().await {
        Ok(()) => {
            info!(step = "cleaned-up", "sandbox cleaned up");
            true
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "sandbox cleanup failed");
            false
        }
    }
}
