use anyhow::Result;
use async_trait::async_trait;

use crate::host::NetworkTopology;

/// Observer callbacks fired at fixed points of a run.
///
/// Each hook fires exactly once per run. An error aborts the run at the step
/// that fired it; cleanup still happens.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Host filtering is live. Nothing else has touched the network yet.
    async fn on_host_filtered(&self, _topology: &NetworkTopology) -> Result<()> {
        Ok(())
    }

    /// Containers are running; secrets may still be on disk.
    async fn on_containers_started(&self, _topology: &NetworkTopology) -> Result<()> {
        Ok(())
    }
}
