//! Sandbox lifecycle state machine.
//!
//! A run moves through [`LifecycleStep`]s in a fixed order:
//!
//! 1. `network-ready`: the firewall network exists
//! 2. `host-filtered`: host packet filtering is live
//! 3. `config-written`: proxy, seccomp and compose files are on disk
//! 4. `containers-started`
//! 5. `secrets-redacted`: only with [`Capabilities::secret_redaction`]
//! 6. `agent-complete`: the agent's exit code is known
//! 7. `cleaned-up`: always, on every exit path after pre-flight
//!
//! Policy is compiled and validated before step 1, so schema and compilation
//! errors never leave anything behind on the host.

mod guard;
mod hooks;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use awf_config::WorkflowConfig;

use crate::error::SandboxError;
use crate::host::{NetworkTopology, SandboxHost};
use crate::policy::CompiledPolicy;
use crate::seccomp::SeccompProfile;

use guard::CleanupGuard;
pub use hooks::LifecycleHooks;

/// Optional steps of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Capabilities {
    /// Route model-provider credentials through the API proxy container.
    pub api_proxy: bool,
    /// Redact the compose file once containers have started.
    pub secret_redaction: bool,
}

impl Capabilities {
    /// Neither API proxying nor redaction.
    pub const BASELINE: Self = Self {
        api_proxy: false,
        secret_redaction: false,
    };

    pub const WITH_API_PROXY: Self = Self {
        api_proxy: true,
        secret_redaction: false,
    };

    pub const FULL: Self = Self {
        api_proxy: true,
        secret_redaction: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::FULL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleStep {
    NetworkReady,
    HostFiltered,
    ConfigWritten,
    ContainersStarted,
    SecretsRedacted,
    AgentComplete,
    CleanedUp,
}

impl LifecycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkReady => "network-ready",
            Self::HostFiltered => "host-filtered",
            Self::ConfigWritten => "config-written",
            Self::ContainersStarted => "containers-started",
            Self::SecretsRedacted => "secrets-redacted",
            Self::AgentComplete => "agent-complete",
            Self::CleanedUp => "cleaned-up",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a run that reached the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Steps reached, in order.
    pub completed: Vec<LifecycleStep>,
    /// False when cleanup reported an error. Never affects `exit_code`.
    pub cleanup_succeeded: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Drives one sandbox run against a [`SandboxHost`].
pub struct SandboxOrchestrator {
    host: Arc<dyn SandboxHost>,
    capabilities: Capabilities,
    hooks: Vec<Arc<dyn LifecycleHooks>>,
    seccomp: SeccompProfile,
}

impl SandboxOrchestrator {
    pub fn new(host: Arc<dyn SandboxHost>, seccomp: SeccompProfile) -> Self {
        Self {
            host,
            capabilities: Capabilities::default(),
            hooks: Vec::new(),
            seccomp,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Run the sandbox to completion and report the agent's exit code.
    ///
    /// A nonzero agent exit is a normal outcome. `Err` means the agent was
    /// never run to completion; host cleanup has already happened when the
    /// error is a provisioning failure.
    #[instrument(skip_all, fields(work_dir = %config.work_dir.display()))]
    pub async fn run(&self, config: &WorkflowConfig) -> Result<RunOutcome, SandboxError> {
        let policy = CompiledPolicy::compile(config, &self.seccomp)?;

        let api_proxy = self.capabilities.api_proxy && config.enable_api_proxy;
        let effective;
        let config = if config.enable_api_proxy && !api_proxy {
            effective = WorkflowConfig {
                enable_api_proxy: false,
                ..config.clone()
            };
            &effective
        } else {
            config
        };

        let guard = CleanupGuard::arm(Arc::clone(&self.host));
        let mut completed = Vec::with_capacity(7);
        let result = self
            .drive(config, &policy, api_proxy, &mut completed)
            .await;
        let cleanup_succeeded = guard.release().await;
        completed.push(LifecycleStep::CleanedUp);

        let exit_code = result?;
        if exit_code == 0 {
            info!(exit_code, "agent completed successfully");
        } else {
            warn!(exit_code, "agent exited with a nonzero status");
        }
        Ok(RunOutcome {
            exit_code,
            completed,
            cleanup_succeeded,
        })
    }

    async fn drive(
        &self,
        config: &WorkflowConfig,
        policy: &CompiledPolicy,
        api_proxy: bool,
        completed: &mut Vec<LifecycleStep>,
    ) -> Result<i32, SandboxError> {
        let allowed_domains = config.allowed_domains();

        let topology = self
            .host
            .ensure_firewall_network()
            .await
            .map_err(failed_at(LifecycleStep::NetworkReady))?;
        reached(completed, LifecycleStep::NetworkReady);

        let api_proxy_address = topology
            .api_proxy_address
            .as_deref()
            .filter(|_| api_proxy);
        self.host
            .setup_host_iptables(
                &topology.proxy_address,
                policy.proxy_port,
                &policy.dns_servers,
                api_proxy_address,
            )
            .await
            .map_err(failed_at(LifecycleStep::HostFiltered))?;
        reached(completed, LifecycleStep::HostFiltered);
        self.fire(LifecycleStep::HostFiltered, &topology).await?;

        self.host
            .write_configs(config, policy)
            .await
            .map_err(failed_at(LifecycleStep::ConfigWritten))?;
        reached(completed, LifecycleStep::ConfigWritten);

        self.host
            .start_containers(
                &config.work_dir,
                &allowed_domains,
                config.proxy_logs_dir(),
                config.skip_pull,
            )
            .await
            .map_err(failed_at(LifecycleStep::ContainersStarted))?;
        reached(completed, LifecycleStep::ContainersStarted);
        self.fire(LifecycleStep::ContainersStarted, &topology).await?;

        // The runtime has read the compose file by now.
        if self.capabilities.secret_redaction {
            self.host
                .redact_compose_secrets(&config.work_dir)
                .await
                .map_err(failed_at(LifecycleStep::SecretsRedacted))?;
            reached(completed, LifecycleStep::SecretsRedacted);
        }

        let exit = self
            .host
            .run_agent_command(&config.work_dir, &allowed_domains, config.proxy_logs_dir())
            .await
            .map_err(failed_at(LifecycleStep::AgentComplete))?;
        reached(completed, LifecycleStep::AgentComplete);
        Ok(exit.exit_code)
    }

    async fn fire(
        &self,
        step: LifecycleStep,
        topology: &NetworkTopology,
    ) -> Result<(), SandboxError> {
        for hook in &self.hooks {
            let result = match step {
                LifecycleStep::HostFiltered => hook.on_host_filtered(topology).await,
                LifecycleStep::ContainersStarted => hook.on_containers_started(topology).await,
                _ => Ok(()),
            };
            result.map_err(failed_at(step))?;
        }
        Ok(())
    }
}

fn failed_at(step: LifecycleStep) -> impl FnOnce(anyhow::Error) -> SandboxError {
    move |err| SandboxError::provisioning(step, err)
}

fn reached(completed: &mut Vec<LifecycleStep>, step: LifecycleStep) {
    info!(step = %step, "lifecycle step reached");
    completed.push(step);
}
