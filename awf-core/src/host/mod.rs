//! Side-effecting collaborators driven by the orchestrator.
//!
//! [`SandboxHost`] has one method per host operation of a run. The orchestrator
//! only talks to the host through this trait, so tests substitute a recording
//! fake and production uses [`DockerHost`].

mod compose;
mod docker;
mod executor;
mod files;
mod inspect;
#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use awf_config::WorkflowConfig;

use crate::policy::CompiledPolicy;

pub use compose::{
    API_PROXY_KEYS, ComposeFile, ComposeNetwork, ComposeService, REDACTED_VALUE,
    SENSITIVE_ENV_NAMES, SENSITIVE_ENV_SUFFIXES, ServiceNetwork, build_compose_file,
    is_sensitive_env, redact_compose_file, redact_compose_value, write_compose_file,
};
pub use docker::DockerHost;
pub use executor::{
    CommandCategory, CommandExecutor, CommandInvocation, CommandOutput,
    OutputMode, ProcessCommandExecutor,
};

/// Addresses of the provisioned firewall network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkTopology {
    pub subnet: String,
    pub proxy_address: String,
    pub agent_address: String,
    pub api_proxy_address: Option<String>,
}

/// Result of running the agent to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub exit_code: i32,
}

impl AgentExit {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

/// Host operations required by a sandbox run, in lifecycle order.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Ensure the isolated network exists. Must be idempotent.
    async fn ensure_firewall_network(&self) -> Result<NetworkTopology>;

    /// Install host filtering. Must fail loudly if any rule cannot be applied.
    async fn setup_host_iptables(
        &self,
        proxy_address: &str,
        port: u16,
        dns_servers: &[String],
        api_proxy_address: Option<&str>,
    ) -> Result<()>;

    /// Materialize runtime configuration, secrets included, owner-only.
    async fn write_configs(&self, config: &WorkflowConfig, policy: &CompiledPolicy) -> Result<()>;

    async fn start_containers(
        &self,
        work_dir: &Path,
        allowed_domains: &[String],
        proxy_logs_dir: Option<&Path>,
        skip_pull: bool,
    ) -> Result<()>;

    /// Strip secret values from the written compose file. Idempotent.
    async fn redact_compose_secrets(&self, work_dir: &Path) -> Result<()>;

    async fn run_agent_command(
        &self,
        work_dir: &Path,
        allowed_domains: &[String],
        proxy_logs_dir: Option<&Path>,
    ) -> Result<AgentExit>;

    /// Tear down transient state. Errors are reported but never change the
    /// run's exit code.
    async fn perform_cleanup(&self) -> Result<()>;
}
