//! Policy compilation and lifecycle orchestration for the agentic workflow
//! firewall.
//!
//! A run confines one untrusted agent process:
//!
//! - network egress is limited to an allow-list of domains, enforced by a
//!   filtering proxy ([`firewall::ProxyAcl`]) behind host packet-filter rules
//!   ([`firewall::HostRuleSet`])
//! - syscalls are limited by a deny-by-default seccomp profile
//!   ([`seccomp::SeccompProfile`])
//! - credentials live on disk only between container start and redaction
//!
//! [`SandboxOrchestrator`] sequences the run against a [`host::SandboxHost`];
//! [`host::DockerHost`] is the Docker and iptables backed implementation, and
//! also answers the read-only [`diagnostics`] queries.

pub mod diagnostics;
pub mod error;
pub mod firewall;
pub mod host;
pub mod orchestrator;
pub mod policy;
pub mod proxy_log;
pub mod seccomp;

pub use error::SandboxError;
pub use firewall::PolicyCompilationError;
pub use host::{AgentExit, DockerHost, NetworkTopology, SandboxHost};
pub use orchestrator::{
    Capabilities, LifecycleHooks, LifecycleStep, RunOutcome, SandboxOrchestrator,
};
pub use policy::CompiledPolicy;
pub use seccomp::{SeccompProfile, SeccompValidationError, ValidationReport};
