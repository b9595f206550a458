//! Configuration components for the agentic workflow firewall.
//!
//! This crate owns everything that is parsed or defaulted before a sandbox run
//! starts: the domain rule schema, the validated [`WorkflowConfig`] consumed by
//! the orchestrator, the optional TOML run-config file and the named defaults
//! (DNS resolvers, proxy port, network addresses) the rest of the workspace
//! refers to instead of inline literals.

pub mod constants;
pub mod error;
pub mod loader;
pub mod rules;
pub mod workflow;

pub use error::SchemaError;
pub use loader::RunConfigFile;
pub use rules::{DomainRule, RuleSet, is_bare_hostname, merge, merge_rules};
pub use workflow::{WorkflowConfig, WorkflowConfigBuilder};
