use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};

use crate::constants::defaults::DEFAULT_DNS_SERVERS;
use crate::rules::{DomainRule, RuleSet, merge_rules};

/// Validated configuration for a single sandbox run.
///
/// Owned by the orchestrator for the duration of one run and never shared
/// across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub work_dir: PathBuf,
    /// Merged allow rules, in first-seen order across all sources.
    pub domain_rules: Vec<DomainRule>,
    /// Resolvers the sandbox may query; `None` selects the default pair.
    pub dns_servers: Option<Vec<String>>,
    pub proxy_logs_dir: Option<PathBuf>,
    pub enable_api_proxy: bool,
    pub skip_pull: bool,
    /// Extra host variables passed to the agent by exact name.
    pub forward_env: Vec<String>,
    /// Command executed inside the agent container.
    pub agent_command: Vec<String>,
}

impl WorkflowConfig {
    pub fn builder(work_dir: impl Into<PathBuf>) -> WorkflowConfigBuilder {
        WorkflowConfigBuilder::new(work_dir)
    }

    /// The merged allowed-domain list: every rule's domain, duplicates kept.
    pub fn allowed_domains(&self) -> Vec<String> {
        self.domain_rules
            .iter()
            .map(|rule| rule.domain.clone())
            .collect()
    }

    /// Configured resolvers, or the default pair when none were supplied.
    pub fn dns_servers(&self) -> Vec<String> {
        match &self.dns_servers {
            Some(servers) => servers.clone(),
            None => DEFAULT_DNS_SERVERS.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    pub fn proxy_logs_dir(&self) -> Option<&Path> {
        self.proxy_logs_dir.as_deref()
    }
}

/// Builder for [`WorkflowConfig`].
#[derive(Debug, Clone)]
pub struct WorkflowConfigBuilder {
    work_dir: PathBuf,
    rule_sets: Vec<RuleSet>,
    extra_rules: Vec<DomainRule>,
    dns_servers: Option<Vec<String>>,
    proxy_logs_dir: Option<PathBuf>,
    enable_api_proxy: bool,
    skip_pull: bool,
    forward_env: Vec<String>,
    agent_command: Vec<String>,
}

impl WorkflowConfigBuilder {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            rule_sets: Vec::new(),
            extra_rules: Vec::new(),
            dns_servers: None,
            proxy_logs_dir: None,
            enable_api_proxy: false,
            skip_pull: false,
            forward_env: Vec::new(),
            agent_command: Vec::new(),
        }
    }

    /// Append a validated rule source. Sources merge in the order added.
    pub fn rule_set(mut self, rule_set: RuleSet) -> Self {
        self.rule_sets.push(rule_set);
        self
    }

    /// Append an exact-host rule after all rule sets.
    pub fn allow_domain(mut self, domain: impl Into<String>) -> Self {
        self.extra_rules.push(DomainRule::exact(domain));
        self
    }

    pub fn rule(mut self, rule: DomainRule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    pub fn dns_servers(mut self, servers: Vec<String>) -> Self {
        self.dns_servers = Some(servers);
        self
    }

    pub fn proxy_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.proxy_logs_dir = Some(dir.into());
        self
    }

    pub fn enable_api_proxy(mut self, enabled: bool) -> Self {
        self.enable_api_proxy = enabled;
        self
    }

    pub fn skip_pull(mut self, skip: bool) -> Self {
        self.skip_pull = skip;
        self
    }

    /// Request host variables by name; repeated names are kept once.
    pub fn forward_env<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.forward_env.contains(&name) {
                self.forward_env.push(name);
            }
        }
        self
    }

    pub fn agent_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<WorkflowConfig> {
        ensure!(
            !self.work_dir.as_os_str().is_empty(),
            "work directory must not be empty"
        );
        ensure!(
            !self.agent_command.is_empty(),
            "an agent command is required"
        );
        if let Some(servers) = &self.dns_servers {
            ensure!(
                !servers.is_empty(),
                "dns servers, when given, must not be empty"
            );
        }

        for name in &self.forward_env {
            ensure!(
                is_env_name(name),
                "`{name}` is not a valid environment variable name"
            );
        }

        let mut domain_rules = merge_rules(&self.rule_sets);
        domain_rules.extend(self.extra_rules);

        Ok(WorkflowConfig {
            work_dir: self.work_dir,
            domain_rules,
            dns_servers: self.dns_servers,
            proxy_logs_dir: self.proxy_logs_dir,
            enable_api_proxy: self.enable_api_proxy,
            skip_pull: self.skip_pull,
            forward_env: self.forward_env,
            agent_command: self.agent_command,
        })
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_dns_servers() {
        let config = WorkflowConfig::builder("/tmp/awf-1")
            .agent_command(["echo", "hi"])
            .build()
            .unwrap();
        assert_eq!(config.dns_servers, None);
        assert_eq!(config.dns_servers(), vec!["8.8.8.8", "8.8.4.4"]);
    }

    #[test]
    fn test_explicit_dns_servers_replace_defaults() {
        let config = WorkflowConfig::builder("/tmp/awf-1")
            .agent_command(["true"])
            .dns_servers(vec!["1.1.1.1".into()])
            .build()
            .unwrap();
        assert_eq!(config.dns_servers(), vec!["1.1.1.1"]);
    }

    #[test]
    fn test_rule_sets_merge_before_extra_domains() {
        let first = RuleSet::load("version: 1\nrules:\n  - domain: a.com\n    subdomains: true\n")
            .unwrap();
        let second = RuleSet::load("version: 1\nrules:\n  - domain: b.com\n").unwrap();
        let config = WorkflowConfig::builder("/tmp/awf-1")
            .allow_domain("c.com")
            .rule_set(first)
            .rule_set(second)
            .agent_command(["true"])
            .build()
            .unwrap();

        assert_eq!(config.allowed_domains(), vec!["a.com", "b.com", "c.com"]);
        assert!(config.domain_rules.first().is_some_and(|rule| rule.subdomains));
    }

    #[test]
    fn test_forward_env_dedupes_and_validates() {
        let config = WorkflowConfig::builder("/tmp/awf-1")
            .agent_command(["true"])
            .forward_env(["NPM_TOKEN", "NPM_TOKEN", "_CI"])
            .build()
            .unwrap();
        assert_eq!(config.forward_env, vec!["NPM_TOKEN", "_CI"]);

        let err = WorkflowConfig::builder("/tmp/awf-1")
            .agent_command(["true"])
            .forward_env(["NPM=TOKEN"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("NPM=TOKEN"));
    }

    #[test]
    fn test_agent_command_required() {
        let err = WorkflowConfig::builder("/tmp/awf-1").build().unwrap_err();
        assert!(err.to_string().contains("agent command"));
    }

    #[test]
    fn test_empty_dns_list_rejected() {
        let err = WorkflowConfig::builder("/tmp/awf-1")
            .agent_command(["true"])
            .dns_servers(Vec::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("dns servers"));
    }
}
