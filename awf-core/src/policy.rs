//! Pre-flight compilation of everything a run enforces.

use awf_config::WorkflowConfig;
use awf_config::constants::defaults::PROXY_PORT;
use tracing::debug;

use crate::error::SandboxError;
use crate::firewall::{ProxyAcl, compile_proxy_acl, parse_resolvers};
use crate::seccomp::SeccompProfile;

/// Policy artifacts derived from a [`WorkflowConfig`] before any host change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub proxy_acl: ProxyAcl,
    pub seccomp_profile: SeccompProfile,
    pub proxy_port: u16,
    pub dns_servers: Vec<String>,
}

impl CompiledPolicy {
    /// Validate and compile the run's policy.
    ///
    /// Fails closed: a rejected seccomp profile, an invalid domain or an
    /// unusable resolver list returns an error and nothing is produced.
    pub fn compile(
        config: &WorkflowConfig,
        seccomp_profile: &SeccompProfile,
    ) -> Result<Self, SandboxError> {
        seccomp_profile.validate().into_result()?;

        let proxy_acl = compile_proxy_acl(&config.domain_rules)?;
        let dns_servers = config.dns_servers();
        parse_resolvers(&dns_servers)?;

        debug!(
            acl_entries = proxy_acl.len(),
            dns_servers = ?dns_servers,
            "compiled sandbox policy"
        );

        Ok(Self {
            proxy_acl,
            seccomp_profile: seccomp_profile.clone(),
            proxy_port: PROXY_PORT,
            dns_servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::PolicyCompilationError;
    use awf_config::DomainRule;
    use pretty_assertions::assert_eq;

    fn config() -> awf_config::WorkflowConfigBuilder {
        WorkflowConfig::builder("/tmp/awf-test").agent_command(["true"])
    }

    #[test]
    fn test_defaults_flow_into_policy() {
        let config = config()
            .rule(DomainRule::with_subdomains("github.com"))
            .build()
            .unwrap();
        let policy = CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap();

        assert_eq!(policy.proxy_port, 3128);
        assert_eq!(policy.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert!(policy.proxy_acl.matches("api.github.com"));
    }

    #[test]
    fn test_rejects_bad_resolver() {
        let config = config()
            .dns_servers(vec!["resolver.local".into()])
            .build()
            .unwrap();
        let err =
            CompiledPolicy::compile(&config, &SeccompProfile::builtin().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::PolicyCompilation(PolicyCompilationError::InvalidResolver(_))
        ));
    }

    #[test]
    fn test_rejects_permissive_seccomp_profile() {
        let mut profile = SeccompProfile::builtin().unwrap();
        profile.default_action = crate::seccomp::SeccompAction::Allow;
        let config = config().build().unwrap();
        let err = CompiledPolicy::compile(&config, &profile).unwrap_err();
        assert!(matches!(err, SandboxError::Seccomp(_)));
    }
}
