use serde::Serialize;

use awf_config::{DomainRule, is_bare_hostname};

use super::PolicyCompilationError;

/// One proxy allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclEntry {
    pub domain: String,
    pub include_subdomains: bool,
}

impl AclEntry {
    /// The `dstdomain` pattern understood by the proxy.
    ///
    /// A leading dot matches the domain itself and all of its subdomains.
    pub fn pattern(&self) -> String {
        if self.include_subdomains {
            format!(".{}", self.domain)
        } else {
            self.domain.clone()
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = normalize(host);
        if host == self.domain {
            return true;
        }
        self.include_subdomains
            && host
                .strip_suffix(self.domain.as_str())
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
    }
}

/// Ordered proxy allow-list. Entries keep merge order and are never collapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyAcl {
    entries: Vec<AclEntry>,
}

impl ProxyAcl {
    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First entry admitting `host`, if any.
    pub fn matching_entry(&self, host: &str) -> Option<&AclEntry> {
        self.entries.iter().find(|entry| entry.matches(host))
    }

    pub fn matches(&self, host: &str) -> bool {
        self.matching_entry(host).is_some()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.entries.iter().map(AclEntry::pattern).collect()
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Compile merged rules into the proxy allow-list.
///
/// An empty rule list is valid and yields an ACL that admits nothing.
pub fn compile_proxy_acl(rules: &[DomainRule]) -> Result<ProxyAcl, PolicyCompilationError> {
    let entries = rules
        .iter()
        .map(|rule| {
            let domain = normalize(&rule.domain);
            if !is_bare_hostname(&domain) {
                return Err(PolicyCompilationError::InvalidDomain(rule.domain.clone()));
            }
            Ok(AclEntry {
                domain,
                include_subdomains: rule.subdomains,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ProxyAcl { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_preserves_order_and_duplicates() {
        let acl = compile_proxy_acl(&[
            DomainRule::with_subdomains("github.com"),
            DomainRule::exact("api.openai.com"),
            DomainRule::exact("github.com"),
        ])
        .unwrap();

        assert_eq!(
            acl.patterns(),
            vec![".github.com", "api.openai.com", "github.com"]
        );
    }

    #[test]
    fn test_subdomain_matching() {
        let acl = compile_proxy_acl(&[
            DomainRule::with_subdomains("github.com"),
            DomainRule::exact("npmjs.org"),
        ])
        .unwrap();

        assert!(acl.matches("github.com"));
        assert!(acl.matches("API.GitHub.com."));
        assert!(acl.matches("objects.githubusercontent.github.com"));
        assert!(!acl.matches("evilgithub.com"));
        assert!(acl.matches("npmjs.org"));
        assert!(!acl.matches("registry.npmjs.org"));
    }

    #[test]
    fn test_empty_rules_admit_nothing() {
        let acl = compile_proxy_acl(&[]).unwrap();
        assert!(acl.is_empty());
        assert!(!acl.matches("github.com"));
    }

    #[test]
    fn test_rejects_url_syntax() {
        let err = compile_proxy_acl(&[DomainRule::exact("https://github.com/")]).unwrap_err();
        assert_eq!(
            err,
            PolicyCompilationError::InvalidDomain("https://github.com/".into())
        );
    }
}
