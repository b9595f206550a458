use std::fmt::Write as _;

use awf_config::constants::files::{PROXY_ACCESS_LOG, PROXY_CONTAINER_LOG_DIR};
use awf_config::constants::network::SUBNET;

use super::ProxyAcl;

pub const ACCESS_LOG_FORMAT: &str = r#"%ts.%03tu %>a:%>p %{Host}>h %<a:%<p %rv %rm %>Hs %Ss:%Sh %ru "%{User-Agent}>h""#;

/// Render the filtering proxy's configuration for one run.
///
/// Everything not admitted by an `allowed_domains` entry hits the final
/// `http_access deny all`.
pub fn render_squid_config(acl: &ProxyAcl, port: u16, dns_servers: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by awf. Do not edit.");
    let _ = writeln!(out, "http_port {port}");
    let _ = writeln!(out);

    // Only the sandbox network may use the proxy.
    let _ = writeln!(out, "acl localnet src {SUBNET}");
    let _ = writeln!(out, "acl SSL_ports port 443");
    let _ = writeln!(out, "acl Safe_ports port 80");
    let _ = writeln!(out, "acl Safe_ports port 443");
    let _ = writeln!(out, "acl CONNECT method CONNECT");
    for pattern in acl.patterns() {
        let _ = writeln!(out, "acl allowed_domains dstdomain {pattern}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "http_access deny !Safe_ports");
    let _ = writeln!(out, "http_access deny CONNECT !SSL_ports");
    if !acl.is_empty() {
        let _ = writeln!(out, "http_access allow localnet allowed_domains");
    }
    let _ = writeln!(out, "http_access deny all");
    let _ = writeln!(out);

    if !dns_servers.is_empty() {
        let _ = writeln!(out, "dns_nameservers {}", dns_servers.join(" "));
    }
    let _ = writeln!(out, "logformat firewall_detailed {ACCESS_LOG_FORMAT}");
    let _ = writeln!(
        out,
        "access_log {PROXY_CONTAINER_LOG_DIR}/{PROXY_ACCESS_LOG} firewall_detailed"
    );
    let _ = writeln!(out, "cache deny all");
    let _ = writeln!(out, "via off");
    let _ = writeln!(out, "forwarded_for delete");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::compile_proxy_acl;
    use awf_config::DomainRule;

    #[test]
    fn test_renders_allow_rules_before_deny_all() {
        let acl = compile_proxy_acl(&[
            DomainRule::with_subdomains("github.com"),
            DomainRule::exact("api.anthropic.com"),
        ])
        .unwrap();
        let config = render_squid_config(&acl, 3128, &["8.8.8.8".into(), "8.8.4.4".into()]);
        assert!(config.contains("http_port 3128\n"));
        assert!(config.contains("acl localnet src 172.30.0.0/24\n"));
        assert!(config.contains("acl allowed_domains dstdomain .github.com\n"));
        assert!(config.contains("acl allowed_domains dstdomain api.anthropic.com\n"));
        assert!(config.contains("dns_nameservers 8.8.8.8 8.8.4.4\n"));
        assert!(config.contains("logformat firewall_detailed %ts.%03tu"));

        let allow = config.find("http_access allow localnet allowed_domains").unwrap();
        let deny = config.find("http_access deny all").unwrap();
        assert!(allow < deny);
    }

    #[test]
    fn test_empty_acl_denies_everything() {
        let config = render_squid_config(&ProxyAcl::default(), 3128, &[]);
        assert!(!config.contains("allowed_domains"));
        assert!(config.contains("http_access deny all"));
        assert!(!config.contains("dns_nameservers"));
    }
}
