use std::fmt;
use std::net::Ipv4Addr;

use awf_config::constants::network::{DNS_PORT, HOST_FILTER_CHAIN, HTTPS_PORT};

use super::PolicyCompilationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host packet-filter rule, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRule {
    /// Return traffic for flows that were already admitted.
    AllowEstablished,
    /// The proxy itself must reach the allowed destinations.
    AllowProxyEgress { proxy: Ipv4Addr },
    /// Sandbox containers may reach the proxy's listening port.
    AllowProxy { proxy: Ipv4Addr, port: u16 },
    AllowDns {
        resolver: Ipv4Addr,
        protocol: Protocol,
    },
    /// HTTPS egress for the API proxy; only compiled when that feature is on.
    AllowApiProxyEgress { source: Ipv4Addr, port: u16 },
    /// Terminal rule: everything not admitted above is rejected.
    RejectRemaining,
}

impl HostRule {
    /// iptables match/target arguments for this rule (without `-A <chain>`).
    pub fn to_iptables_spec(&self) -> Vec<String> {
        let mut args: Vec<String> = match self {
            Self::AllowEstablished => vec![
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "ESTABLISHED,RELATED".into(),
            ],
            Self::AllowProxyEgress { proxy } => vec!["-s".into(), proxy.to_string()],
            Self::AllowProxy { proxy, port } => vec![
                "-p".into(),
                "tcp".into(),
                "-d".into(),
                proxy.to_string(),
                "--dport".into(),
                port.to_string(),
            ],
            Self::AllowDns { resolver, protocol } => vec![
                "-p".into(),
                protocol.to_string(),
                "-d".into(),
                resolver.to_string(),
                "--dport".into(),
                DNS_PORT.to_string(),
            ],
            Self::AllowApiProxyEgress { source, port } => vec![
                "-s".into(),
                source.to_string(),
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                port.to_string(),
            ],
            Self::RejectRemaining => {
                return vec![
                    "-j".into(),
                    "REJECT".into(),
                    "--reject-with".into(),
                    "icmp-port-unreachable".into(),
                ];
            }
        };
        args.extend(["-j".to_string(), "ACCEPT".to_string()]);
        args
    }
}

/// The compiled host rules for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRuleSet {
    chain: String,
    rules: Vec<HostRule>,
}

impl HostRuleSet {
    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }

    /// Full `iptables` argument vectors appending every rule to the chain.
    pub fn to_iptables_args(&self) -> Vec<Vec<String>> {
        self.to_iptables_args_for(&self.chain)
    }

    /// The same rules appended to `chain`, for building a replacement chain
    /// under another name.
    pub fn to_iptables_args_for(&self, chain: &str) -> Vec<Vec<String>> {
        self.rules
            .iter()
            .map(|rule| {
                let mut args = vec!["-A".to_string(), chain.to_string()];
                args.extend(rule.to_iptables_spec());
                args
            })
            .collect()
    }
}

/// Parse and validate the resolver list.
pub fn parse_resolvers(dns_servers: &[String]) -> Result<Vec<Ipv4Addr>, PolicyCompilationError> {
    if dns_servers.is_empty() {
        return Err(PolicyCompilationError::EmptyResolvers);
    }
    dns_servers
        .iter()
        .map(|server| {
            server
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| PolicyCompilationError::InvalidResolver(server.clone()))
        })
        .collect()
}

fn parse_address(role: &'static str, address: &str) -> Result<Ipv4Addr, PolicyCompilationError> {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| PolicyCompilationError::InvalidAddress {
            role,
            address: address.to_string(),
        })
}

/// Compile the minimal host rules the sandbox needs to operate.
///
/// The API proxy's egress path is only opened when `api_proxy_address` is
/// supplied, which callers do only when API proxying is enabled.
pub fn compile_host_rules(
    proxy_address: &str,
    port: u16,
    dns_servers: &[String],
    api_proxy_address: Option<&str>,
) -> Result<HostRuleSet, PolicyCompilationError> {
    if port == 0 {
        return Err(PolicyCompilationError::InvalidPort(port));
    }
    let proxy = parse_address("proxy", proxy_address)?;
    let resolvers = parse_resolvers(dns_servers)?;
    let api_proxy = api_proxy_address
        .map(|address| parse_address("api proxy", address))
        .transpose()?;

    let mut rules = vec![
        HostRule::AllowEstablished,
        HostRule::AllowProxyEgress { proxy },
        HostRule::AllowProxy { proxy, port },
    ];
    for resolver in resolvers {
        rules.push(HostRule::AllowDns {
            resolver,
            protocol: Protocol::Udp,
        });
        rules.push(HostRule::AllowDns {
            resolver,
            protocol: Protocol::Tcp,
        });
    }
    if let Some(source) = api_proxy {
        rules.push(HostRule::AllowApiProxyEgress {
            source,
            port: HTTPS_PORT,
        });
    }
    rules.push(HostRule::RejectRemaining);

    Ok(HostRuleSet {
        chain: HOST_FILTER_CHAIN.to_string(),
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dns(servers: &[&str]) -> Vec<String> {
        servers.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_compiles_proxy_and_dns_rules() {
        let set = compile_host_rules("172.30.0.10", 3128, &dns(&["8.8.8.8", "8.8.4.4"]), None)
            .unwrap();
        let proxy = Ipv4Addr::new(172, 30, 0, 10);
        let google = Ipv4Addr::new(8, 8, 8, 8);

        assert_eq!(set.chain(), "FW_WRAPPER");
        assert_eq!(set.rules().len(), 8);
        assert!(set.rules().contains(&HostRule::AllowProxy { proxy, port: 3128 }));
        assert!(set.rules().contains(&HostRule::AllowDns {
            resolver: google,
            protocol: Protocol::Udp,
        }));
        assert_eq!(set.rules().last(), Some(&HostRule::RejectRemaining));
    }

    #[test]
    fn test_api_proxy_egress_only_when_supplied() {
        let without = compile_host_rules("172.30.0.10", 3128, &dns(&["1.1.1.1"]), None).unwrap();
        assert!(!without
            .rules()
            .iter()
            .any(|rule| matches!(rule, HostRule::AllowApiProxyEgress { .. })));

        let with =
            compile_host_rules("172.30.0.10", 3128, &dns(&["1.1.1.1"]), Some("172.30.0.30"))
                .unwrap();
        assert!(with.rules().contains(&HostRule::AllowApiProxyEgress {
            source: Ipv4Addr::new(172, 30, 0, 30),
            port: 443,
        }));
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        assert_eq!(
            compile_host_rules("172.30.0.10", 0, &dns(&["8.8.8.8"]), None),
            Err(PolicyCompilationError::InvalidPort(0))
        );
        assert_eq!(
            compile_host_rules("172.30.0.10", 3128, &[], None),
            Err(PolicyCompilationError::EmptyResolvers)
        );
        assert_eq!(
            compile_host_rules("172.30.0.10", 3128, &dns(&["dns.google"]), None),
            Err(PolicyCompilationError::InvalidResolver("dns.google".into()))
        );
        assert!(matches!(
            compile_host_rules("squid", 3128, &dns(&["8.8.8.8"]), None),
            Err(PolicyCompilationError::InvalidAddress { role: "proxy", .. })
        ));
    }

    #[test]
    fn test_renders_iptables_arguments() {
        let set = compile_host_rules("172.30.0.10", 3128, &dns(&["8.8.8.8"]), None).unwrap();
        let args = set.to_iptables_args();
        assert_eq!(
            args.get(2).cloned().unwrap(),
            vec![
                "-A", "FW_WRAPPER", "-p", "tcp", "-d", "172.30.0.10", "--dport", "3128", "-j",
                "ACCEPT"
            ]
        );
        assert_eq!(
            args.last().cloned().unwrap(),
            vec![
                "-A",
                "FW_WRAPPER",
                "-j",
                "REJECT",
                "--reject-with",
                "icmp-port-unreachable"
            ]
        );
    }
}
