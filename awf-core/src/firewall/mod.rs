//! Firewall policy compilation.
//!
//! Turns the merged domain rules, the resolver list and the discovered network
//! addresses into the two enforceable artifacts of a run:
//!
//! - a [`HostRuleSet`] installed in the host packet filter, restricting the
//!   firewall network to the proxy, DNS and (optionally) the API proxy's egress
//! - a [`ProxyAcl`] loaded by the filtering proxy, restricting HTTP(S) egress to
//!   the allowed domains
//!
//! Compilation is all-or-nothing. Structurally invalid input yields a
//! [`PolicyCompilationError`] and no rules at all.

mod host_rules;
mod proxy_acl;
mod squid;

pub use host_rules::{HostRule, HostRuleSet, Protocol, compile_host_rules, parse_resolvers};
pub use proxy_acl::{AclEntry, ProxyAcl, compile_proxy_acl};
pub use squid::{ACCESS_LOG_FORMAT, render_squid_config};

/// Invalid input to the policy compiler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyCompilationError {
    #[error("proxy port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("at least one DNS resolver is required")]
    EmptyResolvers,

    #[error("invalid DNS resolver `{0}`: expected an IPv4 address")]
    InvalidResolver(String),

    #[error("invalid {role} address `{address}`: expected an IPv4 address")]
    InvalidAddress { role: &'static str, address: String },

    #[error("invalid allowed domain `{0}`: expected a bare hostname")]
    InvalidDomain(String),
}
