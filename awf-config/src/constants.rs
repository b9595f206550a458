/// Run-level defaults applied when the caller leaves a value unset
pub mod defaults {
    /// Resolvers the sandbox may query when no DNS servers are configured.
    pub const DEFAULT_DNS_SERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];
    /// Port the filtering proxy listens on inside the firewall network.
    pub const PROXY_PORT: u16 = 3128;
    pub const DEFAULT_LOG_LEVEL: &str = "info";
    pub const DEFAULT_TRACE_TARGETS: &str = "awf,awf_core,awf_config";
}

/// Rule file schema constants
pub mod ruleset {
    /// The only rule schema version this build understands.
    pub const RULESET_VERSION: u64 = 1;
    /// Keys permitted on a single rule object.
    pub const RULE_FIELDS: &[&str] = &["domain", "subdomains"];
    /// Rule sources larger than this are rejected before parsing.
    pub const MAX_RULE_FILE_BYTES: usize = 1024 * 1024;
    /// RFC 1035 upper bound for a textual hostname.
    pub const MAX_DOMAIN_LEN: usize = 253;
}

/// Firewall network topology provisioned by the host
pub mod network {
    pub const NETWORK_NAME: &str = "awf-net";
    pub const SUBNET: &str = "172.30.0.0/24";
    pub const PROXY_ADDRESS: &str = "172.30.0.10";
    pub const AGENT_ADDRESS: &str = "172.30.0.20";
    pub const API_PROXY_ADDRESS: &str = "172.30.0.30";

    pub const PROXY_CONTAINER: &str = "awf-squid";
    pub const AGENT_CONTAINER: &str = "awf-agent";
    pub const API_PROXY_CONTAINER: &str = "awf-api-proxy";

    /// Dedicated iptables chain holding the sandbox's host rules.
    pub const HOST_FILTER_CHAIN: &str = "FW_WRAPPER";
    /// Built and jumped to before replacing a chain left by an earlier run.
    pub const HOST_FILTER_STAGING_CHAIN: &str = "FW_WRAPPER_NEW";
    /// Docker's hook chain for user-defined forwarding rules.
    pub const DOCKER_USER_CHAIN: &str = "DOCKER-USER";
    pub const BRIDGE_INTERFACE: &str = "awf-br0";

    pub const DNS_PORT: u16 = 53;
    pub const HTTPS_PORT: u16 = 443;
    /// Port the API proxy accepts agent requests on.
    pub const API_PROXY_PORT: u16 = 10000;
}

/// Names and permissions of the artifacts written into the work directory
pub mod files {
    pub const COMPOSE_FILE: &str = "docker-compose.yml";
    pub const SQUID_CONFIG_FILE: &str = "squid.conf";
    pub const SECCOMP_PROFILE_FILE: &str = "seccomp-profile.json";
    pub const PROXY_ACCESS_LOG: &str = "access.log";
    pub const PROXY_LOG_SUBDIR: &str = "squid-logs";
    /// Where the proxy container writes its logs; the host log dir is mounted here.
    pub const PROXY_CONTAINER_LOG_DIR: &str = "/var/log/squid";
    /// Owner-only read/write; the sandboxed user must not read the compose file.
    pub const COMPOSE_FILE_MODE: u32 = 0o600;
    pub const CONFIG_FILE_MODE: u32 = 0o644;
    pub const WORK_DIR_MODE: u32 = 0o700;
    /// The proxy container's entrypoint takes ownership of the mounted log dir.
    pub const LOGS_DIR_MODE: u32 = 0o755;
    pub const WORK_DIR_PREFIX: &str = "awf-";
}

/// Container images used for the sandbox services
pub mod images {
    pub const PROXY_IMAGE: &str = "ghcr.io/github/gh-aw-firewall/squid:latest";
    pub const AGENT_IMAGE: &str = "ghcr.io/github/gh-aw-firewall/agent:latest";
    pub const API_PROXY_IMAGE: &str = "ghcr.io/github/gh-aw-firewall/api-proxy:latest";
}

/// Environment variable names read by the CLI.
pub mod env {
    pub const CONFIG_PATH: &str = "AWF_CONFIG_PATH";
    pub const LOG_FILTER: &str = "RUST_LOG";
}
