use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use awf_config::constants::defaults::PROXY_PORT;
use awf_config::constants::files::{PROXY_ACCESS_LOG, PROXY_CONTAINER_LOG_DIR};
use awf_config::constants::network::{
    AGENT_CONTAINER, API_PROXY_CONTAINER, HOST_FILTER_CHAIN, NETWORK_NAME, PROXY_ADDRESS,
    PROXY_CONTAINER, SUBNET,
};

use super::docker::DockerHost;
use super::executor::{CommandCategory, CommandExecutor, CommandInvocation};
use crate::diagnostics::{
    CONTAINER_STATE_FORMAT, ContainerInspection, ContainerState, ContainerStatus,
    DiagnosticCheck, DiagnosticReport, InspectionReport, NetworkInspection, ProxyConfigSummary,
    parse_nameservers,
};
use crate::proxy_log::{AccessLogEntry, parse_access_log};

const SANDBOX_CONTAINERS: [&str; 3] = [PROXY_CONTAINER, AGENT_CONTAINER, API_PROXY_CONTAINER];

/// Subnet and gateway pairs of one IPAM config, separated by spaces.
const NETWORK_FORMAT: &str = "{{range .IPAM.Config}}{{.Subnet}}|{{.Gateway}} {{end}}";

fn containers_check(proxy: &ContainerState, agent: &ContainerState) -> DiagnosticCheck {
    let message = format!("{}, {}", proxy.describe(), agent.describe());
    let missing = [proxy, agent]
        .iter()
        .any(|state| state.status == ContainerStatus::Missing);
    if missing {
        DiagnosticCheck::fail(
            "Containers",
            message,
            "Start a run with `awf run`; containers are removed when a run ends",
        )
    } else {
        DiagnosticCheck::pass("Containers", message)
    }
}

fn health_check(proxy: &ContainerState) -> DiagnosticCheck {
    match proxy.health.as_deref() {
        None => DiagnosticCheck::pass("Health", "No healthcheck reported for the proxy"),
        Some("healthy") => DiagnosticCheck::pass("Health", "Proxy healthy"),
        Some(status @ "starting") => DiagnosticCheck::fail(
            "Health",
            format!("Proxy {status}"),
            "Wait for the healthcheck to complete",
        ),
        Some(status) => DiagnosticCheck::fail(
            "Health",
            format!("Proxy {status}"),
            format!("Check the proxy logs: docker logs {PROXY_CONTAINER}"),
        ),
    }
}

fn config_check(work_dir: Option<&Path>) -> DiagnosticCheck {
    let Some(work_dir) = work_dir else {
        return DiagnosticCheck::fail(
            "Config",
            "No work directory with a proxy configuration found",
            "Pass --work-dir pointing at the run's work directory",
        );
    };
    let summary = match ProxyConfigSummary::load(work_dir) {
        Ok(summary) => summary,
        Err(err) => {
            return DiagnosticCheck::fail(
                "Config",
                format!("{err:#}"),
                "The proxy configuration is written to <work-dir>/squid.conf at startup",
            );
        }
    };
    if summary.allowed_domains.is_empty() {
        return DiagnosticCheck::fail(
            "Config",
            "No domains in the allow-list; all egress is denied",
            "Add domains with --allow-domains or --rules",
        );
    }
    let count = summary.allowed_domains.len();
    let mut sample = summary.allowed_domains[..count.min(3)].join(", ");
    if count > 3 {
        sample.push_str(&format!(", ... ({count} total)"));
    }
    DiagnosticCheck::pass("Config", format!("{count} domains in allow-list ({sample})"))
}

impl<E: CommandExecutor> DockerHost<E> {
    /// State of one container; a failed inspect means it does not exist.
    pub async fn container_state(&self, name: &str) -> Result<ContainerState> {
        let output = self
            .probe(Self::docker([
                "inspect",
                name,
                "--format",
                CONTAINER_STATE_FORMAT,
            ]))
            .await
            .context("failed to query the container runtime")?;
        if !output.is_success() {
            return Ok(ContainerState::missing(name));
        }
        Ok(ContainerState::parse(name, &output.stdout))
    }

    async fn network(&self) -> Result<NetworkInspection> {
        let output = self
            .probe(Self::docker([
                "network",
                "inspect",
                NETWORK_NAME,
                "--format",
                NETWORK_FORMAT,
            ]))
            .await?;
        let mut network = NetworkInspection {
            name: NETWORK_NAME.to_string(),
            exists: output.is_success(),
            subnet: None,
            gateway: None,
        };
        if network.exists {
            let configs: Vec<(&str, &str)> = output
                .stdout
                .split_whitespace()
                .filter_map(|config| config.split_once('|'))
                .collect();
            // Prefer the sandbox subnet when several are configured.
            let chosen = configs
                .iter()
                .find(|(subnet, _)| *subnet == SUBNET)
                .or_else(|| configs.first());
            if let Some((subnet, gateway)) = chosen {
                network.subnet = Some((*subnet).to_string()).filter(|s| !s.is_empty());
                network.gateway = Some((*gateway).to_string()).filter(|g| !g.is_empty());
            }
        }
        Ok(network)
    }

    async fn network_check(&self) -> Result<DiagnosticCheck> {
        let network = self.network().await?;
        let check = match network.subnet.as_deref() {
            _ if !network.exists => DiagnosticCheck::fail(
                "Network",
                format!("{NETWORK_NAME} does not exist"),
                "The network is created by `awf run`",
            ),
            Some(SUBNET) => {
                DiagnosticCheck::pass("Network", format!("{NETWORK_NAME} ({SUBNET})"))
            }
            other => DiagnosticCheck::fail(
                "Network",
                format!(
                    "{NETWORK_NAME} has subnet {}, expected {SUBNET}",
                    other.unwrap_or("unknown")
                ),
                format!("Remove the stale network: docker network rm {NETWORK_NAME}"),
            ),
        };
        Ok(check)
    }

    async fn connectivity_check(
        &self,
        proxy: &ContainerState,
        agent: &ContainerState,
    ) -> Result<DiagnosticCheck> {
        if !proxy.is_running() || !agent.is_running() {
            return Ok(DiagnosticCheck::pass(
                "Connectivity",
                "Skipped (containers not running)",
            ));
        }
        let port = PROXY_PORT.to_string();
        let reached = self
            .probe(Self::docker([
                "exec",
                AGENT_CONTAINER,
                "nc",
                "-z",
                "-w",
                "2",
                PROXY_ADDRESS,
                port.as_str(),
            ]))
            .await?;
        let target = format!("{PROXY_ADDRESS}:{PROXY_PORT}");
        Ok(if reached.is_success() {
            DiagnosticCheck::pass("Connectivity", format!("Proxy reachable on {target}"))
        } else {
            DiagnosticCheck::fail(
                "Connectivity",
                format!("Proxy NOT reachable on {target}"),
                format!("Check the proxy is listening: docker logs {PROXY_CONTAINER}"),
            )
        })
    }

    async fn dns_check(&self, agent: &ContainerState) -> Result<DiagnosticCheck> {
        if !agent.is_running() {
            return Ok(DiagnosticCheck::pass("DNS", "Skipped (agent not running)"));
        }
        let output = self
            .probe(Self::docker(["exec", AGENT_CONTAINER, "cat", "/etc/resolv.conf"]))
            .await?;
        let servers = if output.is_success() {
            parse_nameservers(&output.stdout)
        } else {
            Vec::new()
        };
        Ok(if servers.is_empty() {
            DiagnosticCheck::fail(
                "DNS",
                "Could not read the agent's DNS configuration",
                format!("Inspect it with: docker exec {AGENT_CONTAINER} cat /etc/resolv.conf"),
            )
        } else {
            DiagnosticCheck::pass("DNS", format!("DNS servers: {}", servers.join(", ")))
        })
    }

    async fn firewall_check(&self) -> DiagnosticCheck {
        let listing = CommandInvocation::new(
            CommandCategory::Firewall,
            "iptables",
            ["-S", HOST_FILTER_CHAIN],
        );
        match self.probe(listing).await {
            Ok(output) if output.is_success() => {
                // `-S CHAIN` prints the `-N` line followed by one line per rule.
                let rules = output.stdout.lines().filter(|l| l.starts_with("-A")).count();
                let message = format!("{HOST_FILTER_CHAIN} has {rules} rules");
                DiagnosticCheck::pass("Firewall", message)
            }
            Ok(_) => DiagnosticCheck::fail(
                "Firewall",
                format!("{HOST_FILTER_CHAIN} chain is not installed"),
                "Host filtering is installed by `awf run`; inspecting it requires root",
            ),
            Err(err) => DiagnosticCheck::fail(
                "Firewall",
                format!("could not list host rules: {err:#}"),
                "Install iptables or run diagnostics on the sandbox host",
            ),
        }
    }

    async fn orphan_check(&self) -> Result<DiagnosticCheck> {
        let output = self
            .probe(Self::docker([
                "ps",
                "-a",
                "--filter",
                "name=awf-",
                "--format",
                "{{.Names}}",
            ]))
            .await?;
        let unexpected: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !SANDBOX_CONTAINERS.contains(name))
            .collect();
        Ok(if unexpected.is_empty() {
            DiagnosticCheck::pass("Orphaned", "No stray awf containers")
        } else {
            DiagnosticCheck::fail(
                "Orphaned",
                format!("Unexpected containers: {}", unexpected.join(", ")),
                format!("Remove them with: docker rm -f {}", unexpected.join(" ")),
            )
        })
    }

    /// Run every check against the current host state.
    ///
    /// `work_dir` locates the rendered proxy configuration; without it the
    /// config check fails rather than guessing.
    pub async fn diagnose(&self, work_dir: Option<&Path>) -> Result<DiagnosticReport> {
        let proxy = self.container_state(PROXY_CONTAINER).await?;
        let agent = self.container_state(AGENT_CONTAINER).await?;

        let checks = vec![
            containers_check(&proxy, &agent),
            health_check(&proxy),
            self.network_check().await?,
            self.connectivity_check(&proxy, &agent).await?,
            self.dns_check(&agent).await?,
            config_check(work_dir),
            self.firewall_check().await,
            self.orphan_check().await?,
        ];
        let report = DiagnosticReport { checks };
        info!(
            checks = report.checks.len(),
            issues = report.issues(),
            "diagnostics finished"
        );
        Ok(report)
    }

    /// Per-container state with recent logs, plus the network layout.
    pub async fn inspect(&self, tail: usize) -> Result<InspectionReport> {
        let tail = tail.to_string();
        let mut containers = Vec::with_capacity(SANDBOX_CONTAINERS.len());
        for name in SANDBOX_CONTAINERS {
            let state = self.container_state(name).await?;
            let mut logs = Vec::new();
            if state.status != ContainerStatus::Missing {
                let output = self
                    .probe(Self::docker(["logs", "--tail", tail.as_str(), name]))
                    .await?;
                logs.extend(output.stdout.lines().map(String::from));
                logs.extend(output.stderr.lines().map(String::from));
            }
            containers.push(ContainerInspection { state, logs });
        }
        Ok(InspectionReport {
            containers,
            network: self.network().await?,
        })
    }

    /// Access log of the running proxy; `None` when it is not running.
    pub async fn read_live_access_log(&self) -> Result<Option<Vec<AccessLogEntry>>> {
        let path = format!("{PROXY_CONTAINER_LOG_DIR}/{PROXY_ACCESS_LOG}");
        let output = self
            .probe(Self::docker(["exec", PROXY_CONTAINER, "cat", path.as_str()]))
            .await
            .context("failed to query the container runtime")?;
        if !output.is_success() {
            debug!(stderr = %output.stderr.trim(), "live proxy log unavailable");
            return Ok(None);
        }
        Ok(Some(parse_access_log(&output.stdout)))
    }
}
