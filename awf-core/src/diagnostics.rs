//! Troubleshooting reports for a live or leftover sandbox.
//!
//! The types here are plain data; [`DockerHost`](crate::host::DockerHost)
//! fills them in by querying the container runtime.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use awf_config::constants::files::{SQUID_CONFIG_FILE, WORK_DIR_PREFIX};

use crate::firewall::ProxyAcl;
use crate::proxy_log::AccessLogEntry;

/// `docker inspect --format` template understood by [`ContainerState::parse`].
pub const CONTAINER_STATE_FORMAT: &str = "{{.State.Status}}|{{.State.ExitCode}}|\
{{if .State.Health}}{{.State.Health.Status}}{{end}}|\
{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    pub name: String,
    pub status: ContainerStatus,
    /// Only reported once the container has stopped.
    pub exit_code: Option<i32>,
    pub health: Option<String>,
    pub ip_address: Option<String>,
}

impl ContainerState {
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ContainerStatus::Missing,
            exit_code: None,
            health: None,
            ip_address: None,
        }
    }

    /// Parse one line rendered with [`CONTAINER_STATE_FORMAT`].
    pub fn parse(name: &str, output: &str) -> Self {
        let mut fields = output.trim().splitn(4, '|').map(str::trim);
        let status = match fields.next() {
            None | Some("") => return Self::missing(name),
            Some("running") => ContainerStatus::Running,
            Some(_) => ContainerStatus::Stopped,
        };
        let exit_code = fields
            .next()
            .and_then(|code| code.parse().ok())
            .filter(|_| status == ContainerStatus::Stopped);
        let mut text = || fields.next().filter(|v| !v.is_empty()).map(String::from);
        let health = text();
        let ip_address = text();

        Self {
            name: name.to_string(),
            status,
            exit_code,
            health,
            ip_address,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Short form used in reports, e.g. `awf-agent (exited:1)`.
    pub fn describe(&self) -> String {
        match (self.status, self.exit_code) {
            (ContainerStatus::Running, _) => format!("{} (running)", self.name),
            (ContainerStatus::Stopped, Some(code)) => format!("{} (exited:{code})", self.name),
            (ContainerStatus::Stopped, None) => format!("{} (stopped)", self.name),
            (ContainerStatus::Missing, _) => format!("{} (missing)", self.name),
        }
    }
}

/// Outcome of one diagnostic check, with a suggested remedy when it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub fix: Option<String>,
}

impl DiagnosticCheck {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            fix: None,
        }
    }

    pub fn fail(name: &str, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    pub checks: Vec<DiagnosticCheck>,
}

impl DiagnosticReport {
    pub fn issues(&self) -> usize {
        self.checks.iter().filter(|check| !check.passed).count()
    }

    pub fn is_healthy(&self) -> bool {
        self.issues() == 0
    }

    pub fn check(&self, name: &str) -> Option<&DiagnosticCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInspection {
    #[serde(flatten)]
    pub state: ContainerState,
    /// Most recent log lines, stdout and stderr interleaved by stream.
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInspection {
    pub name: String,
    pub exists: bool,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectionReport {
    pub containers: Vec<ContainerInspection>,
    pub network: NetworkInspection,
}

/// Settings read back from a rendered proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyConfigSummary {
    pub allowed_domains: Vec<String>,
    pub dns_servers: Vec<String>,
}

impl ProxyConfigSummary {
    pub fn parse(config: &str) -> Self {
        let mut summary = Self::default();
        for line in config.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("acl allowed_domains dstdomain ") {
                summary.allowed_domains.extend(
                    rest.split_whitespace()
                        .take_while(|word| !word.starts_with('#'))
                        // Quoted values name an external file, not a domain.
                        .filter(|word| !word.starts_with('"'))
                        .map(String::from),
                );
            } else if let Some(rest) = line.strip_prefix("dns_nameservers ") {
                summary
                    .dns_servers
                    .extend(rest.split_whitespace().map(String::from));
            }
        }
        summary
    }

    pub fn load(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(SQUID_CONFIG_FILE);
        let config = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::parse(&config))
    }
}

/// `nameserver` entries of a resolv.conf.
pub fn parse_nameservers(resolv_conf: &str) -> Vec<String> {
    resolv_conf
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Most recently modified `awf-*` directory under `root` holding a proxy
/// configuration. Symlinked entries are ignored.
pub fn find_latest_work_dir(root: &Path) -> Option<PathBuf> {
    fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(WORK_DIR_PREFIX))
        .filter_map(|entry| {
            let meta = fs::symlink_metadata(entry.path()).ok()?;
            if !meta.is_dir() || !entry.path().join(SQUID_CONFIG_FILE).is_file() {
                return None;
            }
            Some((meta.modified().ok()?, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Overall verdict for one host, combining the allow-list with proxy logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DomainStatus {
    /// Allow-listed and the proxy let the last request through.
    #[serde(rename = "ALLOWED")]
    Allowed,
    #[serde(rename = "BLOCKED")]
    Blocked,
    /// Not allow-listed, yet the proxy let a request through.
    #[serde(rename = "ALLOWED (unexpected)")]
    AllowedUnexpected,
    /// Allow-listed but never requested.
    #[serde(rename = "ALLOWED (in allowlist)")]
    Listed,
    /// Not allow-listed and never requested.
    #[serde(rename = "NOT TESTED")]
    NotTested,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::Blocked => "BLOCKED",
            Self::AllowedUnexpected => "ALLOWED (unexpected)",
            Self::Listed => "ALLOWED (in allowlist)",
            Self::NotTested => "NOT TESTED",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::AllowedUnexpected | Self::Listed)
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The proxy's last recorded decision for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedRequest {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub decision: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainAssessment {
    pub host: String,
    pub matched_pattern: Option<String>,
    pub last_request: Option<LoggedRequest>,
    pub status: DomainStatus,
    pub suggestion: Option<String>,
}

/// Judge `host` against the allow-list and, when available, the access log.
///
/// The latest log entry for the host decides between allowed and blocked;
/// without one the allow-list alone is reported.
pub fn assess_domain(acl: &ProxyAcl, host: &str, entries: &[AccessLogEntry]) -> DomainAssessment {
    let matched_pattern = acl.matching_entry(host).map(|entry| entry.pattern());
    let last_request = entries
        .iter()
        .filter(|entry| entry.domain().eq_ignore_ascii_case(host.trim()))
        .max_by_key(|entry| entry.timestamp)
        .map(|entry| LoggedRequest {
            timestamp: entry.timestamp,
            status: entry.status,
            decision: entry.decision.clone(),
            allowed: entry.is_allowed(),
        });

    let listed = matched_pattern.is_some();
    let status = match (listed, last_request.as_ref().map(|request| request.allowed)) {
        (true, Some(true)) => DomainStatus::Allowed,
        (true, None) => DomainStatus::Listed,
        (false, Some(true)) => DomainStatus::AllowedUnexpected,
        (false, None) => DomainStatus::NotTested,
        (_, Some(false)) => DomainStatus::Blocked,
    };
    let suggestion =
        (!listed).then(|| format!("awf run --allow-domains {} -- <command>", host.trim()));

    DomainAssessment {
        host: host.to_string(),
        matched_pattern,
        last_request,
        status,
        suggestion,
    }
}
