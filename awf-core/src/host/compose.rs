//! Container-orchestration file generation and secret redaction.
//!
//! The compose file is the one artifact that carries credential values: the
//! runtime reads it at start to populate container environments. It is created
//! owner-only and its secret values are replaced in place once the containers
//! are up.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use awf_config::WorkflowConfig;
use awf_config::constants::defaults::PROXY_PORT;
use awf_config::constants::files::{
    COMPOSE_FILE_MODE, PROXY_CONTAINER_LOG_DIR, SECCOMP_PROFILE_FILE, SQUID_CONFIG_FILE,
};
use awf_config::constants::images::{AGENT_IMAGE, API_PROXY_IMAGE, PROXY_IMAGE};
use awf_config::constants::network::{
    AGENT_CONTAINER, API_PROXY_CONTAINER, API_PROXY_PORT, NETWORK_NAME, PROXY_CONTAINER,
};

use super::NetworkTopology;
use super::files::{replace_file, write_new_file};

pub const REDACTED_VALUE: &str = "***REDACTED***";

/// Credential variables forwarded to the agent when set, and always treated
/// as secret. Anything else must be requested by name.
pub const SENSITIVE_ENV_NAMES: &[&str] = &[
    "COPILOT_GITHUB_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITHUB_API_TOKEN",
    "GITHUB_PAT",
    "GH_ACCESS_TOKEN",
    "OPENAI_API_KEY",
    "OPENAI_KEY",
    "ANTHROPIC_API_KEY",
    "CLAUDE_API_KEY",
    "CODEX_API_KEY",
];

pub const SENSITIVE_ENV_SUFFIXES: &[&str] = &["_TOKEN", "_API_KEY", "_SECRET"];

/// Model provider keys held by the API proxy instead of the agent when API
/// proxying is on.
pub const API_PROXY_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "OPENAI_KEY",
    "ANTHROPIC_API_KEY",
    "CLAUDE_API_KEY",
    "CODEX_API_KEY",
];

const PROXY_SERVICE: &str = "squid-proxy";
const AGENT_SERVICE: &str = "agent";
const API_PROXY_SERVICE: &str = "api-proxy";

pub fn is_sensitive_env(name: &str) -> bool {
    SENSITIVE_ENV_NAMES.contains(&name)
        || SENSITIVE_ENV_SUFFIXES
            .iter()
            .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ComposeService>,
    #[serde(default)]
    pub networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, ServiceNetwork>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNetwork {
    pub ipv4_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeNetwork {
    pub external: bool,
    pub name: String,
}

fn attach(address: &str) -> BTreeMap<String, ServiceNetwork> {
    BTreeMap::from([(
        NETWORK_NAME.to_string(),
        ServiceNetwork {
            ipv4_address: address.to_string(),
        },
    )])
}

/// Build the compose definition for one run.
///
/// `environment` is the caller's environment snapshot. The agent receives the
/// well-known credentials in [`SENSITIVE_ENV_NAMES`] plus the names listed in
/// `config.forward_env`; a variable merely ending in `_TOKEN` is not enough.
/// The API proxy service is included when `config.enable_api_proxy` is set
/// and the topology carries its address.
pub fn build_compose_file(
    config: &WorkflowConfig,
    topology: &NetworkTopology,
    environment: &BTreeMap<String, String>,
    logs_dir: &Path,
) -> ComposeFile {
    let work_dir = config.work_dir.display();
    let proxy_url = format!("http://{}:{PROXY_PORT}", topology.proxy_address);
    let api_proxy = topology
        .api_proxy_address
        .as_deref()
        .filter(|_| config.enable_api_proxy);

    let mut services = BTreeMap::new();
    services.insert(
        PROXY_SERVICE.to_string(),
        ComposeService {
            image: PROXY_IMAGE.to_string(),
            container_name: PROXY_CONTAINER.to_string(),
            networks: attach(&topology.proxy_address),
            volumes: vec![
                format!("{work_dir}/{SQUID_CONFIG_FILE}:/etc/squid/squid.conf:ro"),
                format!("{}:{PROXY_CONTAINER_LOG_DIR}", logs_dir.display()),
            ],
            ..ComposeService::default()
        },
    );

    let mut agent_env = BTreeMap::from([
        ("HTTP_PROXY".to_string(), proxy_url.clone()),
        ("HTTPS_PROXY".to_string(), proxy_url.clone()),
        ("http_proxy".to_string(), proxy_url.clone()),
        ("https_proxy".to_string(), proxy_url),
        (
            "AWF_ALLOWED_DOMAINS".to_string(),
            config.allowed_domains().join(","),
        ),
    ]);
    let mut no_proxy = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let mut depends_on = vec![PROXY_SERVICE.to_string()];

    if let Some(address) = api_proxy {
        let api_env = environment
            .iter()
            .filter(|(name, _)| API_PROXY_KEYS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        services.insert(
            API_PROXY_SERVICE.to_string(),
            ComposeService {
                image: API_PROXY_IMAGE.to_string(),
                container_name: API_PROXY_CONTAINER.to_string(),
                networks: attach(address),
                environment: api_env,
                ..ComposeService::default()
            },
        );
        agent_env.insert(
            "AWF_API_PROXY_URL".to_string(),
            format!("http://{address}:{API_PROXY_PORT}"),
        );
        no_proxy.push(address.to_string());
        depends_on.push(API_PROXY_SERVICE.to_string());
    }
    agent_env.insert("NO_PROXY".to_string(), no_proxy.join(","));

    for (name, value) in environment {
        let requested = SENSITIVE_ENV_NAMES.contains(&name.as_str())
            || config.forward_env.iter().any(|wanted| wanted == name);
        if !requested || agent_env.contains_key(name) {
            continue;
        }
        if api_proxy.is_some() && API_PROXY_KEYS.contains(&name.as_str()) {
            continue;
        }
        agent_env.insert(name.clone(), value.clone());
    }

    services.insert(
        AGENT_SERVICE.to_string(),
        ComposeService {
            image: AGENT_IMAGE.to_string(),
            container_name: AGENT_CONTAINER.to_string(),
            networks: attach(&topology.agent_address),
            environment: agent_env,
            depends_on,
            dns: config.dns_servers(),
            security_opt: vec![
                format!("seccomp={work_dir}/{SECCOMP_PROFILE_FILE}"),
                "no-new-privileges:true".to_string(),
            ],
            cap_drop: ["NET_ADMIN", "NET_RAW", "SYS_ADMIN", "SYS_MODULE", "SYS_PTRACE"]
                .into_iter()
                .map(String::from)
                .collect(),
            command: Some(config.agent_command.clone()),
            ..ComposeService::default()
        },
    );

    ComposeFile {
        services,
        networks: BTreeMap::from([(
            NETWORK_NAME.to_string(),
            ComposeNetwork {
                external: true,
                name: NETWORK_NAME.to_string(),
            },
        )]),
    }
}

/// Write the compose file owner-only, refusing to follow a planted symlink.
pub fn write_compose_file(path: &Path, compose: &ComposeFile) -> Result<()> {
    let yaml = serde_yaml::to_string(compose).context("failed to serialize compose file")?;
    write_new_file(path, yaml.as_bytes(), COMPOSE_FILE_MODE)
}

/// Replace secret environment values in a parsed compose document.
///
/// Handles both the mapping and the `KEY=value` list forms of `environment`.
/// Returns the `service.KEY` names that were changed; values already redacted
/// are left alone, so a second pass returns nothing.
pub fn redact_compose_value(document: &mut Value) -> Vec<String> {
    let mut redacted = Vec::new();
    let Some(services) = document.get_mut("services").and_then(Value::as_mapping_mut) else {
        return redacted;
    };

    for (service_name, service) in services.iter_mut() {
        let service_name = service_name.as_str().unwrap_or("?").to_string();
        let Some(environment) = service.get_mut("environment") else {
            continue;
        };
        match environment {
            Value::Mapping(entries) => {
                for (key, value) in entries.iter_mut() {
                    let Some(name) = key.as_str() else { continue };
                    if !is_sensitive_env(name) || value.as_str() == Some(REDACTED_VALUE) {
                        continue;
                    }
                    *value = Value::String(REDACTED_VALUE.to_string());
                    redacted.push(format!("{service_name}.{name}"));
                }
            }
            Value::Sequence(entries) => {
                for entry in entries.iter_mut() {
                    let Some((name, value)) = entry.as_str().and_then(|s| s.split_once('=')) else {
                        continue;
                    };
                    if !is_sensitive_env(name) || value == REDACTED_VALUE {
                        continue;
                    }
                    let name = name.to_string();
                    *entry = Value::String(format!("{name}={REDACTED_VALUE}"));
                    redacted.push(format!("{service_name}.{name}"));
                }
            }
            _ => {}
        }
    }
    redacted
}

/// Redact the compose file at `path` in place.
///
/// A missing file is not an error: there is nothing left to leak.
pub fn redact_compose_file(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "compose file not found; nothing to redact");
        return Ok(Vec::new());
    }
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut document: Value = serde_yaml::from_str(&source)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let redacted = redact_compose_value(&mut document);
    if redacted.is_empty() {
        return Ok(redacted);
    }
    let yaml = serde_yaml::to_string(&document).context("failed to serialize compose file")?;
    replace_file(path, yaml.as_bytes())?;
    Ok(redacted)
}
