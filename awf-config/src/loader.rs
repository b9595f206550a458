use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::rules::RuleSet;

/// Optional TOML file carrying run settings (`awf.toml`).
///
/// ```toml
/// rule_files = ["rules/base.yml", "rules/node.yml"]
/// allow_domains = ["api.github.com"]
/// dns_servers = ["1.1.1.1"]
/// proxy_logs_dir = "/tmp/awf-logs"
/// enable_api_proxy = false
/// skip_pull = true
/// forward_env = ["NPM_TOKEN"]
/// ```
///
/// Command-line flags override every value here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfigFile {
    /// Rule files, resolved relative to the directory holding this file.
    pub rule_files: Vec<PathBuf>,
    pub allow_domains: Vec<String>,
    pub dns_servers: Option<Vec<String>>,
    pub proxy_logs_dir: Option<PathBuf>,
    pub enable_api_proxy: bool,
    pub skip_pull: bool,
    /// Host variables passed to the agent in addition to the built-in credentials.
    pub forward_env: Vec<String>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl RunConfigFile {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("failed to parse run configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_toml_str(&source)
            .with_context(|| format!("invalid run configuration in {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        tracing::debug!(path = %path.display(), "loaded run configuration");
        Ok(config)
    }

    /// Rule file paths with relative entries anchored at the config file.
    pub fn resolved_rule_files(&self) -> Vec<PathBuf> {
        self.rule_files
            .iter()
            .map(|file| match &self.base_dir {
                Some(base) if file.is_relative() => base.join(file),
                _ => file.clone(),
            })
            .collect()
    }

    /// Load every configured rule file in order.
    pub fn load_rule_sets(&self) -> Result<Vec<RuleSet>> {
        self.resolved_rule_files()
            .iter()
            .map(|path| RuleSet::load_file(path).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_all_fields() {
        let config = RunConfigFile::from_toml_str(
            r#"
rule_files = ["base.yml"]
allow_domains = ["api.github.com"]
dns_servers = ["1.1.1.1", "1.0.0.1"]
proxy_logs_dir = "/tmp/logs"
enable_api_proxy = true
skip_pull = true
forward_env = ["NPM_TOKEN"]
"#,
        )
        .unwrap();
        assert_eq!(config.allow_domains, vec!["api.github.com"]);
        assert_eq!(config.forward_env, vec!["NPM_TOKEN"]);
        assert_eq!(
            config.dns_servers,
            Some(vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()])
        );
        assert!(config.enable_api_proxy);
        assert!(config.skip_pull);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = RunConfigFile::from_toml_str("").unwrap();
        assert_eq!(config, RunConfigFile::default());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(RunConfigFile::from_toml_str("allow_domain = [\"x.com\"]").is_err());
    }

    #[test]
    fn test_rule_files_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.yml"),
            "version: 1\nrules:\n  - domain: github.com\n",
        )
        .unwrap();
        let config_path = dir.path().join("awf.toml");
        std::fs::write(&config_path, "rule_files = [\"base.yml\"]\n").unwrap();

        let config = RunConfigFile::load(&config_path).unwrap();
        assert_eq!(config.resolved_rule_files(), vec![dir.path().join("base.yml")]);

        let rule_sets = config.load_rule_sets().unwrap();
        assert_eq!(rule_sets.len(), 1);
    }
}
