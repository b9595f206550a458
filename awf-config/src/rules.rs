//! Domain allow-list rules.
//!
//! A rule source is YAML of the shape
//!
//! ```yaml
//! version: 1
//! rules:
//!   - domain: github.com
//!     subdomains: true
//!   - domain: registry.npmjs.org
//! ```
//!
//! Parsing is deliberately strict. The document is first read into an untyped
//! value and every rule object is checked for unknown keys, so a typo such as
//! `subdomain: true` is rejected instead of silently producing a narrower rule.
//! Values from the file are only ever treated as hostnames; nothing in a rule
//! is interpreted as a path or executed.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::constants::ruleset::{
    MAX_DOMAIN_LEN, MAX_RULE_FILE_BYTES, RULE_FIELDS, RULESET_VERSION,
};
use crate::error::SchemaError;

/// A single allow rule for one host.
///
/// With `subdomains` set the rule also admits every host below `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainRule {
    pub domain: String,
    #[serde(default)]
    pub subdomains: bool,
}

impl DomainRule {
    /// Rule admitting exactly `domain`.
    pub fn exact(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            subdomains: false,
        }
    }

    /// Rule admitting `domain` and every subdomain of it.
    pub fn with_subdomains(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            subdomains: true,
        }
    }
}

/// A validated rule source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    version: u64,
    rules: Vec<DomainRule>,
}

impl RuleSet {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[DomainRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Parse and validate a rule source.
    pub fn load(source: &str) -> Result<Self, SchemaError> {
        if source.len() > MAX_RULE_FILE_BYTES {
            return Err(SchemaError::TooLarge {
                size: source.len(),
                limit: MAX_RULE_FILE_BYTES,
            });
        }

        let document: Value = serde_yaml::from_str(source)
            .map_err(|err| SchemaError::Malformed(format!("invalid YAML: {err}")))?;
        let Value::Mapping(root) = document else {
            return Err(SchemaError::Malformed(
                "ruleset must be a mapping with `version` and `rules`".to_string(),
            ));
        };

        let version = parse_version(&root)?;

        let rules = match root.get("rules") {
            Some(Value::Sequence(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| parse_rule(index, item))
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(SchemaError::Malformed(
                    "ruleset must include a `rules` list".to_string(),
                ));
            }
        };

        Ok(Self { version, rules })
    }

    /// Read and validate a rule file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // Refuse oversized files before reading them into memory.
        if metadata.len() > MAX_RULE_FILE_BYTES as u64 {
            return Err(SchemaError::TooLarge {
                size: usize::try_from(metadata.len()).unwrap_or(usize::MAX),
                limit: MAX_RULE_FILE_BYTES,
            }
            .in_file(path));
        }

        let source = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let rule_set = Self::load(&source).map_err(|err| err.in_file(path))?;
        tracing::debug!(
            path = %path.display(),
            rules = rule_set.len(),
            "loaded domain ruleset"
        );
        Ok(rule_set)
    }
}

fn parse_version(root: &Mapping) -> Result<u64, SchemaError> {
    match root.get("version") {
        Some(Value::Number(number)) if number.as_u64() == Some(RULESET_VERSION) => {
            Ok(RULESET_VERSION)
        }
        other => Err(SchemaError::InvalidVersion {
            expected: RULESET_VERSION,
            found: describe(other),
        }),
    }
}

fn parse_rule(index: usize, item: &Value) -> Result<DomainRule, SchemaError> {
    let Value::Mapping(fields) = item else {
        return Err(SchemaError::Malformed(format!(
            "rule {index} must be a mapping"
        )));
    };

    let unsupported: Vec<String> = fields
        .keys()
        .filter(|key| !key.as_str().is_some_and(|name| RULE_FIELDS.contains(&name)))
        .map(|key| match key.as_str() {
            Some(name) => name.to_string(),
            None => describe(Some(key)),
        })
        .collect();
    if !unsupported.is_empty() {
        return Err(SchemaError::UnsupportedFields {
            index,
            fields: unsupported,
        });
    }

    let domain = match fields.get("domain") {
        Some(Value::String(domain)) if !domain.trim().is_empty() => domain.clone(),
        _ => return Err(SchemaError::MissingDomain { index }),
    };
    if !is_bare_hostname(&domain) {
        return Err(SchemaError::InvalidDomain { index, domain });
    }

    let subdomains = match fields.get("subdomains") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(other) => {
            return Err(SchemaError::Malformed(format!(
                "rule {index} field `subdomains` must be a boolean, found {}",
                describe(Some(other))
            )));
        }
    };

    Ok(DomainRule { domain, subdomains })
}

/// Bare host: dot-separated labels of ASCII alphanumerics, `-` and `_`.
///
/// Wildcards, schemes, ports, paths and leading dots are all rejected.
pub fn is_bare_hostname(domain: &str) -> bool {
    if domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "none".to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => format!("{text:?}"),
        Some(_) => "a non-scalar value".to_string(),
    }
}

/// Concatenate the rules of every rule set, in input order.
///
/// Duplicates are kept; the subdomain flag of each rule is preserved.
pub fn merge_rules<'a>(rule_sets: impl IntoIterator<Item = &'a RuleSet>) -> Vec<DomainRule> {
    rule_sets
        .into_iter()
        .flat_map(|set| set.rules.iter().cloned())
        .collect()
}

/// Flatten rule sets into their domain names.
///
/// Order is first-seen across the inputs in the order supplied. No
/// deduplication and no sorting; the proxy ACL relies on this order.
pub fn merge<'a>(rule_sets: impl IntoIterator<Item = &'a RuleSet>) -> Vec<String> {
    rule_sets
        .into_iter()
        .flat_map(|set| set.rules.iter().map(|rule| rule.domain.clone()))
        .collect()
}
