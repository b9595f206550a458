pub mod args;
pub mod check_domain;
pub mod diagnose;
pub mod logs;
pub mod run;
pub mod seccomp;

use std::path::Path;

use anstyle::{AnsiColor, Color, Style};
use anyhow::{Context, Result};

use awf_config::{DomainRule, RuleSet, RunConfigFile, merge_rules};

use args::RuleArgs;

fn styled(color: AnsiColor, text: &str) -> String {
    let style = Style::new().fg_color(Some(Color::Ansi(color))).bold();
    format!("{}{text}{}", style.render(), style.render_reset())
}

pub(crate) fn success_indicator(text: &str) -> String {
    styled(AnsiColor::Green, &format!("✓ {text}"))
}

pub(crate) fn warning_indicator(text: &str) -> String {
    styled(AnsiColor::Yellow, &format!("⚠ {text}"))
}

pub(crate) fn error_indicator(text: &str) -> String {
    styled(AnsiColor::Red, &format!("✗ {text}"))
}

pub(crate) fn load_run_config(path: Option<&Path>) -> Result<RunConfigFile> {
    match path {
        Some(path) => RunConfigFile::load(path),
        None => Ok(RunConfigFile::default()),
    }
}

/// Rule files (config, then `--rules`) followed by allow-domain entries (config, then flags).
pub(crate) fn collect_domain_rules(
    file: &RunConfigFile,
    args: &RuleArgs,
) -> Result<Vec<DomainRule>> {
    let mut rule_sets = file.load_rule_sets()?;
    for path in &args.rule_files {
        let rule_set = RuleSet::load_file(path)
            .with_context(|| format!("failed to load rules from {}", path.display()))?;
        rule_sets.push(rule_set);
    }

    let mut rules = merge_rules(&rule_sets);
    rules.extend(
        file.allow_domains
            .iter()
            .chain(&args.allow_domains)
            .map(|domain| domain.trim())
            .filter(|domain| !domain.is_empty())
            .map(DomainRule::with_subdomains),
    );
    Ok(rules)
}
