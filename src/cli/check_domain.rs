use std::path::Path;

use anyhow::{Context, Result};

use awf_core::DockerHost;
use awf_core::diagnostics::{DomainAssessment, assess_domain};
use awf_core::firewall::{ProxyAcl, compile_proxy_acl};
use awf_core::proxy_log::{AccessLogEntry, read_access_log};

use super::args::{CheckDomainArgs, OutputFormat};
use super::logs::resolve_log_path;
use super::{
    collect_domain_rules, error_indicator, load_run_config, success_indicator, warning_indicator,
};

/// Exit status when the host would be blocked.
const BLOCKED_EXIT_CODE: i32 = 1;

pub async fn handle_check_domain_command(
    config_path: Option<&Path>,
    args: CheckDomainArgs,
) -> Result<i32> {
    let file = load_run_config(config_path)?;
    let rules = collect_domain_rules(&file, &args.rules)?;
    let acl = compile_proxy_acl(&rules).context("allow-list does not compile")?;
    let entries = load_log_entries(&args).await?;

    let assessment = assess_domain(&acl, &args.host, entries.as_deref().unwrap_or_default());
    match args.format {
        OutputFormat::Table => print_assessment(&assessment, &acl, entries.is_some()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&assessment).context("failed to encode assessment")?
        ),
    }

    if assessment.status.is_allowed() {
        Ok(0)
    } else {
        Ok(BLOCKED_EXIT_CODE)
    }
}

/// Entries from `--log` or `--live`; `None` when no log was consulted.
async fn load_log_entries(args: &CheckDomainArgs) -> Result<Option<Vec<AccessLogEntry>>> {
    if let Some(path) = &args.log {
        let path = resolve_log_path(path).await?;
        return read_access_log(&path).await.map(Some);
    }
    if !args.live {
        return Ok(None);
    }
    let entries = DockerHost::from_process_env().read_live_access_log().await?;
    if entries.is_none() {
        eprintln!(
            "{}",
            warning_indicator("Proxy container is not running; checking the allow-list only")
        );
    }
    Ok(entries)
}

fn print_assessment(assessment: &DomainAssessment, acl: &ProxyAcl, log_consulted: bool) {
    let host = &assessment.host;
    match &assessment.matched_pattern {
        Some(pattern) => println!(
            "{}",
            success_indicator(&format!("{host} is allowed by {pattern}"))
        ),
        None => {
            let detail = if acl.is_empty() {
                "allow-list is empty".to_string()
            } else {
                format!("no match among {} rules", acl.len())
            };
            println!("{}", error_indicator(&format!("{host} is blocked ({detail})")));
        }
    }

    if log_consulted {
        match &assessment.last_request {
            Some(request) => println!(
                "  Last request: {} {} at {}",
                request.status,
                request.decision,
                request.timestamp.to_rfc3339()
            ),
            None => println!("  No requests for {host} in the proxy log"),
        }
        let status = format!("Status: {}", assessment.status);
        if assessment.status.is_allowed() {
            println!("{}", success_indicator(&status));
        } else {
            println!("{}", error_indicator(&status));
        }
    }

    if let Some(suggestion) = &assessment.suggestion {
        println!("  To allow it: {suggestion}");
    }
}
