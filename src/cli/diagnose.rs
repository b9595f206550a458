use std::fmt::Write as _;

use anyhow::{Context, Result};

use awf_core::DockerHost;
use awf_core::diagnostics::{DiagnosticReport, InspectionReport, find_latest_work_dir};

use super::args::{DiagnoseArgs, OutputFormat};
use super::{error_indicator, success_indicator, warning_indicator};

/// Exit status when at least one check failed.
const ISSUES_EXIT_CODE: i32 = 1;

pub async fn handle_diagnose_command(args: DiagnoseArgs) -> Result<i32> {
    let host = DockerHost::from_process_env();

    if args.inspect {
        let report = host.inspect(args.tail).await?;
        match args.format {
            OutputFormat::Table => print!("{}", render_inspection(&report)),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to encode inspection")?
            ),
        }
        return Ok(0);
    }

    let work_dir = args.work_dir.or_else(|| find_latest_work_dir(&std::env::temp_dir()));
    match &work_dir {
        Some(dir) => tracing::debug!(work_dir = %dir.display(), "checking sandbox"),
        None => tracing::debug!("no awf work directory found"),
    }

    let report = host.diagnose(work_dir.as_deref()).await?;
    match args.format {
        OutputFormat::Table => print!("{}", render_report(&report)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode diagnostics")?
        ),
    }

    if report.is_healthy() {
        Ok(0)
    } else {
        Ok(ISSUES_EXIT_CODE)
    }
}

fn render_report(report: &DiagnosticReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        let line = format!("{}: {}", check.name, check.message);
        if check.passed {
            let _ = writeln!(out, "{}", success_indicator(&line));
        } else {
            let _ = writeln!(out, "{}", error_indicator(&line));
        }
        if let Some(fix) = &check.fix {
            let _ = writeln!(out, "    Fix: {fix}");
        }
    }

    let _ = writeln!(out);
    match report.issues() {
        0 => {
            let _ = writeln!(out, "{}", success_indicator("No issues found"));
        }
        1 => {
            let _ = writeln!(out, "{}", warning_indicator("1 issue found"));
        }
        n => {
            let _ = writeln!(out, "{}", warning_indicator(&format!("{n} issues found")));
        }
    }
    out
}

fn render_inspection(report: &InspectionReport) -> String {
    let mut out = String::new();
    for container in &report.containers {
        let state = &container.state;
        let _ = writeln!(out, "{}", state.describe());
        if let Some(health) = &state.health {
            let _ = writeln!(out, "  health: {health}");
        }
        if let Some(ip) = &state.ip_address {
            let _ = writeln!(out, "  ip: {ip}");
        }
        if !container.logs.is_empty() {
            let _ = writeln!(out, "  recent logs:");
            for line in &container.logs {
                let _ = writeln!(out, "    {line}");
            }
        }
    }

    let network = &report.network;
    if network.exists {
        let _ = writeln!(
            out,
            "network {}: subnet {} gateway {}",
            network.name,
            network.subnet.as_deref().unwrap_or("-"),
            network.gateway.as_deref().unwrap_or("-")
        );
    } else {
        let _ = writeln!(out, "network {}: missing", network.name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use awf_core::diagnostics::{
        ContainerInspection, ContainerState, DiagnosticCheck, NetworkInspection,
    };

    #[test]
    fn report_lists_fixes_and_counts_issues() {
        let report = DiagnosticReport {
            checks: vec![
                DiagnosticCheck::pass("Containers", "awf-squid (running)"),
                DiagnosticCheck::fail("DNS", "no nameservers", "restart the run"),
                DiagnosticCheck::fail("Firewall", "chain missing", "re-run awf with sudo"),
            ],
        };
        let rendered = render_report(&report);
        assert!(rendered.contains("Containers: awf-squid (running)"));
        assert!(rendered.contains("    Fix: restart the run\n"));
        assert!(rendered.contains("2 issues found"));
    }

    #[test]
    fn healthy_report_says_so() {
        let report = DiagnosticReport {
            checks: vec![DiagnosticCheck::pass("Network", "172.30.0.0/24")],
        };
        let rendered = render_report(&report);
        assert!(rendered.contains("No issues found"));
        assert!(!rendered.contains("Fix:"));
    }

    #[test]
    fn inspection_shows_logs_and_missing_network() {
        let report = InspectionReport {
            containers: vec![
                ContainerInspection {
                    state: ContainerState::parse("awf-agent", "exited|1||"),
                    logs: vec!["npm ERR! network".to_string()],
                },
                ContainerInspection {
                    state: ContainerState::missing("awf-squid"),
                    logs: Vec::new(),
                },
            ],
            network: NetworkInspection {
                name: "awf-net".to_string(),
                exists: false,
                subnet: None,
                gateway: None,
            },
        };
        let rendered = render_inspection(&report);
        assert!(rendered.contains("awf-agent (exited:1)\n  recent logs:\n    npm ERR! network"));
        assert!(rendered.contains("awf-squid (missing)"));
        assert!(rendered.contains("network awf-net: missing"));
    }
}
