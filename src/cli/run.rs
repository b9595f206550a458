use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use awf_config::constants::files::WORK_DIR_PREFIX;
use awf_config::{RunConfigFile, WorkflowConfig};
use awf_core::{Capabilities, DockerHost, SandboxHost, SandboxOrchestrator, SeccompProfile};

use super::args::RunArgs;
use super::{collect_domain_rules, load_run_config, success_indicator, warning_indicator};

/// Exit status reported when the run is interrupted by Ctrl+C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

pub async fn handle_run_command(config_path: Option<&Path>, args: RunArgs) -> Result<i32> {
    let file = load_run_config(config_path)?;
    let config = build_workflow_config(&file, &args)?;
    let capabilities = if args.no_secret_redaction {
        Capabilities::WITH_API_PROXY
    } else {
        Capabilities::FULL
    };

    let seccomp = SeccompProfile::builtin().context("built-in seccomp profile is unreadable")?;
    let host: Arc<dyn SandboxHost> = Arc::new(DockerHost::from_process_env());
    let orchestrator =
        SandboxOrchestrator::new(Arc::clone(&host), seccomp).with_capabilities(capabilities);

    info!(
        work_dir = %config.work_dir.display(),
        domains = config.domain_rules.len(),
        "starting sandbox run"
    );

    let outcome = tokio::select! {
        outcome = orchestrator.run(&config) => outcome?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            warn!("interrupted; tearing down sandbox");
            host.perform_cleanup().await?;
            eprintln!("{}", warning_indicator("Interrupted, sandbox cleaned up"));
            return Ok(INTERRUPTED_EXIT_CODE);
        }
    };

    if outcome.is_success() {
        eprintln!("{}", success_indicator("Agent exited with code 0"));
    } else {
        eprintln!(
            "{}",
            warning_indicator(&format!("Agent exited with code {}", outcome.exit_code))
        );
    }
    if !outcome.cleanup_succeeded {
        eprintln!("{}", warning_indicator("Cleanup reported errors, see log output"));
    }
    Ok(outcome.exit_code)
}

/// A fresh, owner-only directory under the system temp dir.
///
/// The name is unpredictable and the directory is created exclusively, so
/// another local user cannot pre-create it or plant links inside it.
fn default_work_dir() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(WORK_DIR_PREFIX)
        .tempdir()
        .context("failed to create a work directory")?;
    // Proxy logs stay behind after the run; cleanup only removes containers.
    Ok(dir.keep())
}

/// Flags override config file values; domain sources accumulate.
fn build_workflow_config(file: &RunConfigFile, args: &RunArgs) -> Result<WorkflowConfig> {
    let work_dir = match &args.work_dir {
        Some(dir) => dir.clone(),
        None => default_work_dir()?,
    };
    let mut builder = WorkflowConfig::builder(work_dir)
        .enable_api_proxy(args.enable_api_proxy || file.enable_api_proxy)
        .skip_pull(args.skip_pull || file.skip_pull)
        .forward_env(file.forward_env.iter().chain(&args.forward_env).cloned())
        .agent_command(args.command.iter().cloned());

    for rule in collect_domain_rules(file, &args.rules)? {
        builder = builder.rule(rule);
    }
    if !args.dns_servers.is_empty() {
        builder = builder.dns_servers(args.dns_servers.clone());
    } else if let Some(servers) = &file.dns_servers {
        builder = builder.dns_servers(servers.clone());
    }
    if let Some(dir) = args.proxy_logs_dir.as_ref().or(file.proxy_logs_dir.as_ref()) {
        builder = builder.proxy_logs_dir(dir);
    }

    builder.build().context("invalid run configuration")
}
