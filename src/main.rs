//! `awf` command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;

use awf_config::constants::defaults::DEFAULT_TRACE_TARGETS;
use awf_config::constants::env::LOG_FILTER;

mod cli;

use cli::args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    initialize_tracing(&args.log_level)?;

    let exit_code = match args.command {
        Commands::Run(run) => cli::run::handle_run_command(args.config.as_deref(), run).await?,
        Commands::Logs(logs) => cli::logs::handle_logs_command(logs).await?,
        Commands::CheckDomain(check) => {
            cli::check_domain::handle_check_domain_command(args.config.as_deref(), check).await?
        }
        Commands::Diagnose(diagnose) => cli::diagnose::handle_diagnose_command(diagnose).await?,
        Commands::ValidateSeccomp(validate) => {
            cli::seccomp::handle_validate_seccomp_command(validate)?
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// `RUST_LOG` wins; otherwise `level` applies to the awf targets only.
fn initialize_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt::format::FmtSpan;

    let env_filter = if std::env::var_os(LOG_FILTER).is_some() {
        EnvFilter::try_from_default_env().context("invalid RUST_LOG filter")?
    } else {
        let filter = DEFAULT_TRACE_TARGETS
            .split(',')
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::try_new(&filter).with_context(|| format!("invalid log level `{level}`"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::FULL)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))
}
