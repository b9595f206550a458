use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use awf_config::constants::defaults::DEFAULT_LOG_LEVEL;
use awf_config::constants::env::CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(name = "awf")]
#[command(about = "Run an agent behind a domain allow-list firewall")]
#[command(version)]
pub struct Cli {
    /// Log level for awf targets when RUST_LOG is unset
    #[arg(long, global = true, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Run configuration file (TOML)
    #[arg(long, global = true, env = CONFIG_PATH)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run an agent command inside the firewall sandbox
    Run(RunArgs),
    /// Summarize a proxy access log
    Logs(LogsArgs),
    /// Check whether a host would be allowed by the configured rules
    CheckDomain(CheckDomainArgs),
    /// Check a running or leftover sandbox for common problems
    Diagnose(DiagnoseArgs),
    /// Validate the built-in or a custom seccomp profile
    ValidateSeccomp(ValidateSeccompArgs),
}

/// Domain rule inputs shared by `run` and `check-domain`.
#[derive(Debug, Clone, Default, Args)]
pub struct RuleArgs {
    /// Rule file (YAML); repeat to merge several, in order
    #[arg(long = "rules", value_name = "FILE")]
    pub rule_files: Vec<PathBuf>,

    /// Comma-separated domains to allow, including their subdomains
    #[arg(long, value_delimiter = ',', value_name = "DOMAINS")]
    pub allow_domains: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub rules: RuleArgs,

    /// Comma-separated IPv4 DNS resolvers (default 8.8.8.8,8.8.4.4)
    #[arg(long, value_delimiter = ',', value_name = "SERVERS")]
    pub dns_servers: Vec<String>,

    /// Directory for proxy logs (default: <work-dir>/squid-logs)
    #[arg(long, value_name = "DIR")]
    pub proxy_logs_dir: Option<PathBuf>,

    /// Working directory for generated files (default: a fresh /tmp/awf-XXXXXX)
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Route model-provider keys through the API proxy container
    #[arg(long)]
    pub enable_api_proxy: bool,

    /// Use local images only
    #[arg(long)]
    pub skip_pull: bool,

    /// Pass a host environment variable to the agent by name (repeatable)
    #[arg(long = "env", value_delimiter = ',', value_name = "NAME")]
    pub forward_env: Vec<String>,

    /// Leave credentials in the compose file after containers start
    #[arg(long, hide = true)]
    pub no_secret_redaction: bool,

    /// Agent command and its arguments
    #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Proxy access log, or a directory containing access.log
    pub path: PathBuf,

    /// Only count denied requests
    #[arg(long)]
    pub blocked_only: bool,

    /// Only include domains containing this text
    #[arg(long)]
    pub domain: Option<String>,

    /// Show the N busiest domains
    #[arg(long, value_name = "N")]
    pub top: Option<usize>,

    /// Ignore entries before this RFC 3339 timestamp
    #[arg(long, value_parser = parse_timestamp)]
    pub since: Option<DateTime<Utc>>,

    /// Ignore entries after this RFC 3339 timestamp
    #[arg(long, value_parser = parse_timestamp)]
    pub until: Option<DateTime<Utc>>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct CheckDomainArgs {
    /// Host name to check
    pub host: String,

    #[command(flatten)]
    pub rules: RuleArgs,

    /// Look the host up in this proxy access log (file or log directory)
    #[arg(long, value_name = "PATH", conflicts_with = "live")]
    pub log: Option<PathBuf>,

    /// Look the host up in the running proxy's access log
    #[arg(long)]
    pub live: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct DiagnoseArgs {
    /// Work directory of the run to check (default: newest awf-* in the temp dir)
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Show container state, recent logs, and the network instead of checks
    #[arg(long)]
    pub inspect: bool,

    /// Log lines to show per container with --inspect
    #[arg(long, default_value_t = 5, value_name = "N")]
    pub tail: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ValidateSeccompArgs {
    /// Profile to validate (default: built-in profile)
    pub path: Option<PathBuf>,

    /// Print the profile being validated
    #[arg(long)]
    pub print: bool,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "awf",
            "run",
            "--allow-domains",
            "github.com,npmjs.org",
            "--skip-pull",
            "--env",
            "NPM_TOKEN",
            "--env",
            "CARGO_REGISTRY_TOKEN",
            "--",
            "copilot",
            "--prompt",
            "fix the build",
        ])
        .unwrap();
        let Commands::Run(run) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(run.rules.allow_domains, vec!["github.com", "npmjs.org"]);
        assert!(run.skip_pull);
        assert_eq!(run.forward_env, vec!["NPM_TOKEN", "CARGO_REGISTRY_TOKEN"]);
        assert_eq!(run.command, vec!["copilot", "--prompt", "fix the build"]);
    }

    #[test]
    fn logs_parses_time_range() {
        let cli = Cli::try_parse_from([
            "awf",
            "logs",
            "/tmp/awf/squid-logs",
            "--since",
            "2024-01-01T00:00:00Z",
            "--format",
            "json",
        ])
        .unwrap();
        let Commands::Logs(logs) = cli.command else {
            panic!("expected logs command");
        };
        assert_eq!(logs.since.unwrap().timestamp(), 1_704_067_200);
        assert_eq!(logs.format, OutputFormat::Json);
    }

    #[test]
    fn check_domain_log_sources_are_exclusive() {
        let err = Cli::try_parse_from([
            "awf",
            "check-domain",
            "github.com",
            "--log",
            "/tmp/awf/squid-logs",
            "--live",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn diagnose_defaults() {
        let cli = Cli::try_parse_from(["awf", "diagnose", "--inspect"]).unwrap();
        let Commands::Diagnose(diagnose) = cli.command else {
            panic!("expected diagnose command");
        };
        assert!(diagnose.inspect);
        assert_eq!(diagnose.tail, 5);
        assert_eq!(diagnose.work_dir, None);
        assert_eq!(diagnose.format, OutputFormat::Table);
    }
}
