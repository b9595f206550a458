use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use awf_config::constants::files::PROXY_ACCESS_LOG;
use awf_core::proxy_log::{LogFilter, read_access_log, summarize};

use super::args::{LogsArgs, OutputFormat};

pub async fn handle_logs_command(args: LogsArgs) -> Result<i32> {
    let path = resolve_log_path(&args.path).await?;
    let entries = read_access_log(&path).await?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "parsed proxy log");

    let filter = LogFilter {
        blocked_only: args.blocked_only,
        domain: args.domain,
        top: args.top,
        since: args.since,
        until: args.until,
    };
    let summary = summarize(&entries, &filter);

    match args.format {
        OutputFormat::Table => print!("{}", summary.render_table(filter.blocked_only)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("failed to encode log summary")?
        ),
    }
    Ok(0)
}

/// Accept either the access log itself or the directory that holds it.
pub(crate) async fn resolve_log_path(path: &Path) -> Result<PathBuf> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("proxy log not found at {}", path.display()))?;
    if !metadata.is_dir() {
        return Ok(path.to_path_buf());
    }

    let candidate = path.join(PROXY_ACCESS_LOG);
    if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        Ok(candidate)
    } else {
        bail!("{} does not contain {PROXY_ACCESS_LOG}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_resolves_to_access_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(PROXY_ACCESS_LOG);
        std::fs::write(&log, "").unwrap();
        assert_eq!(resolve_log_path(dir.path()).await.unwrap(), log);
    }

    #[tokio::test]
    async fn directory_without_log_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_log_path(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("does not contain access.log"));
    }
}
