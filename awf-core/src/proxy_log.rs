//! Proxy access-log analysis.
//!
//! Parses lines written with the `firewall_detailed` log format (see
//! [`ACCESS_LOG_FORMAT`](crate::firewall::ACCESS_LOG_FORMAT)):
//!
//! ```text
//! 1700000000.123 172.30.0.20:41234 api.github.com:443 140.82.112.6:443 1.1 CONNECT 200 TCP_TUNNEL:HIER_DIRECT api.github.com:443 "curl/8.5.0"
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static LINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(\d+)\.(\d+) ([\d.]+):(\d+) ([^:\s]+):(\d+) ([^:\s]+):(\d+) (\S+) (\w+) (\d+) ([^:]+):(\S+) (\S+) "([^"]*)""#,
    )
    .unwrap_or_else(|err| panic!("invalid access log pattern: {err}"))
});

static URL_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?://)?([^:/\s]+)")
        .unwrap_or_else(|err| panic!("invalid url host pattern: {err}"))
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub client_port: u16,
    pub host: String,
    pub host_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: String,
    pub method: String,
    pub status: u16,
    pub decision: String,
    pub hierarchy: String,
    pub url: String,
    pub user_agent: String,
}

impl AccessLogEntry {
    /// Parse one log line; `None` for lines in any other format.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = LINE_PATTERN.captures(line.trim())?;
        let text = |index: usize| caps.get(index).map_or("", |m| m.as_str());

        let secs: i64 = text(1).parse().ok()?;
        let fraction = text(2);
        let millis: u32 = fraction.get(..3).unwrap_or(fraction).parse().ok()?;
        let scale = 10u32.pow(3u32.saturating_sub(fraction.len().min(3) as u32));
        let timestamp = DateTime::from_timestamp(secs, millis * scale * 1_000_000)?;

        Some(Self {
            timestamp,
            client_ip: text(3).to_string(),
            client_port: text(4).parse().ok()?,
            host: text(5).to_string(),
            host_port: text(6).parse().ok()?,
            dest_ip: text(7).to_string(),
            dest_port: text(8).parse().ok()?,
            protocol: text(9).to_string(),
            method: text(10).to_string(),
            status: text(11).parse().ok()?,
            decision: text(12).to_string(),
            hierarchy: text(13).to_string(),
            url: text(14).to_string(),
            user_agent: text(15).to_string(),
        })
    }

    /// Requested domain, falling back to the URL when no Host header was seen.
    pub fn domain(&self) -> &str {
        if self.host != "-" {
            return &self.host;
        }
        URL_HOST
            .captures(&self.url)
            .and_then(|caps| caps.get(1))
            .map_or("-", |m| m.as_str())
    }

    pub fn is_allowed(&self) -> bool {
        !self.decision.contains("DENIED")
    }

    pub fn is_https(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Parse every recognizable line, skipping the rest.
pub fn parse_access_log(contents: &str) -> Vec<AccessLogEntry> {
    contents.lines().filter_map(AccessLogEntry::parse).collect()
}

pub async fn read_access_log(path: &Path) -> Result<Vec<AccessLogEntry>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read proxy log {}", path.display()))?;
    Ok(parse_access_log(&contents))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub blocked_only: bool,
    /// Substring the domain must contain.
    pub domain: Option<String>,
    pub top: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn blocked() -> Self {
        Self {
            blocked_only: true,
            ..Self::default()
        }
    }

    fn admits(&self, entry: &AccessLogEntry) -> bool {
        if self.blocked_only && entry.is_allowed() {
            return false;
        }
        if let Some(needle) = &self.domain {
            if !entry.domain().contains(needle.as_str()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| entry.timestamp > until) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub allowed: usize,
    pub blocked: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub total: usize,
    pub allowed: usize,
    pub blocked: usize,
    pub time_range: Option<TimeRange>,
    pub domains: Vec<DomainStats>,
}

/// Aggregate per-domain counts, busiest domain first.
///
/// Ties keep first-seen order. Totals cover every admitted entry; `top` only
/// truncates the domain list.
pub fn summarize(entries: &[AccessLogEntry], filter: &LogFilter) -> LogSummary {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut domains: Vec<DomainStats> = Vec::new();
    let (mut allowed, mut blocked) = (0usize, 0usize);
    let mut time_range: Option<TimeRange> = None;

    for entry in entries.iter().filter(|entry| filter.admits(entry)) {
        let domain = entry.domain();
        if domain == "-" {
            continue;
        }
        let slot = *index.entry(domain.to_string()).or_insert_with(|| {
            domains.push(DomainStats {
                domain: domain.to_string(),
                allowed: 0,
                blocked: 0,
                total: 0,
            });
            domains.len() - 1
        });
        let Some(stats) = domains.get_mut(slot) else {
            continue;
        };
        if entry.is_allowed() {
            stats.allowed += 1;
            allowed += 1;
        } else {
            stats.blocked += 1;
            blocked += 1;
        }
        stats.total += 1;

        time_range = Some(match time_range {
            None => TimeRange {
                start: entry.timestamp,
                end: entry.timestamp,
            },
            Some(range) => TimeRange {
                start: range.start.min(entry.timestamp),
                end: range.end.max(entry.timestamp),
            },
        });
    }

    domains.sort_by(|a, b| b.total.cmp(&a.total));
    if let Some(top) = filter.top {
        domains.truncate(top);
    }

    LogSummary {
        total: allowed + blocked,
        allowed,
        blocked,
        time_range,
        domains,
    }
}

impl LogSummary {
    pub fn blocked_domains(&self) -> impl Iterator<Item = &str> {
        self.domains
            .iter()
            .filter(|stats| stats.blocked > 0)
            .map(|stats| stats.domain.as_str())
    }

    /// Plain-text table for terminal output.
    pub fn render_table(&self, blocked_only: bool) -> String {
        let mut out = String::new();
        if blocked_only {
            let _ = writeln!(out, "Blocked Domains (sorted by count):");
        } else {
            let _ = writeln!(out, "Domain Statistics (sorted by total requests):");
        }
        let _ = writeln!(out);

        if self.domains.is_empty() {
            let _ = writeln!(out, "No matching domains found.");
        } else {
            let width = self
                .domains
                .iter()
                .map(|stats| stats.domain.len())
                .max()
                .unwrap_or(0)
                .max("Domain".len());
            let _ = writeln!(
                out,
                "{:<width$}  {:>7}  {:>7}  {:>7}",
                "Domain", "Blocked", "Allowed", "Total"
            );
            let _ = writeln!(out, "{}", "-".repeat(width + 27));
            for stats in &self.domains {
                let _ = writeln!(
                    out,
                    "{:<width$}  {:>7}  {:>7}  {:>7}",
                    stats.domain, stats.blocked, stats.allowed, stats.total
                );
            }
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "Total requests: {}", self.total);
        if self.total > 0 {
            let pct = |count: usize| count as f64 * 100.0 / self.total as f64;
            let _ = writeln!(out, "Blocked: {} ({:.1}%)", self.blocked, pct(self.blocked));
            let _ = writeln!(out, "Allowed: {} ({:.1}%)", self.allowed, pct(self.allowed));
        }
        if let Some(range) = &self.time_range {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Time range: {} to {}",
                range.start.to_rfc3339(),
                range.end.to_rfc3339()
            );
        }
        out
    }
}
