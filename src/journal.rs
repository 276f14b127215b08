//! systemd journal access for the agent's own unit.
//!
//! Thin wrappers around `journalctl` and `systemctl`. Reads are paginated by
//! journal cursor; restarts are queued and never report back.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::console::strip_ansi;
use crate::error::{Error, Result};
use crate::models::LogLevel;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub cursor: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JournalPage {
    pub entries: Vec<JournalEntry>,
    /// Pass back as `cursor` to continue after the last entry.
    pub next_cursor: Option<String>,
}

pub fn validate_unit_name(unit: &str) -> Result<()> {
    let ok = !unit.is_empty()
        && unit.len() <= 256
        && !unit.starts_with('-')
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | ':' | '\\'));
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!("Invalid unit name '{}'", unit)))
    }
}

/// Read up to `limit` entries of `unit`. Without a cursor the most recent
/// entries are returned; with one, the entries following it.
pub async fn read_unit_journal(
    unit: &str,
    limit: usize,
    cursor: Option<&str>,
) -> Result<JournalPage> {
    validate_unit_name(unit)?;
    let limit = limit.clamp(1, 5000);

    let mut cmd = tokio::process::Command::new("journalctl");
    cmd.arg("-u").arg(unit).arg("-o").arg("json").arg("--no-pager");
    match cursor {
        Some(cursor) => {
            cmd.arg(format!("--after-cursor={}", cursor));
        }
        None => {
            cmd.arg("-n").arg(limit.to_string());
        }
    }

    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Process(format!("failed to run journalctl: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Process(format!(
            "journalctl exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(page_from_output(&stdout, limit, cursor))
}

fn page_from_output(stdout: &str, limit: usize, cursor: Option<&str>) -> JournalPage {
    let entries: Vec<JournalEntry> = stdout
        .lines()
        .filter_map(parse_journal_line)
        .take(limit)
        .collect();
    let next_cursor = entries
        .last()
        .map(|e| e.cursor.clone())
        .or_else(|| cursor.map(str::to_string));
    JournalPage {
        entries,
        next_cursor,
    }
}

/// One `journalctl -o json` record. Lines without a cursor are skipped.
pub fn parse_journal_line(line: &str) -> Option<JournalEntry> {
    let record: Value = serde_json::from_str(line.trim()).ok()?;
    let cursor = record.get("__CURSOR")?.as_str()?.to_string();
    let timestamp = record
        .get("__REALTIME_TIMESTAMP")
        .and_then(Value::as_str)
        .and_then(|us| us.parse::<i64>().ok())
        .map(|us| us / 1000)
        .unwrap_or(0);
    let level = match record
        .get("PRIORITY")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<u8>().ok())
    {
        Some(0..=3) => LogLevel::Error,
        Some(4) => LogLevel::Warning,
        _ => LogLevel::Info,
    };
    let message = match record.get("MESSAGE") {
        Some(Value::String(s)) => s.clone(),
        // Non-UTF-8 messages come through as byte arrays.
        Some(Value::Array(bytes)) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => String::new(),
    };
    Some(JournalEntry {
        cursor,
        timestamp,
        level,
        message: strip_ansi(&message),
    })
}

/// Restart `unit` after `delay`. Tries passwordless sudo first, then a plain
/// `systemctl`; failures are only logged.
pub fn queue_restart_unit(unit: &str, delay: Duration) -> Result<()> {
    validate_unit_name(unit)?;
    let unit = unit.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tracing::info!("Restarting unit '{}'", unit);

        match run_quiet("sudo", &["-n", "systemctl", "restart", &unit]).await {
            Ok(()) => return,
            Err(e) => tracing::warn!("sudo restart of '{}' failed: {}; retrying without sudo", unit, e),
        }
        if let Err(e) = run_quiet("systemctl", &["restart", &unit]).await {
            tracing::error!("Failed to restart unit '{}': {}", unit, e);
        }
    });
    Ok(())
}

async fn run_quiet(program: &str, args: &[&str]) -> std::result::Result<(), String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} ({})",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_and_maps_priority() {
        let line = r#"{"__CURSOR":"s=abc;i=1","__REALTIME_TIMESTAMP":"1700000000123456","PRIORITY":"3","MESSAGE":"\u001b[31mboom\u001b[0m"}"#;
        let entry = parse_journal_line(line).unwrap();
        assert_eq!(entry.cursor, "s=abc;i=1");
        assert_eq!(entry.timestamp, 1_700_000_000_123);
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "boom");

        let warn = r#"{"__CURSOR":"c","PRIORITY":"4","MESSAGE":[104,105]}"#;
        let entry = parse_journal_line(warn).unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.message, "hi");

        assert!(parse_journal_line(r#"{"MESSAGE":"no cursor"}"#).is_none());
        assert!(parse_journal_line("garbage").is_none());
    }

    #[test]
    fn page_keeps_cursor_when_nothing_new() {
        let page = page_from_output("", 10, Some("c1"));
        assert!(page.entries.is_empty());
        assert_eq!(page.next_cursor.as_deref(), Some("c1"));

        let out = "{\"__CURSOR\":\"a\",\"MESSAGE\":\"x\"}\n{\"__CURSOR\":\"b\",\"MESSAGE\":\"y\"}\n";
        let page = page_from_output(out, 1, None);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("a"));
    }

    #[test]
    fn unit_names_are_validated() {
        assert!(validate_unit_name("game-node-agent.service").is_ok());
        assert!(validate_unit_name("getty@tty1.service").is_ok());
        assert!(validate_unit_name("--all").is_err());
        assert!(validate_unit_name("a b").is_err());
        assert!(validate_unit_name("").is_err());
    }
}
