//! Parsing of `docker logs --timestamps` output

use chrono::{DateTime, Utc};

use crate::models::{LogEntry, LogSeverity, LogStream};

/// Parse both streams and merge them in timestamp order
///
/// Lines without a leading RFC 3339 timestamp are attached to the previous
/// entry of the same stream (multi-line stack traces) or dropped if there is
/// none.
pub fn parse_logs(stdout: &str, stderr: &str) -> Vec<LogEntry> {
    let mut entries = parse_stream(stdout, LogStream::Stdout);
    entries.extend(parse_stream(stderr, LogStream::Stderr));
    entries.sort_by_key(|e| e.timestamp);
    entries
}

fn parse_stream(output: &str, stream: LogStream) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match split_timestamp(line) {
            Some((timestamp, message)) => entries.push(LogEntry {
                timestamp,
                severity: classify(message),
                stream,
                message: message.to_string(),
            }),
            None => {
                if let Some(last) = entries.last_mut() {
                    last.message.push('\n');
                    last.message.push_str(line);
                }
            }
        }
    }

    entries
}

fn split_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let (ts, rest) = line.split_once(' ').unwrap_or((line, ""));
    let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    Some((timestamp, rest))
}

/// Best-effort severity from the engines' usual log formats
pub fn classify(message: &str) -> LogSeverity {
    let upper = message.to_ascii_uppercase();

    // MongoDB structured logs: "s":"E" / "s":"F" / "s":"W" / "s":"D1"
    if upper.contains(r#""S":"E""#) || upper.contains(r#""S":"F""#) {
        return LogSeverity::Error;
    }
    if upper.contains(r#""S":"W""#) {
        return LogSeverity::Warn;
    }
    if upper.contains(r#""S":"D"#) {
        return LogSeverity::Debug;
    }

    if ["ERROR", "FATAL", "PANIC"].iter().any(|k| upper.contains(k)) {
        LogSeverity::Error
    } else if upper.contains("WARN") {
        LogSeverity::Warn
    } else if upper.contains("DEBUG") {
        LogSeverity::Debug
    } else {
        LogSeverity::Info
    }
}
