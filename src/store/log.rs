//! Per-directory `log.txt` records.
//!
//! Two line forms are written:
//!
//! - `[YYYY.MM.DD HH:MM:SS] message` for plain status messages,
//! - a single-line JSON object for messages that carry tags (importance,
//!   message type, exception text and so on) or span several lines.
//!
//! Both forms are read back by [`parse_log`]. In the JSON form, free-form
//! tags sit under a `tags` key.

use crate::error::AppResult;
use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Name of the log file inside a directory.
pub const LOG_FILE: &str = "log.txt";

const STAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// Importance given to records that do not set one.
pub const DEFAULT_IMPORTANCE: i64 = 5;

/// One log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the epoch
    pub timestamp: f64,
    /// 0 (noise) .. 10 (critical)
    #[serde(default = "default_importance")]
    pub importance: i64,
    /// `status`, `user`, `error`, `warning`
    #[serde(rename = "msgType", default = "default_msg_type")]
    pub msg_type: String,
    /// Message text
    pub message: String,
    /// Remaining tags, nested so they never shadow the fields above
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tags: Map<String, Value>,
}

fn default_importance() -> i64 {
    DEFAULT_IMPORTANCE
}

fn default_msg_type() -> String {
    "status".to_string()
}

impl LogEntry {
    /// Build a record, lifting `importance` and `msgType` out of `tags`.
    pub fn new(timestamp: f64, message: &str, mut tags: Map<String, Value>) -> Self {
        let importance = tags
            .remove("importance")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_IMPORTANCE);
        let msg_type = tags
            .remove("msgType")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(default_msg_type);
        Self {
            timestamp,
            importance,
            msg_type,
            message: message.to_string(),
            tags,
        }
    }

    fn is_plain(&self) -> bool {
        self.tags.is_empty()
            && self.importance == DEFAULT_IMPORTANCE
            && self.msg_type == "status"
            && !self.message.contains('\n')
    }

    /// Render as one line, without the trailing newline.
    pub fn to_line(&self) -> AppResult<String> {
        if self.is_plain() {
            Ok(format!("[{}] {}", format_stamp(self.timestamp), self.message))
        } else {
            Ok(serde_json::to_string(self)?)
        }
    }
}

fn format_stamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(STAMP_FORMAT).to_string(),
        None => format!("{:.3}", timestamp),
    }
}

fn parse_stamp(text: &str) -> Option<f64> {
    let naive = NaiveDateTime::parse_from_str(text, STAMP_FORMAT).ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.timestamp() as f64)
}

/// Append one record to `dir/log.txt`. Callers hold the directory's log lock.
pub fn append_entry(dir: &Path, entry: &LogEntry) -> AppResult<()> {
    let line = entry.to_line()?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    writeln!(file, "{}", line)?;
    file.flush()?;
    Ok(())
}

/// Parse the full text of a log file. Lines that match neither form are
/// kept as plain status messages with timestamp 0.
pub fn parse_log(text: &str) -> Vec<LogEntry> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> LogEntry {
    if line.starts_with('{') {
        if let Ok(entry) = serde_json::from_str::<LogEntry>(line) {
            return entry;
        }
    }
    if let Some(rest) = line.strip_prefix('[') {
        if let Some((stamp, message)) = rest.split_once("] ") {
            if let Some(timestamp) = parse_stamp(stamp) {
                return LogEntry::new(timestamp, message, Map::new());
            }
        }
    }
    LogEntry::new(0.0, line, Map::new())
}

/// Read and parse `dir/log.txt`; empty when the file does not exist.
pub fn read_entries(dir: &Path) -> AppResult<Vec<LogEntry>> {
    match std::fs::read_to_string(dir.join(LOG_FILE)) {
        Ok(text) => Ok(parse_log(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn plain_message_uses_bracket_form() {
        let entry = LogEntry::new(1_700_000_000.0, "Protocol started", Map::new());
        let line = entry.to_line().unwrap();
        assert!(line.starts_with('['));
        assert!(line.ends_with("] Protocol started"));
        let back = parse_log(&line);
        assert_eq!(back[0].message, "Protocol started");
        assert_eq!(back[0].timestamp, 1_700_000_000.0);
    }

    #[test]
    fn tagged_message_round_trips() {
        let tags = json!({"importance": 9, "msgType": "error", "exception": "boom"});
        let entry = LogEntry::new(12.25, "Task failed", tags.as_object().unwrap().clone());
        assert_eq!(entry.importance, 9);
        assert_eq!(entry.msg_type, "error");

        let dir = tempdir().unwrap();
        append_entry(dir.path(), &entry).unwrap();
        append_entry(dir.path(), &LogEntry::new(13.0, "second", Map::new())).unwrap();
        let entries = read_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entry);
        assert_eq!(entries[1].message, "second");
    }

    #[test]
    fn multiline_message_stays_on_one_line() {
        let entry = LogEntry::new(5.0, "line one\nline two", Map::new());
        let line = entry.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(parse_log(&line)[0].message, "line one\nline two");
    }

    #[test]
    fn tags_named_like_fields_keep_both_values() {
        let tags = json!({"message": "from tag", "timestamp": "yesterday", "cell": 3});
        let entry = LogEntry::new(42.5, "real message", tags.as_object().unwrap().clone());
        let line = entry.to_line().unwrap();
        let back = parse_log(&line).remove(0);
        assert_eq!(back.message, "real message");
        assert_eq!(back.timestamp, 42.5);
        assert_eq!(back.tags["message"], json!("from tag"));
        assert_eq!(back.tags["timestamp"], json!("yesterday"));
        assert_eq!(back, entry);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(read_entries(dir.path()).unwrap().is_empty());
    }
}
