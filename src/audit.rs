//! Structured JSONL audit log of finished proxy sessions.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    RelayCompleted,
    RelayFailed,
    TunnelClosed,
    TunnelFailed,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub session: u64,
    pub event: AuditEvent,
    pub method: String,
    pub target: String,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Bytes sent from the client towards the upstream
    pub bytes_up: u64,
    /// Bytes sent from the upstream back to the client
    pub bytes_down: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(
        session: u64,
        event: AuditEvent,
        method: impl Into<String>,
        target: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_iso8601(),
            session,
            event,
            method: method.into(),
            target: target.into(),
            transport: transport.into(),
            status: None,
            bytes_up: 0,
            bytes_down: 0,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_bytes(mut self, up: u64, down: u64) -> Self {
        self.bytes_up = up;
        self.bytes_down = down;
        self
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Returns the current UTC time as an ISO 8601 / RFC 3339 string.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Audit logger that writes JSONL entries to a file.
///
/// Uses `std::fs::File` with a `std::sync::Mutex`; entries are a single
/// short line each.
pub struct AuditLogger {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
}

impl AuditLogger {
    /// Open (or create) the audit log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: std::sync::Mutex::new(std::io::BufWriter::new(file)),
        })
    }

    /// Write an audit entry as a JSON line. Errors are logged but never propagated.
    pub fn log(&self, entry: &AuditEntry) {
        use std::io::Write;
        let json = match serde_json::to_string(entry) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit entry");
                return;
            }
        };

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "Failed to lock audit log writer");
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{}", json) {
            tracing::error!(error = %e, "Failed to write audit entry");
            return;
        }
        if let Err(e) = writer.flush() {
            tracing::error!(error = %e, "Failed to flush audit log");
        }
    }
}

/// Human readable duration, e.g. `0`, `432ms`, `12s`.
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1 {
        "0".to_string()
    } else if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{}s", elapsed.as_secs())
    }
}

/// Human readable byte count, e.g. `512B`, `3KB`, `7MB`.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}MB", bytes / 1024 / 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;

    fn sample_entry() -> AuditEntry {
        AuditEntry {
            timestamp: "2026-02-09T14:30:00Z".to_string(),
            session: 7,
            event: AuditEvent::RelayCompleted,
            method: "GET".to_string(),
            target: "http://example.com/".to_string(),
            transport: "direct".to_string(),
            status: Some(200),
            bytes_up: 0,
            bytes_down: 42,
            duration_ms: 12,
            error: None,
        }
    }

    #[test]
    fn test_audit_entry_serialization() {
        let t = test_report!("AuditEntry serializes to valid JSON");
        let json = serde_json::to_string(&sample_entry()).unwrap();
        t.assert_contains("has event", &json, "\"event\":\"relay_completed\"");
        t.assert_contains("has session", &json, "\"session\":7");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        t.assert_eq("bytes_down", &parsed["bytes_down"].as_u64().unwrap(), &42u64);
        t.assert_eq("status", &parsed["status"].as_u64().unwrap(), &200u64);
    }

    #[test]
    fn test_optional_fields_omitted_when_none() {
        let t = test_report!("Optional fields omitted from JSON when None");
        let entry = AuditEntry::new(1, AuditEvent::TunnelClosed, "CONNECT", "a.com:443", "ssh");
        let json = serde_json::to_string(&entry).unwrap();
        t.assert_true("no status field", !json.contains("\"status\""));
        t.assert_true("no error field", !json.contains("\"error\""));
    }

    #[test]
    fn test_builder_fields() {
        let t = test_report!("AuditEntry builder helpers fill fields");
        let entry = AuditEntry::new(3, AuditEvent::TunnelFailed, "CONNECT", "b.com:22", "socks")
            .with_bytes(100, 4)
            .with_duration(Duration::from_millis(1500))
            .with_error("connection refused");
        t.assert_eq("bytes_up", &entry.bytes_up, &100u64);
        t.assert_eq("bytes_down", &entry.bytes_down, &4u64);
        t.assert_eq("duration_ms", &entry.duration_ms, &1500u64);
        t.assert_eq(
            "error",
            &entry.error.as_deref(),
            &Some("connection refused"),
        );
    }

    #[test]
    fn test_now_iso8601_format() {
        let t = test_report!("now_iso8601 returns valid RFC 3339 timestamp");
        let ts = now_iso8601();
        t.assert_contains("contains T", &ts, "T");
        t.assert_true("ends with Z", ts.ends_with('Z'));
        let parsed =
            time::OffsetDateTime::parse(&ts, &time::format_description::well_known::Rfc3339);
        t.assert_true("parses as RFC 3339", parsed.is_ok());
    }

    #[test]
    fn test_all_event_variants_serialize() {
        let t = test_report!("All AuditEvent variants serialize correctly");
        let events = vec![
            (AuditEvent::RelayCompleted, "\"relay_completed\""),
            (AuditEvent::RelayFailed, "\"relay_failed\""),
            (AuditEvent::TunnelClosed, "\"tunnel_closed\""),
            (AuditEvent::TunnelFailed, "\"tunnel_failed\""),
        ];
        for (event, expected) in events {
            let json = serde_json::to_string(&event).unwrap();
            t.assert_eq(&format!("{:?}", event), &json.as_str(), &expected);
        }
    }

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let t = test_report!("AuditLogger writes valid JSONL to file");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let logger = AuditLogger::open(&path).unwrap();
        logger.log(&sample_entry());
        logger.log(&sample_entry());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        t.assert_eq("two lines", &lines.len(), &2usize);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        t.assert_eq("method", &parsed["method"].as_str().unwrap(), &"GET");
    }

    #[test]
    fn test_format_duration() {
        let t = test_report!("Durations render as 0 / ms / s");
        t.assert_eq("sub-ms", &format_duration(Duration::from_micros(300)).as_str(), &"0");
        t.assert_eq("ms", &format_duration(Duration::from_millis(432)).as_str(), &"432ms");
        t.assert_eq("s", &format_duration(Duration::from_millis(12_400)).as_str(), &"12s");
    }

    #[test]
    fn test_format_size() {
        let t = test_report!("Sizes render as B / KB / MB");
        t.assert_eq("bytes", &format_size(512).as_str(), &"512B");
        t.assert_eq("kilobytes", &format_size(3 * 1024 + 7).as_str(), &"3KB");
        t.assert_eq("megabytes", &format_size(7 * 1024 * 1024).as_str(), &"7MB");
    }
}
