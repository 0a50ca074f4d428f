use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

const MAX_LOG_ENTRIES: usize = 10_000;
const MAX_LOGGED_BODY: usize = 4096;

const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "api-key", "apikey"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Ring buffer of recent entries backed by an append-only JSONL file.
pub struct AuditLog {
    entries: VecDeque<LogEntry>,
    writer: BufWriter<File>,
}

impl AuditLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);
        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        Ok(Self {
            entries,
            writer: BufWriter::new(file),
        })
    }

    pub fn log(&mut self, entry: LogEntry) {
        if let Ok(json) = serde_json::to_string(&entry) {
            if let Err(e) = writeln!(self.writer, "{}", json).and_then(|_| self.writer.flush()) {
                tracing::warn!(error = %e, "Failed to write audit log entry");
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<AuditLog>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(AuditLog::open(file_path)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut log) = self.0.lock() {
            log.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }

    /// Record an outgoing upstream request.
    pub fn log_request(&self, route: &str, url: &str, headers: &HeaderMap, body: &[u8], mask: bool) {
        let body = render_body(body, mask);
        let entry = LogEntry::new(LogLevel::Info, "upstream", format!("POST {} route={}", url, route))
            .with_context(json!({
                "route": route,
                "url": url,
                "headers": render_headers(headers, mask),
                "body": body,
            }));
        self.log(entry);
    }

    /// Record an upstream response status and (unary) body.
    pub fn log_response(&self, route: &str, status: u16, body: Option<&[u8]>, mask: bool) {
        let level = if status >= 400 { LogLevel::Warn } else { LogLevel::Info };
        let entry = LogEntry::new(level, "upstream", format!("status={} route={}", status, route))
            .with_context(json!({
                "route": route,
                "status": status,
                "body": body.map(|b| render_body(b, mask)),
            }));
        self.log(entry);
    }
}

/// `first8...last4`, or `***` for values too short to reveal any part of.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Mask API keys embedded anywhere in free text.
pub fn mask_api_keys(text: &str) -> String {
    static KEY_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = KEY_PATTERN.get_or_init(|| {
        Regex::new(r"(sk-ant-[a-zA-Z0-9-]{20,}|sk-[a-zA-Z0-9]{20,})").ok()
    });
    match pattern {
        Some(re) => re
            .replace_all(text, |caps: &regex::Captures<'_>| mask_secret(&caps[0]))
            .into_owned(),
        None => text.to_string(),
    }
}

fn render_headers(headers: &HeaderMap, mask: bool) -> serde_json::Map<String, serde_json::Value> {
    headers
        .iter()
        .map(|(name, value)| {
            let raw = value.to_str().unwrap_or("<binary>");
            let shown = if mask && is_sensitive_header(name.as_str()) {
                match raw.split_once(' ') {
                    Some((scheme, secret)) => format!("{} {}", scheme, mask_secret(secret)),
                    None => mask_secret(raw),
                }
            } else {
                raw.to_string()
            };
            (name.as_str().to_string(), serde_json::Value::String(shown))
        })
        .collect()
}

fn render_body(body: &[u8], mask: bool) -> String {
    let text = String::from_utf8_lossy(body);
    let text = if mask { mask_api_keys(&text) } else { text.into_owned() };
    if text.len() <= MAX_LOGGED_BODY {
        return text;
    }
    let mut end = MAX_LOGGED_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated {} bytes]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_mask_secret_shapes() {
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-abcdefgh12345678wxyz"), "sk-abcde...wxyz");
    }

    #[test]
    fn test_mask_keys_in_body() {
        let body = r#"{"key":"sk-ant-REDACTED","other":"sk-short"}"#;
        let masked = mask_api_keys(body);
        assert!(masked.contains("sk-ant-a...ZZZZ"));
        assert!(masked.contains("sk-short"));
        assert!(!masked.contains("aaaaaaaaaaaa"));
    }

    #[test]
    fn test_audit_entries_are_masked_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = SharedLogger::new(&path).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer sk-abcdefghijklmnopqrstuvwx"),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        logger.log_request("fast", "http://up/v1", &headers, b"{}", true);

        let entry = &logger.recent(1)[0];
        let ctx = entry.context.as_ref().unwrap();
        assert_eq!(ctx["headers"]["authorization"], "Bearer sk-abcde...uvwx");
        assert_eq!(ctx["headers"]["content-type"], "application/json");

        drop(logger);
        let reopened = SharedLogger::new(&path).unwrap();
        assert_eq!(reopened.recent(10).len(), 1);
    }

    #[test]
    fn test_unmasked_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SharedLogger::new(dir.path().join("a.log")).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-secretsecretsecret"));
        logger.log_request("r", "u", &headers, b"", false);
        let ctx = logger.recent(1)[0].context.clone().unwrap();
        assert_eq!(ctx["headers"]["x-api-key"], "sk-ant-secretsecretsecret");
    }
}
