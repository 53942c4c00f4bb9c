//! Debug-mode persistence of every attempt's request and response.
//!
//! One JSON-lines file per logical request, keyed by timestamp, provider,
//! request id and process id. Write failures are logged and swallowed.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_DEBUG_DIR: &str = ".promptrelay/debug";

/// Headers that must never reach a debug file.
const REDACTED_HEADERS: &[&str] = &["authorization", "x-api-key"];

/// Only alphanumerics, `-` and `_` survive into a filename.
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DebugLog {
    path: PathBuf,
}

impl DebugLog {
    pub fn new(dir: &Path, provider: &str, request_id: &str) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let pid = std::process::id();
        let filename = format!(
            "{ts}_{}_{}_{pid}.jsonl",
            sanitize_component(provider),
            sanitize_component(request_id)
        );
        Self {
            path: dir.join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn request(&self, attempt: u8, url: &str, headers: &[(&str, &str)], body: &Value) {
        let headers: serde_json::Map<String, Value> = headers
            .iter()
            .map(|(k, v)| {
                let shown = if REDACTED_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                    "[REDACTED]"
                } else {
                    *v
                };
                (k.to_string(), Value::String(shown.to_string()))
            })
            .collect();
        self.append(serde_json::json!({
            "kind": "request",
            "attempt": attempt,
            "url": url,
            "headers": headers,
            "body": body,
        }))
        .await;
    }

    pub async fn response(&self, attempt: u8, status: Option<u16>, body: &str) {
        self.append(serde_json::json!({
            "kind": "response",
            "attempt": attempt,
            "status": status,
            "body": body,
        }))
        .await;
    }

    pub async fn note(&self, attempt: u8, message: &str) {
        self.append(serde_json::json!({
            "kind": "note",
            "attempt": attempt,
            "message": message,
        }))
        .await;
    }

    async fn append(&self, mut entry: Value) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        entry["ts_ms"] = Value::from(ts);
        if let Err(e) = self.try_append(&entry).await {
            tracing::warn!(path = %self.path.display(), "failed to write debug log: {e}");
        }
    }

    async fn try_append(&self, entry: &Value) -> Result<(), std::io::Error> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
