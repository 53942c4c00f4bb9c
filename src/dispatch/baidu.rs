//! Baidu general translation API.
//!
//! Signed form POST, one request per text chunk. Business errors arrive as
//! HTTP 200 with an `error_code`; a few of them are transient and retried.

use std::time::Duration;

use md5::{Digest, Md5};
use rand::Rng;
use reqwest::Client;
use serde_json::Value;

use crate::config::{ProviderConfig, ServiceType};
use crate::error::{RelayError, parse_error_body};

pub const TRANSLATE_URL: &str = "https://fanyi-api.baidu.com/api/trans/vip/translate";

/// Longest chunk sent in one request.
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Total attempts per chunk, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(2);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RETRYABLE_CODES: &[&str] = &["52001", "52002", "54003"];

pub fn is_retryable(code: &str) -> bool {
    RETRYABLE_CODES.contains(&code)
}

pub fn error_message(code: &str) -> String {
    let known = match code {
        "52001" => "request timed out, please retry",
        "52002" => "translation system error, please retry",
        "52003" => "unauthorized user, check the app id and secret key",
        "54000" => "a required parameter is empty",
        "54001" => "signature error, check the secret key",
        "54003" => "access frequency limited, slow down",
        "54004" => "insufficient account balance",
        "54005" => "long queries sent too frequently",
        "58000" => "client IP is not whitelisted",
        "58001" => "translation direction not supported",
        "58002" => "the service is currently closed",
        "90107" => "account certification not passed or not yet effective",
        _ => return format!("unknown error (code: {code})"),
    };
    known.to_string()
}

/// `md5(appid + q + salt + secret)`, lowercase hex.
pub fn sign(app_id: &str, query: &str, salt: u32, secret_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(app_id.as_bytes());
    hasher.update(query.as_bytes());
    hasher.update(salt.to_string().as_bytes());
    hasher.update(secret_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn salt() -> u32 {
    rand::thread_rng().gen_range(32768..65536)
}

/// Split `text` into chunks of at most `max_chars` characters, breaking on
/// line boundaries. A single line longer than `max_chars` is cut by
/// character count. Joining the chunks with `\n` restores the line layout,
/// blank lines included (a blank line that lands at a chunk boundary becomes
/// an empty chunk).
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    // `current` can be open while holding only an empty line.
    let mut open = false;

    for line in text.split('\n') {
        let line_len = line.chars().count();

        if line_len > max_chars {
            if open {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                open = false;
            }
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        if open && current_len + 1 + line_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
            open = false;
        }
        if open {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
        open = true;
    }

    if open && !current.trim().is_empty() {
        chunks.push(current);
    }
    if chunks.iter().all(|c| c.trim().is_empty()) {
        chunks.clear();
    }
    chunks
}

#[derive(Clone)]
pub struct BaiduTranslator {
    client: Client,
    endpoint: String,
    app_id: String,
    secret_key: String,
    provider_name: String,
    base_delay: Duration,
}

impl std::fmt::Debug for BaiduTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaiduTranslator")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl BaiduTranslator {
    pub fn from_config(provider: &ProviderConfig) -> Result<Self, RelayError> {
        if provider.service_type != ServiceType::Baidu {
            return Err(RelayError::Config(format!(
                "{} is not a baidu translation service",
                provider.display_name()
            )));
        }
        let app_id = provider
            .app_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                RelayError::Config(format!("{}: app_id is not configured", provider.display_name()))
            })?;
        if provider.api_key.trim().is_empty() {
            return Err(RelayError::Config(format!(
                "{}: secret key is not configured",
                provider.display_name()
            )));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Other(format!("failed to build HTTP client: {e}")))?;

        let endpoint = match provider.base_url.trim() {
            "" => TRANSLATE_URL.to_string(),
            url => url.trim_end_matches('#').to_string(),
        };

        Ok(Self {
            client,
            endpoint,
            app_id: app_id.to_string(),
            secret_key: provider.api_key.trim().to_string(),
            provider_name: provider.display_name().to_string(),
            base_delay: BASE_RETRY_DELAY,
        })
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Translate all of `text`, chunk by chunk, in order.
    pub async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String, RelayError> {
        let chunks = split_text(text, MAX_CHUNK_CHARS);
        let mut translated = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            tracing::debug!(
                provider = self.provider_name.as_str(),
                chunk = index + 1,
                total = chunks.len(),
                "translating chunk"
            );
            if chunk.trim().is_empty() {
                translated.push(String::new());
                continue;
            }
            translated.push(self.translate_chunk(chunk, from, to).await?);
        }
        Ok(translated.join("\n"))
    }

    /// One chunk with retry. The sleep between attempts is `base × attempt`.
    async fn translate_chunk(&self, query: &str, from: &str, to: &str) -> Result<String, RelayError> {
        let mut attempt = 1;
        loop {
            match self.request_once(query, from, to).await {
                Err(RelayError::Baidu { code, message }) if is_retryable(&code) && attempt < MAX_ATTEMPTS => {
                    let delay = self.base_delay * attempt;
                    tracing::warn!(
                        provider = self.provider_name.as_str(),
                        code = code.as_str(),
                        attempt,
                        "{message}, retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn request_once(&self, query: &str, from: &str, to: &str) -> Result<String, RelayError> {
        let salt = salt();
        let salt_text = salt.to_string();
        let sign = sign(&self.app_id, query, salt, &self.secret_key);
        let form = [
            ("q", query),
            ("from", from),
            ("to", to),
            ("appid", self.app_id.as_str()),
            ("salt", salt_text.as_str()),
            ("sign", sign.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| RelayError::transport(&self.provider_name, &e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::transport(&self.provider_name, &e))?;

        if !status.is_success() {
            return Err(RelayError::Http {
                provider: self.provider_name.clone(),
                status: status.as_u16(),
                message: parse_error_body(&bytes),
            });
        }

        let v: Value = serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::SchemaParse(format!("baidu translate response: {e}")))?;
        parse_reply(&v)
    }
}

/// Pull the translation (or the business error) out of a reply.
fn parse_reply(v: &Value) -> Result<String, RelayError> {
    let code = match &v["error_code"] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    if let Some(code) = code.filter(|c| c != "52000") {
        return Err(RelayError::Baidu {
            message: error_message(&code),
            code,
        });
    }

    let results = v["trans_result"].as_array().ok_or_else(|| {
        RelayError::SchemaParse("baidu translate response has no trans_result".to_string())
    })?;
    Ok(results
        .iter()
        .filter_map(|r| r["dst"].as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_matches_documented_example() {
        // appid 2015063000000001, q "apple", salt 1435660288, key 12345678
        let s = sign("2015063000000001", "apple", 1435660288, "12345678");
        assert_eq!(s, "f89f9594663708c1605f3d736d01d2d4");
    }

    #[test]
    fn salt_in_range() {
        for _ in 0..100 {
            let s = salt();
            assert!((32768..65536).contains(&s));
        }
    }

    #[test]
    fn retryable_codes() {
        for code in ["52001", "52002", "54003"] {
            assert!(is_retryable(code));
        }
        for code in ["52003", "54001", "58001", "1"] {
            assert!(!is_retryable(code));
        }
    }

    #[test]
    fn unknown_code_message() {
        assert_eq!(error_message("12345"), "unknown error (code: 12345)");
        assert!(error_message("52003").contains("unauthorized"));
    }

    #[test]
    fn split_prefers_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_text(text, 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
        assert_eq!(chunks.join("\n"), text);
    }

    #[test]
    fn split_force_cuts_overlong_line() {
        let chunks = split_text("abcdefgh\nxy", 3);
        assert_eq!(chunks, vec!["abc", "def", "gh", "xy"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
    }

    #[test]
    fn split_counts_chars_not_bytes() {
        let text = "你好世界";
        assert_eq!(split_text(text, 4), vec!["你好世界"]);
        assert_eq!(split_text(text, 2), vec!["你好", "世界"]);
    }

    #[test]
    fn split_keeps_blank_line_at_chunk_boundary() {
        let text = "aaaa\n\nbbbb";
        let chunks = split_text(text, 4);
        assert_eq!(chunks, vec!["aaaa", "", "bbbb"]);
        assert_eq!(chunks.join("\n"), text);

        let wide = split_text(text, 10);
        assert_eq!(wide, vec!["aaaa\n\nbbbb"]);
    }

    #[test]
    fn split_empty_text() {
        assert!(split_text("", MAX_CHUNK_CHARS).is_empty());
        assert!(split_text("  \n ", MAX_CHUNK_CHARS).is_empty());
    }

    #[test]
    fn reply_parsing() {
        let ok = json!({"from":"zh","to":"en","trans_result":[{"src":"你好","dst":"Hello"},{"src":"世界","dst":"World"}]});
        assert_eq!(parse_reply(&ok).unwrap(), "Hello\nWorld");

        let err = json!({"error_code":"54001","error_msg":"Invalid Sign"});
        match parse_reply(&err).unwrap_err() {
            RelayError::Baidu { code, .. } => assert_eq!(code, "54001"),
            other => panic!("unexpected {other:?}"),
        }

        let numeric = json!({"error_code": 52001});
        assert!(matches!(parse_reply(&numeric), Err(RelayError::Baidu { code, .. }) if code == "52001"));
    }

    #[test]
    fn config_requires_app_id_and_key() {
        let mut p = ProviderConfig::new("baidu", ServiceType::Baidu, "", "secret");
        assert!(matches!(BaiduTranslator::from_config(&p), Err(RelayError::Config(_))));
        p.app_id = Some("2015".into());
        let t = BaiduTranslator::from_config(&p).unwrap();
        assert_eq!(t.endpoint, TRANSLATE_URL);
        assert!(!format!("{t:?}").contains("secret"));
    }
}
