//! Ollama native endpoints.
//!
//! Text goes through the OpenAI shim like every other service. Images do
//! not: the shim drops them for several vision models, so image-bearing
//! requests use `/api/chat` with raw base64 images and fall back to
//! `/api/generate` on servers that lack a usable chat endpoint.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Map, Value, json};

use crate::config::{ModelEntry, ProviderConfig};
use crate::error::{MAX_ERROR_CHARS, RelayError, parse_error_body, truncate};
use crate::payload::{ChatMessage, Role, Sampling, merge_system_messages};
use crate::thinking::{ProviderFamily, suppression_for_family};

/// Timeout for the best-effort unload call.
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a native call failed, which decides whether to try the next endpoint.
#[derive(Debug)]
pub enum NativeError {
    /// The endpoint does not exist on this server (404/405/501).
    Unsupported(RelayError),
    /// The server answered but the body was unusable.
    Protocol(RelayError),
    /// Connection, timeout, or an HTTP status that another endpoint won't fix.
    Transport(RelayError),
}

impl NativeError {
    pub fn into_inner(self) -> RelayError {
        match self {
            Self::Unsupported(e) | Self::Protocol(e) | Self::Transport(e) => e,
        }
    }

    fn allows_fallback(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::Protocol(_))
    }
}

/// Reply from a native endpoint.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NativeReply {
    pub content: String,
    pub reasoning: String,
}

/// Strip a `data:<mime>;base64,` prefix. Ollama wants bare base64.
pub fn raw_base64(image: &str) -> &str {
    match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    }
}

/// Everything both native endpoints need, derived once from the service.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub host: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub think: Option<bool>,
    pub options: Map<String, Value>,
    pub keep_alive: Option<String>,
}

impl NativeRequest {
    pub fn for_service(provider: &ProviderConfig, model: &ModelEntry, messages: &[ChatMessage]) -> Self {
        let think = if provider.disable_thinking {
            suppression_for_family(ProviderFamily::Ollama, &model.name)
                .get("think")
                .and_then(Value::as_bool)
        } else {
            None
        };

        let sampling = Sampling::for_model(model, provider.enable_advanced_params);
        let mut options = Map::new();
        if let Some(t) = sampling.temperature {
            options.insert("temperature".into(), Value::from(t));
        }
        if let Some(p) = sampling.top_p {
            options.insert("top_p".into(), Value::from(p));
        }
        if let Some(m) = sampling.max_tokens {
            options.insert("num_predict".into(), Value::from(m));
        }

        Self {
            host: crate::url::ollama_host(&provider.base_url),
            model: model.name.clone(),
            messages: merge_system_messages(messages),
            think,
            options,
            keep_alive: provider.keep_alive.clone(),
        }
    }

    fn common_fields(&self, body: &mut Map<String, Value>) {
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert("stream".into(), Value::Bool(false));
        if let Some(think) = self.think {
            body.insert("think".into(), Value::Bool(think));
        }
        if !self.options.is_empty() {
            body.insert("options".into(), Value::Object(self.options.clone()));
        }
        if let Some(keep_alive) = &self.keep_alive {
            body.insert("keep_alive".into(), Value::String(keep_alive.clone()));
        }
    }

    pub fn chat_body(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|m| {
                let mut entry = json!({
                    "role": role_name(m.role),
                    "content": m.content.text(),
                });
                let images: Vec<&str> = m.content.image_urls().into_iter().map(raw_base64).collect();
                if !images.is_empty() {
                    entry["images"] = json!(images);
                }
                entry
            })
            .collect();

        let mut body = Map::new();
        self.common_fields(&mut body);
        body.insert("messages".into(), Value::Array(messages));
        Value::Object(body)
    }

    /// `/api/generate` has no message list: the system text becomes `system`
    /// and the remaining turns are flattened into `prompt`.
    pub fn generate_body(&self) -> Value {
        let mut system = None;
        let mut prompt = Vec::new();
        let mut images = Vec::new();
        for m in &self.messages {
            match m.role {
                Role::System => system = Some(m.content.text()),
                Role::User | Role::Assistant => {
                    let text = m.content.text();
                    if !text.trim().is_empty() {
                        prompt.push(text);
                    }
                    images.extend(m.content.image_urls().into_iter().map(raw_base64));
                }
            }
        }

        let mut body = Map::new();
        self.common_fields(&mut body);
        body.insert("prompt".into(), Value::String(prompt.join("\n\n")));
        if let Some(system) = system {
            body.insert("system".into(), Value::String(system));
        }
        if !images.is_empty() {
            body.insert("images".into(), json!(images));
        }
        Value::Object(body)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

async fn post_native(
    client: &Client,
    url: &str,
    body: &Value,
    provider: &str,
    read_timeout: Duration,
) -> Result<Value, NativeError> {
    let response = client
        .post(url)
        .timeout(read_timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| NativeError::Transport(RelayError::transport(provider, &e)))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| NativeError::Transport(RelayError::transport(provider, &e)))?;

    if !status.is_success() {
        let err = RelayError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: parse_error_body(&bytes),
        };
        return Err(match status.as_u16() {
            404 | 405 | 501 => NativeError::Unsupported(err),
            _ => NativeError::Transport(err),
        });
    }

    serde_json::from_slice(&bytes).map_err(|e| {
        let preview = truncate(&String::from_utf8_lossy(&bytes), MAX_ERROR_CHARS);
        NativeError::Protocol(RelayError::SchemaParse(format!("{e}: {preview}")))
    })
}

/// `POST /api/chat` (non-streaming).
pub async fn chat(
    client: &Client,
    req: &NativeRequest,
    provider: &str,
    read_timeout: Duration,
) -> Result<NativeReply, NativeError> {
    let url = format!("{}/api/chat", req.host);
    let v = post_native(client, &url, &req.chat_body(), provider, read_timeout).await?;
    let message = v.get("message").ok_or_else(|| {
        NativeError::Protocol(RelayError::SchemaParse("/api/chat reply has no message".into()))
    })?;
    Ok(NativeReply {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        reasoning: message["thinking"].as_str().unwrap_or_default().to_string(),
    })
}

/// `POST /api/generate` (non-streaming).
pub async fn generate(
    client: &Client,
    req: &NativeRequest,
    provider: &str,
    read_timeout: Duration,
) -> Result<NativeReply, NativeError> {
    let url = format!("{}/api/generate", req.host);
    let v = post_native(client, &url, &req.generate_body(), provider, read_timeout).await?;
    let content = v.get("response").and_then(Value::as_str).ok_or_else(|| {
        NativeError::Protocol(RelayError::SchemaParse("/api/generate reply has no response".into()))
    })?;
    Ok(NativeReply {
        content: content.to_string(),
        reasoning: v["thinking"].as_str().unwrap_or_default().to_string(),
    })
}

/// Native chat, falling back to generate when chat is missing or its reply
/// is unusable. Transport failures are returned without a second attempt.
pub async fn complete(
    client: &Client,
    req: &NativeRequest,
    provider: &str,
    read_timeout: Duration,
) -> Result<NativeReply, RelayError> {
    match chat(client, req, provider, read_timeout).await {
        Ok(reply) => Ok(reply),
        Err(err) if err.allows_fallback() => {
            let err = err.into_inner();
            tracing::warn!(
                provider,
                model = req.model.as_str(),
                "/api/chat unusable, falling back to /api/generate: {}",
                err.user_message()
            );
            generate(client, req, provider, read_timeout)
                .await
                .map_err(NativeError::into_inner)
        }
        Err(err) => Err(err.into_inner()),
    }
}

/// Ask the server to evict `model` from memory (`keep_alive: 0`).
pub async fn unload(client: &Client, host: &str, model: &str, provider: &str) -> Result<(), RelayError> {
    let url = format!("{host}/api/generate");
    let body = json!({ "model": model, "keep_alive": 0 });
    let response = client
        .post(&url)
        .timeout(UNLOAD_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::transport(provider, &e))?;
    let status = response.status();
    if status.is_success() {
        tracing::debug!(provider, model, "model unloaded");
        Ok(())
    } else {
        let bytes = response.bytes().await.unwrap_or_default();
        Err(RelayError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: parse_error_body(&bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    fn service() -> ProviderConfig {
        let mut p = ProviderConfig::new("ollama", ServiceType::Ollama, "http://localhost:11434/v1", "");
        p.disable_thinking = true;
        p.keep_alive = Some("5m".into());
        p
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        assert_eq!(raw_base64("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(raw_base64("AAAA"), "AAAA");
    }

    #[test]
    fn chat_body_carries_raw_images_and_think() {
        let model = ModelEntry::named("qwen3-vl:8b");
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user_with_images("describe", vec!["data:image/jpeg;base64,QUJD".into()]),
        ];
        let req = NativeRequest::for_service(&service(), &model, &messages);
        assert_eq!(req.host, "http://localhost:11434");

        let body = req.chat_body();
        assert_eq!(body["stream"], false);
        assert_eq!(body["think"], false);
        assert_eq!(body["keep_alive"], "5m");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "describe");
        assert_eq!(body["messages"][1]["images"][0], "QUJD");
        assert!(body.get("options").is_none(), "advanced params disabled");
    }

    #[test]
    fn generate_body_flattens_messages() {
        let model = ModelEntry::named("llava");
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user_with_images("what is this", vec!["QUJD".into()]),
        ];
        let req = NativeRequest::for_service(&service(), &model, &messages);
        let body = req.generate_body();
        assert_eq!(body["system"], "sys");
        assert_eq!(body["prompt"], "what is this");
        assert_eq!(body["images"][0], "QUJD");
        assert!(body.get("think").is_none(), "llava matches no think rule");
    }

    #[test]
    fn advanced_params_become_options() {
        let mut p = service();
        p.enable_advanced_params = true;
        let mut model = ModelEntry::named("llava");
        model.send_top_p = false;
        let req = NativeRequest::for_service(&p, &model, &[ChatMessage::user("hi")]);
        let body = req.chat_body();
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 1024);
        assert!(body["options"].get("top_p").is_none());
    }
}
