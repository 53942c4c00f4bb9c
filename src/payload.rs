//! Request body construction and the downgrade filter.
//!
//! Payloads are plain JSON maps because `custom_params` and provider
//! thinking fields are open-ended. Filtering never mutates its input.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ModelEntry, ProviderConfig, RESERVED_PARAM_KEYS};

pub type Payload = Map<String, Value>;

/// Keys removed at level 1.
pub const THINKING_KEYS: &[&str] = &[
    "thinking",
    "enable_thinking",
    "reasoning_effort",
    "reasoning",
    "thinking_level",
    "think",
];

/// Keys kept at level 2.
pub const MINIMAL_KEYS: &[&str] = &["model", "messages", "stream"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// User message carrying text plus one image per URL (data URLs allowed).
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(
            image_urls
                .into_iter()
                .map(|url| ContentPart::ImageUrl { image_url: ImageUrl { url } }),
        );
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

pub fn has_images(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| !m.content.image_urls().is_empty())
}

/// Merge all system messages into one leading system message, joined by a
/// blank line. Other messages keep their relative order.
pub fn merge_system_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let system_texts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.text())
        .filter(|t| !t.trim().is_empty())
        .collect();

    let mut merged = Vec::with_capacity(messages.len());
    if !system_texts.is_empty() {
        merged.push(ChatMessage::system(system_texts.join("\n\n")));
    }
    merged.extend(messages.iter().filter(|m| m.role != Role::System).cloned());
    merged
}

/// Sampling parameters with their per-parameter send flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Sampling {
    /// Parameters that will actually be transmitted. Nothing is sent unless
    /// advanced params are enabled; a cleared send flag omits the key.
    pub fn for_model(model: &ModelEntry, enable_advanced_params: bool) -> Self {
        if !enable_advanced_params {
            return Self::none();
        }
        Self {
            temperature: model.send_temperature.then_some(model.temperature),
            top_p: model.send_top_p.then_some(model.top_p),
            max_tokens: model.send_max_tokens.then_some(model.max_tokens),
        }
    }

    pub fn none() -> Self {
        Self {
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

/// Inputs for a level-0 payload.
pub struct PayloadSpec<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub sampling: Sampling,
    pub thinking: Map<String, Value>,
    pub custom_params: Map<String, Value>,
}

impl<'a> PayloadSpec<'a> {
    /// Assemble payload inputs for a configured service/model pair. Thinking
    /// fields are supplied by the caller (already gated on `disable_thinking`).
    pub fn for_service(
        provider: &ProviderConfig,
        model: &'a ModelEntry,
        messages: &'a [ChatMessage],
        thinking: Map<String, Value>,
    ) -> Self {
        Self {
            model: &model.name,
            messages,
            sampling: Sampling::for_model(model, provider.enable_advanced_params),
            thinking,
            custom_params: provider.merged_custom_params(model),
        }
    }
}

/// Build the full (level 0) streaming request body.
pub fn build_payload(spec: &PayloadSpec<'_>) -> Payload {
    let mut body = Payload::new();
    body.insert("model".into(), Value::String(spec.model.to_string()));
    let messages = merge_system_messages(spec.messages);
    body.insert(
        "messages".into(),
        serde_json::to_value(&messages).unwrap_or(Value::Array(Vec::new())),
    );
    body.insert("stream".into(), Value::Bool(true));

    if let Some(t) = spec.sampling.temperature {
        body.insert("temperature".into(), Value::from(t));
    }
    if let Some(p) = spec.sampling.top_p {
        body.insert("top_p".into(), Value::from(p));
    }
    if let Some(m) = spec.sampling.max_tokens {
        body.insert("max_tokens".into(), Value::from(m));
    }

    for (k, v) in &spec.thinking {
        body.insert(k.clone(), v.clone());
    }
    for (k, v) in &spec.custom_params {
        if RESERVED_PARAM_KEYS.contains(&k.as_str()) {
            continue;
        }
        body.insert(k.clone(), v.clone());
    }
    body
}

/// Position on the downgrade ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DegradationLevel {
    /// Everything the builder produced.
    Full,
    /// Thinking/reasoning keys removed.
    NoThinking,
    /// Only `model`, `messages`, `stream`.
    Minimal,
}

impl DegradationLevel {
    pub fn index(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::NoThinking => 1,
            Self::Minimal => 2,
        }
    }

    /// The next rung, or `None` at the bottom of the ladder.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::NoThinking),
            Self::NoThinking => Some(Self::Minimal),
            Self::Minimal => None,
        }
    }
}

/// New payload with the keys `level` strips removed.
pub fn filter(payload: &Payload, level: DegradationLevel) -> Payload {
    payload
        .iter()
        .filter(|(k, _)| keeps(k, level))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Keys present in `payload` that `level` removes.
pub fn removed_keys(payload: &Payload, level: DegradationLevel) -> Vec<String> {
    payload
        .keys()
        .filter(|k| !keeps(k, level))
        .cloned()
        .collect()
}

fn keeps(key: &str, level: DegradationLevel) -> bool {
    match level {
        DegradationLevel::Full => true,
        DegradationLevel::NoThinking => !THINKING_KEYS.contains(&key),
        DegradationLevel::Minimal => MINIMAL_KEYS.contains(&key),
    }
}

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").expect("valid think-block pattern")
});

/// Remove `<think>…</think>` blocks (and `<thinking>` variants) from model
/// output, trimming what is left.
pub fn strip_thinking_blocks(text: &str) -> String {
    let stripped = THINK_BLOCK.replace_all(text, "");
    // An unterminated block swallows the rest of the output.
    let stripped = match stripped.find("<think>") {
        Some(idx) => &stripped[..idx],
        None => stripped.as_ref(),
    };
    stripped.trim().to_string()
}
