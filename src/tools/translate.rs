use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TranslateRequest {
    /// Service id from `listservices`: a baidu service, or any LLM service.
    pub service: String,
    /// LLM model name (ignored by baidu services).
    pub model: Option<String>,
    /// Text to translate. Long text is split on line boundaries.
    pub text: String,
    /// Source language code ("zh", "en", ...). Defaults to "auto".
    pub from: Option<String>,
    /// Target language code. Defaults to "en".
    pub to: Option<String>,
    /// Caller-chosen id; pass the same id to `cancel` to stop this request.
    pub request_id: Option<String>,
}

impl TranslateRequest {
    pub fn from_or_default(&self) -> &str {
        self.from.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("auto")
    }

    pub fn to_or_default(&self) -> &str {
        self.to.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("en")
    }
}
