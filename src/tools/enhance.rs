use schemars::JsonSchema;
use serde::Deserialize;

pub const DEFAULT_ENHANCE_PROMPT: &str = "You are a prompt engineer for image and video generation. \
Rewrite the user's prompt into a single vivid, detailed prompt covering subject, setting, lighting, \
composition and style. Output only the rewritten prompt.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnhanceRequest {
    /// Service id from `listservices`.
    pub service: String,
    /// LLM model name. Defaults to the service's default LLM.
    pub model: Option<String>,
    /// The prompt to enhance.
    pub prompt: String,
    /// Replaces the built-in prompt-engineering instructions.
    pub system_prompt: Option<String>,
    /// Caller-chosen id; pass the same id to `cancel` to stop this request.
    pub request_id: Option<String>,
}

impl EnhanceRequest {
    pub fn system_prompt_or_default(&self) -> &str {
        self.system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_ENHANCE_PROMPT)
    }
}
