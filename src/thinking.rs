//! Provider/model rule tables that switch chain-of-thought off.
//!
//! Rules are allow-lists: a model that matches nothing gets no extra fields.
//! Some models only "think" as part of their required output, and sending a
//! suppression field they don't understand is a common cause of HTTP 400.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::config::ServiceType;

/// Rule-table family a service belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Zhipu,
    SiliconFlow,
    Gemini,
    Ollama,
    /// DashScope, DeepSeek, aggregators and custom OpenAI-compatible gateways.
    Gateway,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zhipu => "zhipu",
            Self::SiliconFlow => "siliconflow",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Gateway => "gateway",
        }
    }

    /// Classify a provider id by keyword.
    pub fn from_id(provider_id: &str) -> Self {
        let id = provider_id.to_lowercase();
        if id.contains("zhipu") || id.contains("bigmodel") || id == "zai" {
            Self::Zhipu
        } else if id.contains("siliconflow") {
            Self::SiliconFlow
        } else if id.contains("gemini") || id.contains("google") {
            Self::Gemini
        } else if id.contains("ollama") {
            Self::Ollama
        } else {
            Self::Gateway
        }
    }

    /// Resolve the family for a configured service. The id wins; services with
    /// a generic id are recognised by their base URL host.
    pub fn detect(service_id: &str, service_type: ServiceType, base_url: &str) -> Self {
        if service_type == ServiceType::Ollama {
            return Self::Ollama;
        }
        let by_id = Self::from_id(service_id);
        if by_id != Self::Gateway {
            return by_id;
        }
        let url = base_url.to_lowercase();
        if url.contains("bigmodel.cn") || url.contains("z.ai") {
            Self::Zhipu
        } else if url.contains("siliconflow") {
            Self::SiliconFlow
        } else if url.contains("generativelanguage.googleapis.com") {
            Self::Gemini
        } else if url.contains(":11434") {
            Self::Ollama
        } else {
            Self::Gateway
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Suppression {
    /// `thinking: {type: "disabled"}` (Zhipu).
    ThinkingDisabled,
    /// `enable_thinking: false` (SiliconFlow, DashScope, gateways).
    EnableThinkingFalse,
    /// `reasoning_effort: "none"` (Gemini OpenAI endpoint).
    ReasoningEffortNone,
    /// `think: false` (Ollama).
    ThinkFalse,
    /// Model matched but cannot disable reasoning: send nothing.
    Never,
}

impl Suppression {
    fn fields(self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::ThinkingDisabled => {
                map.insert("thinking".into(), json!({"type": "disabled"}));
            }
            Self::EnableThinkingFalse => {
                map.insert("enable_thinking".into(), Value::Bool(false));
            }
            Self::ReasoningEffortNone => {
                map.insert("reasoning_effort".into(), json!("none"));
            }
            Self::ThinkFalse => {
                map.insert("think".into(), Value::Bool(false));
            }
            Self::Never => {}
        }
        map
    }
}

struct Rule {
    matches: Regex,
    exclude: Option<Regex>,
    action: Suppression,
}

impl Rule {
    fn new(pattern: &str, exclude: Option<&str>, action: Suppression) -> Self {
        // Patterns are literals in this file; a bad one is a programming error.
        let compile = |p: &str| Regex::new(&format!("(?i){p}")).expect("valid rule pattern");
        Self {
            matches: compile(pattern),
            exclude: exclude.map(compile),
            action,
        }
    }

    fn apply(&self, model: &str) -> Option<Suppression> {
        if !self.matches.is_match(model) {
            return None;
        }
        if self.exclude.as_ref().is_some_and(|ex| ex.is_match(model)) {
            return None;
        }
        Some(self.action)
    }
}

static ZHIPU_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![Rule::new(r"glm-4\.5", None, Suppression::ThinkingDisabled)]
});

static SILICONFLOW_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let thinking = Some("thinking");
    vec![
        Rule::new(r"qwen3", thinking, Suppression::EnableThinkingFalse),
        Rule::new(r"deepseek-v3\.1", thinking, Suppression::EnableThinkingFalse),
        Rule::new(r"hunyuan", thinking, Suppression::EnableThinkingFalse),
        Rule::new(r"glm-4\.5v", thinking, Suppression::EnableThinkingFalse),
    ]
});

static GEMINI_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // Checked first: 2.5 Pro rejects any attempt to turn reasoning off.
        Rule::new(r"gemini-2\.5-pro", None, Suppression::Never),
        Rule::new(r"gemini-2\.5-flash", None, Suppression::ReasoningEffortNone),
    ]
});

static OLLAMA_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(r"qwen3", None, Suppression::ThinkFalse),
        Rule::new(r"deepseek-r1", None, Suppression::ThinkFalse),
        Rule::new(r"thinking", None, Suppression::ThinkFalse),
    ]
});

static GATEWAY_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let thinking = Some("thinking");
    vec![
        Rule::new(r"qwen3", thinking, Suppression::EnableThinkingFalse),
        Rule::new(r"qwen-(plus|flash|turbo)", thinking, Suppression::EnableThinkingFalse),
        Rule::new(r"deepseek-v3\.[12]", thinking, Suppression::EnableThinkingFalse),
    ]
});

fn rules_for(family: ProviderFamily) -> &'static [Rule] {
    match family {
        ProviderFamily::Zhipu => &ZHIPU_RULES,
        ProviderFamily::SiliconFlow => &SILICONFLOW_RULES,
        ProviderFamily::Gemini => &GEMINI_RULES,
        ProviderFamily::Ollama => &OLLAMA_RULES,
        ProviderFamily::Gateway => &GATEWAY_RULES,
    }
}

/// Extra request fields that disable reasoning for `model_name` on
/// `provider_id`. First matching rule wins; no match returns an empty map.
pub fn build_thinking_suppression(provider_id: &str, model_name: &str) -> Map<String, Value> {
    suppression_for_family(ProviderFamily::from_id(provider_id), model_name)
}

pub fn suppression_for_family(family: ProviderFamily, model_name: &str) -> Map<String, Value> {
    rules_for(family)
        .iter()
        .find_map(|rule| rule.apply(model_name))
        .map(Suppression::fields)
        .unwrap_or_default()
}
