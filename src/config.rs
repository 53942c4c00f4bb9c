use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Env var naming the config file. Falls back to `./promptrelay.toml`.
pub const CONFIG_ENV: &str = "PROMPTRELAY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "promptrelay.toml";

/// Wire payload keys a `custom_params` overlay may never replace.
pub const RESERVED_PARAM_KEYS: &[&str] = &["model", "messages", "stream"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ServiceType {
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "baidu")]
    Baidu,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiCompatible => "openai_compatible",
            Self::Ollama => "ollama",
            Self::Baidu => "baidu",
        }
    }
}

/// Which model list a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Llm,
    Vlm,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Vlm => "vlm",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens() -> u64 {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_true")]
    pub send_temperature: bool,
    #[serde(default = "default_true")]
    pub send_top_p: bool,
    #[serde(default = "default_true")]
    pub send_max_tokens: bool,
    #[serde(default)]
    pub custom_params: Map<String, Value>,
}

impl ModelEntry {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_default: false,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            send_temperature: true,
            send_top_p: true,
            send_max_tokens: true,
            custom_params: Map::new(),
        }
    }
}

/// One configured backend instance.
#[derive(Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    /// Stored in plaintext; only display paths mask it.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub disable_thinking: bool,
    #[serde(default)]
    pub enable_advanced_params: bool,
    #[serde(default)]
    pub filter_thinking_output: bool,
    #[serde(default)]
    pub custom_params: Map<String, Value>,
    #[serde(default)]
    pub llm_models: Vec<ModelEntry>,
    #[serde(default)]
    pub vlm_models: Vec<ModelEntry>,
    /// Ollama: unload the model (`keep_alive: 0`) after a successful request.
    #[serde(default)]
    pub auto_unload: bool,
    /// Ollama native endpoints: forwarded as `keep_alive` when set.
    #[serde(default)]
    pub keep_alive: Option<String>,
    /// Baidu translate app id. The secret key lives in `api_key`.
    #[serde(default)]
    pub app_id: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("type", &self.service_type)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.masked_api_key())
            .field("disable_thinking", &self.disable_thinking)
            .field("enable_advanced_params", &self.enable_advanced_params)
            .field("filter_thinking_output", &self.filter_thinking_output)
            .field("llm_models", &self.llm_models.len())
            .field("vlm_models", &self.vlm_models.len())
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(id: &str, service_type: ServiceType, base_url: &str, api_key: &str) -> Self {
        Self {
            id: id.to_string(),
            service_type,
            name: id.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            disable_thinking: false,
            enable_advanced_params: false,
            filter_thinking_output: false,
            custom_params: Map::new(),
            llm_models: Vec::new(),
            vlm_models: Vec::new(),
            auto_unload: false,
            keep_alive: None,
            app_id: None,
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// `sk-a****wxyz` style mask for display. Short keys are fully masked.
    pub fn masked_api_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.is_empty() {
            return String::new();
        }
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    }

    pub fn models(&self, kind: ModelKind) -> &[ModelEntry] {
        match kind {
            ModelKind::Llm => &self.llm_models,
            ModelKind::Vlm => &self.vlm_models,
        }
    }

    fn models_mut(&mut self, kind: ModelKind) -> &mut Vec<ModelEntry> {
        match kind {
            ModelKind::Llm => &mut self.llm_models,
            ModelKind::Vlm => &mut self.vlm_models,
        }
    }

    /// Model flagged `is_default`, or the first one when none is.
    pub fn default_model(&self, kind: ModelKind) -> Option<&ModelEntry> {
        let models = self.models(kind);
        models.iter().find(|m| m.is_default).or_else(|| models.first())
    }

    /// Exact name lookup, falling back to a case-insensitive match.
    pub fn find_model(&self, kind: ModelKind, name: &str) -> Option<&ModelEntry> {
        let models = self.models(kind);
        models
            .iter()
            .find(|m| m.name == name)
            .or_else(|| models.iter().find(|m| m.name.eq_ignore_ascii_case(name)))
    }

    /// Enforce "exactly one default per non-empty list": keeps the first
    /// flagged entry, or promotes the first model when none is flagged.
    pub fn normalize_defaults(&mut self) {
        for kind in [ModelKind::Llm, ModelKind::Vlm] {
            normalize_list(self.models_mut(kind));
        }
    }

    /// Remove a model. Removing the default promotes the first remaining one.
    pub fn remove_model(&mut self, kind: ModelKind, name: &str) -> bool {
        let models = self.models_mut(kind);
        let before = models.len();
        models.retain(|m| m.name != name);
        let removed = models.len() != before;
        if removed {
            normalize_list(models);
        }
        removed
    }

    /// Merged `custom_params`: provider overlay first, model overlay wins.
    /// Reserved keys are dropped.
    pub fn merged_custom_params(&self, model: &ModelEntry) -> Map<String, Value> {
        let mut merged = Map::new();
        for (k, v) in self.custom_params.iter().chain(model.custom_params.iter()) {
            if RESERVED_PARAM_KEYS.contains(&k.as_str()) {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

fn normalize_list(models: &mut [ModelEntry]) {
    let mut seen_default = false;
    for m in models.iter_mut() {
        if m.is_default {
            if seen_default {
                m.is_default = false;
            }
            seen_default = true;
        }
    }
    if !seen_default && let Some(first) = models.first_mut() {
        first.is_default = true;
    }
}

/// Process-wide settings from the config file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    /// Persist every attempt's request/response for post-mortem diagnosis.
    #[serde(default)]
    pub debug_mode: bool,
    /// Directory for debug logs. Defaults to `.promptrelay/debug`.
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub services: Vec<ProviderConfig>,
}

impl Config {
    /// Load from `$PROMPTRELAY_CONFIG` or `./promptrelay.toml`.
    /// A missing or invalid file yields an empty config (logged).
    pub fn load() -> Self {
        let path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        match Self::from_path(&path) {
            Ok(config) => {
                tracing::info!(
                    path = %path.display(),
                    services = config.services.len(),
                    "config loaded"
                );
                config
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "config unavailable: {e}");
                Self::default()
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RelayError> {
        let mut config: Config = toml::from_str(text)
            .map_err(|e| RelayError::Config(format!("invalid config: {e}")))?;

        let mut ids = std::collections::HashSet::new();
        for service in &config.services {
            if !ids.insert(service.id.clone()) {
                return Err(RelayError::Config(format!(
                    "duplicate service id: {}",
                    service.id
                )));
            }
        }

        for service in &mut config.services {
            service.api_key = resolve_env_ref(&service.api_key);
            if let Some(app_id) = service.app_id.as_mut() {
                *app_id = resolve_env_ref(app_id);
            }
            service.normalize_defaults();
        }
        Ok(config)
    }

    pub fn service(&self, service_id: &str) -> Option<&ProviderConfig> {
        self.services.iter().find(|s| s.id == service_id)
    }
}

/// `${NAME}` resolves to the env var `NAME` (empty when unset).
/// Anything else is returned unchanged.
fn resolve_env_ref(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(name) => env::var(name).unwrap_or_else(|_| {
            tracing::warn!(var = name, "api key env var not set");
            String::new()
        }),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
debug_mode = true

[[services]]
id = "siliconflow"
type = "openai_compatible"
name = "SiliconFlow"
base_url = "https://api.siliconflow.cn/v1"
api_key = "sk-abcdefghijklmnop"
disable_thinking = true

[services.custom_params]
model = "hijack"
seed = 42

[[services.llm_models]]
name = "Qwen/Qwen3-8B"
temperature = 0.3
send_top_p = false

[[services.llm_models]]
name = "deepseek-ai/DeepSeek-V3.1"
is_default = true

[[services]]
id = "baidu"
type = "baidu"
app_id = "2025"
api_key = "secret"
"#;

    #[test]
    fn parses_services_and_models() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert!(config.settings.debug_mode);
        assert_eq!(config.services.len(), 2);

        let sf = config.service("siliconflow").unwrap();
        assert_eq!(sf.service_type, ServiceType::OpenAiCompatible);
        assert_eq!(sf.llm_models.len(), 2);
        assert!(!sf.llm_models[0].send_top_p);
        assert!(sf.llm_models[0].send_temperature);
        assert_eq!(
            sf.default_model(ModelKind::Llm).unwrap().name,
            "deepseek-ai/DeepSeek-V3.1"
        );
        assert!(sf.default_model(ModelKind::Vlm).is_none());

        let baidu = config.service("baidu").unwrap();
        assert_eq!(baidu.service_type, ServiceType::Baidu);
        assert_eq!(baidu.app_id.as_deref(), Some("2025"));
    }

    #[test]
    fn custom_params_drop_reserved_keys_and_model_wins() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let sf = config.service("siliconflow").unwrap();
        let mut model = sf.llm_models[0].clone();
        model.custom_params.insert("seed".into(), Value::from(7));
        model.custom_params.insert("stream".into(), Value::Bool(false));

        let merged = sf.merged_custom_params(&model);
        assert_eq!(merged["seed"], Value::from(7));
        assert!(!merged.contains_key("model"));
        assert!(!merged.contains_key("stream"));
    }

    #[test]
    fn default_invariant_holds_after_load_and_remove() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        let sf = &mut config.services[0];
        let defaults = sf.llm_models.iter().filter(|m| m.is_default).count();
        assert_eq!(defaults, 1);

        assert!(sf.remove_model(ModelKind::Llm, "deepseek-ai/DeepSeek-V3.1"));
        assert!(sf.llm_models[0].is_default, "first remaining model is promoted");
        assert!(!sf.remove_model(ModelKind::Llm, "missing"));
    }

    #[test]
    fn first_model_promoted_when_none_flagged() {
        let mut p = ProviderConfig::new("x", ServiceType::Ollama, "http://localhost:11434", "");
        p.vlm_models = vec![ModelEntry::named("llava"), ModelEntry::named("qwen2.5vl")];
        p.vlm_models[1].is_default = true;
        p.vlm_models[0].is_default = true;
        p.normalize_defaults();
        assert!(p.vlm_models[0].is_default);
        assert!(!p.vlm_models[1].is_default);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let text = r#"
[[services]]
id = "a"
type = "ollama"
[[services]]
id = "a"
type = "baidu"
"#;
        assert!(matches!(Config::from_toml_str(text), Err(RelayError::Config(_))));
    }

    #[test]
    fn api_key_is_masked_for_display_only() {
        let p = ProviderConfig::new("x", ServiceType::OpenAiCompatible, "https://x", "sk-abcdefghijklmnop");
        assert_eq!(p.masked_api_key(), "sk-a****mnop");
        assert_eq!(p.api_key, "sk-abcdefghijklmnop");
        assert!(!format!("{p:?}").contains("abcdefghijklmnop"));
    }

    #[test]
    fn find_model_is_case_insensitive_fallback() {
        let mut p = ProviderConfig::new("x", ServiceType::OpenAiCompatible, "https://x", "k");
        p.llm_models = vec![ModelEntry::named("Qwen/Qwen3-8B")];
        assert!(p.find_model(ModelKind::Llm, "qwen/qwen3-8b").is_some());
        assert!(p.find_model(ModelKind::Vlm, "Qwen/Qwen3-8B").is_none());
    }
}
