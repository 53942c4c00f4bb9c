use std::sync::Arc;

use serde::Serialize;

use crate::cancel::{CancelRegistry, InterruptFlag, Raced, race};
use crate::config::{Config, ModelEntry, ModelKind, ProviderConfig, ServiceType};
use crate::debug_log::DEFAULT_DEBUG_DIR;
use crate::dispatch::baidu::BaiduTranslator;
use crate::dispatch::http::{ExecutorOptions, StreamingExecutor};
use crate::dispatch::{RequestContext, RequestResult};
use crate::error::RelayError;
use crate::payload::{ChatMessage, strip_thinking_blocks};
use crate::progress::{ProgressReporter, ProgressSink, TracingSink};
use crate::telemetry;

/// A chat request against a configured service.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub service_id: String,
    /// Model name; the list default when `None`.
    pub model: Option<String>,
    pub kind: ModelKind,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct TranslateRequest {
    pub service_id: String,
    pub model: Option<String>,
    pub text: String,
    /// Source language code, or `auto`.
    pub from: String,
    pub to: String,
}

/// Display view of a configured service. The key is masked.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub base_url: String,
    pub api_key: String,
    pub llm_models: Vec<String>,
    pub vlm_models: Vec<String>,
    pub default_llm: Option<String>,
    pub default_vlm: Option<String>,
}

impl ServiceSummary {
    fn from_config(p: &ProviderConfig) -> Self {
        let names = |kind| p.models(kind).iter().map(|m| m.name.clone()).collect();
        Self {
            id: p.id.clone(),
            name: p.display_name().to_string(),
            service_type: p.service_type,
            base_url: p.base_url.clone(),
            api_key: p.masked_api_key(),
            llm_models: names(ModelKind::Llm),
            vlm_models: names(ModelKind::Vlm),
            default_llm: p.default_model(ModelKind::Llm).map(|m| m.name.clone()),
            default_vlm: p.default_model(ModelKind::Vlm).map(|m| m.name.clone()),
        }
    }
}

pub struct Registry {
    config: Config,
    executor: StreamingExecutor,
    interrupt: InterruptFlag,
    cancels: CancelRegistry,
    sink: Arc<dyn ProgressSink>,
}

impl Registry {
    pub fn from_config(config: Config) -> Self {
        Self::with_interrupt(config, InterruptFlag::new())
    }

    /// Build a registry that watches an existing host interrupt flag.
    pub fn with_interrupt(config: Config, interrupt: InterruptFlag) -> Self {
        let options = ExecutorOptions {
            debug_dir: config
                .settings
                .debug_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_DEBUG_DIR.into()),
            ..ExecutorOptions::default()
        };
        let sink: Arc<dyn ProgressSink> = Arc::new(TracingSink);
        Self {
            executor: StreamingExecutor::new(interrupt.clone())
                .with_options(options)
                .with_sink(sink.clone()),
            config,
            interrupt,
            cancels: CancelRegistry::new(),
            sink,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.executor = self.executor.with_sink(sink.clone());
        self.sink = sink;
        self
    }

    pub fn with_executor_options(mut self, options: ExecutorOptions) -> Self {
        self.executor = self.executor.with_options(options);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn service(&self, service_id: &str) -> Result<&ProviderConfig, RelayError> {
        self.config.service(service_id).ok_or_else(|| {
            let known: Vec<&str> = self.config.services.iter().map(|s| s.id.as_str()).collect();
            RelayError::Config(format!(
                "unknown service '{service_id}' (configured: {})",
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            ))
        })
    }

    pub fn list_services(&self) -> Vec<ServiceSummary> {
        self.config.services.iter().map(ServiceSummary::from_config).collect()
    }

    /// Cancel one in-flight request by id. False when the id is unknown
    /// (never registered, or already finished).
    pub fn cancel(&self, request_id: &str) -> bool {
        let found = self.cancels.cancel(request_id);
        tracing::info!(request_id, found, "cancel requested");
        found
    }

    pub fn cancel_all(&self) -> usize {
        self.cancels.cancel_all()
    }

    /// Number of requests currently accepting out-of-band cancellation.
    pub fn in_flight(&self) -> usize {
        self.cancels.len()
    }

    fn resolve_model(
        provider: &ProviderConfig,
        kind: ModelKind,
        requested: Option<&str>,
    ) -> Result<ModelEntry, RelayError> {
        let found = match requested.map(str::trim).filter(|m| !m.is_empty()) {
            Some(name) => provider.find_model(kind, name),
            None => provider.default_model(kind),
        };
        found.cloned().ok_or_else(|| {
            let available: Vec<&str> = provider.models(kind).iter().map(|m| m.name.as_str()).collect();
            let wanted = requested.unwrap_or("a default model");
            RelayError::Config(format!(
                "{}: no {} model '{wanted}' (available: {})",
                provider.display_name(),
                kind.as_str(),
                if available.is_empty() { "none".to_string() } else { available.join(", ") }
            ))
        })
    }

    /// Run a chat request. Configuration problems fail before any network
    /// call; the request id is cancellable via `cancel` while it runs.
    pub async fn chat(&self, req: &ChatRequest, ctx: RequestContext) -> RequestResult {
        let resolved = self
            .service(&req.service_id)
            .and_then(|p| Ok((p, Self::resolve_model(p, req.kind, req.model.as_deref())?)));
        let (provider, model) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                telemetry::error(&ctx.labels(), &err.user_message(), &[]);
                return RequestResult::failed(err);
            }
        };

        let registration = self.cancels.register(&ctx.request_id);
        let debug = ctx.debug_mode || self.config.settings.debug_mode;
        let ctx = ctx.with_cancel_token(registration.token()).with_debug(debug);

        let result = self.executor.execute(provider, &model, &req.messages, &ctx).await;
        drop(registration);

        match result {
            RequestResult::Success { content } if provider.filter_thinking_output => {
                RequestResult::success(strip_thinking_blocks(&content))
            }
            other => other,
        }
    }

    /// Translate through a Baidu service, or through an LLM service with a
    /// translation prompt.
    pub async fn translate(&self, req: &TranslateRequest, ctx: RequestContext) -> RequestResult {
        if req.text.trim().is_empty() {
            return RequestResult::failed(RelayError::Config("nothing to translate".to_string()));
        }
        let provider = match self.service(&req.service_id) {
            Ok(p) => p,
            Err(err) => return RequestResult::failed(err),
        };

        if provider.service_type != ServiceType::Baidu {
            let chat = ChatRequest {
                service_id: req.service_id.clone(),
                model: req.model.clone(),
                kind: ModelKind::Llm,
                messages: translation_messages(&req.text, &req.from, &req.to),
            };
            return self.chat(&chat, ctx).await;
        }

        let translator = match BaiduTranslator::from_config(provider) {
            Ok(t) => t,
            Err(err) => {
                telemetry::error(&ctx.labels(), &err.user_message(), &[]);
                return RequestResult::failed(err);
            }
        };
        self.translate_baidu(translator, req, ctx).await
    }

    async fn translate_baidu(
        &self,
        translator: BaiduTranslator,
        req: &TranslateRequest,
        ctx: RequestContext,
    ) -> RequestResult {
        let registration = self.cancels.register(&ctx.request_id);
        let ctx = ctx.with_cancel_token(registration.token());
        let labels = ctx.labels();
        let watch = ctx.cancel.clone().with(Arc::new(self.interrupt.clone()));

        if watch.is_cancelled() {
            telemetry::cancelled(&labels);
            return RequestResult::Interrupted;
        }

        telemetry::prepare(
            &labels,
            &[
                ("service", req.service_id.clone()),
                ("from", req.from.clone()),
                ("to", req.to.clone()),
            ],
        );
        let reporter = ProgressReporter::start(self.sink.clone(), &ctx.request_id, "baidu", 0);

        let (text, from, to) = (req.text.clone(), req.from.clone(), req.to.clone());
        let job = async move { translator.translate(&text, &from, &to).await };

        match race(job, &watch).await {
            Ok(Raced::Completed(Ok(translated))) => {
                reporter.on_increment(&translated);
                reporter.done();
                telemetry::complete(&labels, &[("chars", translated.chars().count().to_string())]);
                RequestResult::success(translated)
            }
            Ok(Raced::Cancelled) => {
                reporter.cancelled("interrupted");
                telemetry::cancelled(&labels);
                RequestResult::Interrupted
            }
            Ok(Raced::Completed(Err(err))) | Err(err) => {
                reporter.error(&err.user_message());
                telemetry::error(&labels, &err.user_message(), &[]);
                RequestResult::failed(err)
            }
        }
    }
}

fn language_name(code: &str) -> &str {
    match code.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" => "Chinese",
        "en" => "English",
        "ja" | "jp" => "Japanese",
        "ko" | "kor" => "Korean",
        "fr" | "fra" => "French",
        "de" => "German",
        "es" | "spa" => "Spanish",
        "ru" => "Russian",
        _ => code,
    }
}

fn translation_messages(text: &str, from: &str, to: &str) -> Vec<ChatMessage> {
    let source = if from.eq_ignore_ascii_case("auto") {
        "the source language".to_string()
    } else {
        language_name(from).to_string()
    };
    vec![
        ChatMessage::system(format!(
            "You are a professional translator. Translate the user's text from {source} into {}. \
             Keep the line structure. Output only the translation.",
            language_name(to)
        )),
        ChatMessage::user(text),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from_toml_str(
            r#"
            [[services]]
            id = "siliconflow"
            type = "openai_compatible"
            base_url = "https://api.siliconflow.cn/v1"
            api_key = "sk-abcdefghijklmnop"

            [[services.llm_models]]
            name = "Qwen/Qwen3-8B"

            [[services.llm_models]]
            name = "deepseek-ai/DeepSeek-V3.1"
            is_default = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_default_and_named_models() {
        let registry = Registry::from_config(config());
        let p = registry.service("siliconflow").unwrap();
        let default = Registry::resolve_model(p, ModelKind::Llm, None).unwrap();
        assert_eq!(default.name, "deepseek-ai/DeepSeek-V3.1");
        let named = Registry::resolve_model(p, ModelKind::Llm, Some("qwen/qwen3-8b")).unwrap();
        assert_eq!(named.name, "Qwen/Qwen3-8B");
    }

    #[test]
    fn missing_vlm_list_is_config_error() {
        let registry = Registry::from_config(config());
        let p = registry.service("siliconflow").unwrap();
        let err = Registry::resolve_model(p, ModelKind::Vlm, None).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn unknown_service_lists_known_ids() {
        let registry = Registry::from_config(config());
        let err = registry.service("nope").unwrap_err();
        assert!(err.user_message().contains("siliconflow"));
    }

    #[test]
    fn summaries_mask_keys() {
        let registry = Registry::from_config(config());
        let list = registry.list_services();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].api_key, "sk-a****mnop");
        assert_eq!(list[0].default_llm.as_deref(), Some("deepseek-ai/DeepSeek-V3.1"));
    }

    #[test]
    fn translation_prompt_names_languages() {
        let msgs = translation_messages("你好", "auto", "en");
        assert!(msgs[0].content.text().contains("into English"));
        assert!(msgs[0].content.text().contains("the source language"));
        assert_eq!(msgs[1].content.text(), "你好");
    }

    #[tokio::test]
    async fn unknown_service_fails_without_registration() {
        let registry = Registry::from_config(config());
        let req = ChatRequest {
            service_id: "missing".into(),
            model: None,
            kind: ModelKind::Llm,
            messages: vec![ChatMessage::user("hi")],
        };
        let result = registry.chat(&req, RequestContext::new("r1")).await;
        assert!(matches!(result, RequestResult::Failed { error: RelayError::Config(_) }));
        assert_eq!(registry.in_flight(), 0);
    }
}
