use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ModelKind};
use crate::dispatch;
use crate::dispatch::registry::{self, ChatRequest, Registry};
use crate::payload::ChatMessage;
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::caption::{CaptionRequest, MAX_IMAGES};
use crate::tools::control::CancelRequest;
use crate::tools::enhance::EnhanceRequest;
use crate::tools::services::ListServicesResponse;
use crate::tools::translate::TranslateRequest;

/// How long `interrupt` keeps the host flag raised. Longer than the
/// cancellation poll interval so every in-flight request observes it.
const INTERRUPT_HOLD: Duration = Duration::from_millis(500);

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Caller-supplied request id, or `<tool>-<millis>-<pid>-<seq>`.
fn request_id_or_generate(given: Option<&str>, tool: &str) -> String {
    if let Some(id) = given.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{tool}-{ts}-{}-{seq}", std::process::id())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), McpError> {
    if value.trim().is_empty() {
        return Err(McpError::invalid_params(format!("{field} must not be empty"), None));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RelayServer {
    registry: Arc<Registry>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self::with_registry(Registry::from_config(config))
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            tool_router: Self::tool_router(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn run_chat(&self, tool: &str, request_id: String, chat: ChatRequest, ct: CancellationToken) -> CallToolResult {
        let start = Instant::now();
        let ctx = dispatch::RequestContext::new(request_id.clone())
            .with_cancel_token(ct)
            .with_task(tool, "mcp");
        let result = self.registry.chat(&chat, ctx).await;
        if let Some(err) = result.error() {
            tracing::warn!(request_id = request_id.as_str(), "{tool} failed: {}", err.user_message());
        }
        let metadata = ToolMetadata {
            tool_name: tool.to_string(),
            service_used: chat.service_id,
            model_used: chat.model.unwrap_or_else(|| "default".to_string()),
            request_id,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        ToolResponse::from_result(result, metadata).into_call_tool_result()
    }

    #[tool(
        name = "enhance",
        description = "Rewrite a short image/video prompt into a detailed one using an LLM service. Use `listservices` for service ids.",
        annotations(read_only_hint = true)
    )]
    async fn enhance(
        &self,
        Parameters(req): Parameters<EnhanceRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&req.service, "service")?;
        require_non_empty(&req.prompt, "prompt")?;

        let request_id = request_id_or_generate(req.request_id.as_deref(), "enhance");
        let chat = ChatRequest {
            service_id: req.service.clone(),
            model: req.model.clone(),
            kind: ModelKind::Llm,
            messages: vec![
                ChatMessage::system(req.system_prompt_or_default()),
                ChatMessage::user(req.prompt.clone()),
            ],
        };
        Ok(self.run_chat("enhance", request_id, chat, context.ct).await)
    }

    #[tool(
        name = "caption",
        description = "Describe one or more images as a generation prompt using a vision (VLM) service. Images are data URLs or http(s) URLs.",
        annotations(read_only_hint = true)
    )]
    async fn caption(
        &self,
        Parameters(req): Parameters<CaptionRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&req.service, "service")?;
        if req.images.is_empty() {
            return Err(McpError::invalid_params("images must not be empty", None));
        }
        if req.images.len() > MAX_IMAGES {
            return Err(McpError::invalid_params(
                format!("at most {MAX_IMAGES} images per request"),
                None,
            ));
        }
        req.validate_images().map_err(|e| McpError::invalid_params(e, None))?;

        let request_id = request_id_or_generate(req.request_id.as_deref(), "caption");
        let chat = ChatRequest {
            service_id: req.service.clone(),
            model: req.model.clone(),
            kind: ModelKind::Vlm,
            messages: vec![
                ChatMessage::system(req.system_prompt_or_default()),
                ChatMessage::user_with_images(req.user_text(), req.images.clone()),
            ],
        };
        Ok(self.run_chat("caption", request_id, chat, context.ct).await)
    }

    #[tool(
        name = "translate",
        description = "Translate text with a Baidu translation service or an LLM service. Long text is split on line boundaries.",
        annotations(read_only_hint = true)
    )]
    async fn translate(
        &self,
        Parameters(req): Parameters<TranslateRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        require_non_empty(&req.service, "service")?;
        require_non_empty(&req.text, "text")?;

        let start = Instant::now();
        let request_id = request_id_or_generate(req.request_id.as_deref(), "translate");
        let translate = registry::TranslateRequest {
            service_id: req.service.clone(),
            model: req.model.clone(),
            text: req.text.clone(),
            from: req.from_or_default().to_string(),
            to: req.to_or_default().to_string(),
        };
        let ctx = dispatch::RequestContext::new(request_id.clone())
            .with_cancel_token(context.ct)
            .with_task("translate", "mcp");
        let result = self.registry.translate(&translate, ctx).await;
        if let Some(err) = result.error() {
            tracing::warn!(request_id = request_id.as_str(), "translate failed: {}", err.user_message());
        }

        let metadata = ToolMetadata {
            tool_name: "translate".to_string(),
            service_used: req.service,
            model_used: req.model.unwrap_or_else(|| "default".to_string()),
            request_id,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        Ok(ToolResponse::from_result(result, metadata).into_call_tool_result())
    }

    #[tool(
        name = "listservices",
        description = "List configured services with their type and LLM/VLM models. API keys are masked.",
        annotations(read_only_hint = true)
    )]
    async fn listservices(&self) -> Result<CallToolResult, McpError> {
        let list = ListServicesResponse {
            services: self.registry.list_services(),
        };
        let response = ToolResponse::success(
            list.to_markdown(),
            ToolMetadata {
                tool_name: "listservices".to_string(),
                service_used: "none".to_string(),
                model_used: "none".to_string(),
                request_id: String::new(),
                duration_seconds: 0.0,
            },
        );
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "cancel",
        description = "Cancel an in-flight enhance/caption/translate request by its request_id."
    )]
    async fn cancel(&self, Parameters(req): Parameters<CancelRequest>) -> Result<CallToolResult, McpError> {
        require_non_empty(&req.request_id, "request_id")?;
        let found = self.registry.cancel(&req.request_id);
        let content = if found {
            format!("cancellation requested for {}", req.request_id)
        } else {
            format!("no in-flight request with id {}", req.request_id)
        };
        let metadata = ToolMetadata {
            tool_name: "cancel".to_string(),
            service_used: "none".to_string(),
            model_used: "none".to_string(),
            request_id: req.request_id,
            duration_seconds: 0.0,
        };
        let response = if found {
            ToolResponse::success(content, metadata)
        } else {
            ToolResponse::error(content, metadata)
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "interrupt",
        description = "Interrupt every in-flight request (host-wide stop). Requests return status \"interrupted\"."
    )]
    async fn interrupt(&self) -> Result<CallToolResult, McpError> {
        let flag = self.registry.interrupt_flag().clone();
        flag.raise();
        let in_flight = self.registry.cancel_all();
        tracing::info!(in_flight, "interrupt raised");
        tokio::spawn(async move {
            tokio::time::sleep(INTERRUPT_HOLD).await;
            flag.clear();
        });
        let response = ToolResponse::success(
            format!("interrupt raised ({in_flight} request(s) in flight)"),
            ToolMetadata {
                tool_name: "interrupt".to_string(),
                service_used: "none".to_string(),
                model_used: "none".to_string(),
                request_id: String::new(),
                duration_seconds: 0.0,
            },
        );
        Ok(response.into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for RelayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "promptrelay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "PromptRelay: prompt enhancement, image captioning and translation through configured LLM/VLM services.\n\n\
                 1. Call `listservices` for service ids and model names.\n\
                 2. `enhance` rewrites a prompt, `caption` describes images, `translate` translates text.\n\
                 3. Pass a `request_id` to be able to `cancel` a long request; `interrupt` stops everything."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
