//! Streaming executor for OpenAI-compatible chat completions.
//!
//! One logical request walks the downgrade ladder: full payload, then the
//! payload without thinking fields, then only `model`/`messages`/`stream`.
//! Only HTTP 400 advances a rung. Every attempt runs as its own task and is
//! raced against the request's cancellation sources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::cancel::{CancelWatch, InterruptFlag, Raced, race};
use crate::config::{ModelEntry, ProviderConfig, ServiceType};
use crate::debug_log::{DEFAULT_DEBUG_DIR, DebugLog};
use crate::dispatch::ollama::{self, NativeRequest};
use crate::dispatch::sse::{self, Aggregator, Frame, ParsedChunk};
use crate::dispatch::{RequestContext, RequestResult, StreamCallback};
use crate::error::{RelayError, parse_error_body};
use crate::payload::{
    self, ChatMessage, DegradationLevel, Payload, PayloadSpec, build_payload, has_images,
};
use crate::progress::{ProgressReporter, ProgressSink, TracingSink};
use crate::telemetry;
use crate::thinking::{ProviderFamily, suppression_for_family};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest gap allowed between two stream reads.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);
/// Vision models are slow to produce the first token.
pub const VISION_READ_TIMEOUT: Duration = Duration::from_secs(180);

const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub vision_read_timeout: Duration,
    pub debug_dir: PathBuf,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            vision_read_timeout: VISION_READ_TIMEOUT,
            debug_dir: PathBuf::from(DEFAULT_DEBUG_DIR),
        }
    }
}

pub struct StreamingExecutor {
    interrupt: InterruptFlag,
    sink: Arc<dyn ProgressSink>,
    options: ExecutorOptions,
}

impl StreamingExecutor {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self {
            interrupt,
            sink: Arc::new(TracingSink),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    fn build_client(&self) -> Result<Client, RelayError> {
        Client::builder()
            .connect_timeout(self.options.connect_timeout)
            .build()
            .map_err(|e| RelayError::Other(format!("failed to build HTTP client: {e}")))
    }

    /// Run one logical chat request against a configured service.
    pub async fn execute(
        &self,
        provider: &ProviderConfig,
        model: &ModelEntry,
        messages: &[ChatMessage],
        ctx: &RequestContext,
    ) -> RequestResult {
        let labels = ctx.labels();
        let watch = ctx.cancel.clone().with(Arc::new(self.interrupt.clone()));

        if watch.is_cancelled() {
            tracing::info!(request_id = ctx.request_id.as_str(), "interrupted before dispatch");
            telemetry::cancelled(&labels);
            return RequestResult::Interrupted;
        }

        if let Err(err) = validate(provider, model) {
            telemetry::error(&labels, &err.user_message(), &[]);
            return RequestResult::failed(err);
        }

        let client = match self.build_client() {
            Ok(c) => c,
            Err(err) => return RequestResult::failed(err),
        };

        let vision = has_images(messages);
        let read_timeout = if vision {
            self.options.vision_read_timeout
        } else {
            self.options.read_timeout
        };
        let debug = ctx
            .debug_mode
            .then(|| DebugLog::new(&self.options.debug_dir, provider.display_name(), &ctx.request_id));

        telemetry::prepare(
            &labels,
            &[
                ("service", provider.id.clone()),
                ("model", model.name.clone()),
                ("vision", vision.to_string()),
            ],
        );

        let call = Call {
            client: client.clone(),
            provider_name: provider.display_name().to_string(),
            api_key: provider.api_key.clone(),
            read_timeout,
            watch,
            callback: ctx.stream_callback.clone(),
            debug,
        };

        let result = if provider.service_type == ServiceType::Ollama && vision {
            let req = NativeRequest::for_service(provider, model, messages);
            self.run_native(&call, req, &ctx.request_id).await
        } else {
            let family = ProviderFamily::detect(&provider.id, provider.service_type, &provider.base_url);
            let thinking = if provider.disable_thinking {
                suppression_for_family(family, &model.name)
            } else {
                Default::default()
            };
            let spec = PayloadSpec::for_service(provider, model, messages, thinking);
            let url = match provider.service_type {
                ServiceType::Ollama => crate::url::ollama_openai_url(&provider.base_url),
                _ => crate::url::resolve(&provider.base_url),
            };
            self.run_ladder(&call, url, build_payload(&spec), &ctx.request_id).await
        };

        match &result {
            RequestResult::Success { content } => {
                if provider.service_type == ServiceType::Ollama && provider.auto_unload {
                    let host = crate::url::ollama_host(&provider.base_url);
                    if let Err(e) = ollama::unload(&client, &host, &model.name, &call.provider_name).await {
                        tracing::warn!(
                            provider = call.provider_name.as_str(),
                            model = model.name.as_str(),
                            "failed to unload model: {}",
                            e.user_message()
                        );
                    }
                }
                telemetry::complete(&labels, &[("chars", content.chars().count().to_string())]);
            }
            RequestResult::Failed { error } => telemetry::error(&labels, &error.user_message(), &[]),
            RequestResult::Interrupted => telemetry::cancelled(&labels),
        }
        result
    }

    async fn run_ladder(&self, call: &Call, url: String, full: Payload, request_id: &str) -> RequestResult {
        let mut level = DegradationLevel::Full;
        loop {
            let body = payload::filter(&full, level);
            let reporter = Arc::new(ProgressReporter::start(
                self.sink.clone(),
                request_id,
                &call.provider_name,
                level.index(),
            ));

            let attempt = call.clone().stream(url.clone(), body.clone(), level, reporter.clone());
            let outcome = match race(attempt, &call.watch).await {
                Ok(Raced::Completed(outcome)) => outcome,
                Ok(Raced::Cancelled) => Ok(Attempt::Cancelled),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(Attempt::Content(content)) => {
                    reporter.done();
                    return RequestResult::success(content);
                }
                Ok(Attempt::Cancelled) => {
                    reporter.cancelled("interrupted");
                    return RequestResult::Interrupted;
                }
                Err(err) => {
                    if err.should_degrade()
                        && let Some(next) = level.next()
                    {
                        let removed = payload::removed_keys(&body, next);
                        tracing::warn!(
                            provider = call.provider_name.as_str(),
                            request_id,
                            "HTTP 400 at level {}, retrying at level {} without {:?}",
                            level.index(),
                            next.index(),
                            removed
                        );
                        reporter.error(&err.user_message());
                        if let Some(debug) = &call.debug {
                            debug
                                .note(level.index(), &format!("HTTP 400, retrying without {removed:?}"))
                                .await;
                        }
                        level = next;
                        continue;
                    }
                    reporter.error(&err.user_message());
                    return RequestResult::failed(err);
                }
            }
        }
    }

    async fn run_native(&self, call: &Call, req: NativeRequest, request_id: &str) -> RequestResult {
        let reporter = Arc::new(ProgressReporter::start(
            self.sink.clone(),
            request_id,
            &call.provider_name,
            0,
        ));
        let attempt = call.clone().native(req, reporter.clone());
        let outcome = match race(attempt, &call.watch).await {
            Ok(Raced::Completed(outcome)) => outcome,
            Ok(Raced::Cancelled) => Ok(Attempt::Cancelled),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(Attempt::Content(content)) => {
                reporter.done();
                RequestResult::success(content)
            }
            Ok(Attempt::Cancelled) => {
                reporter.cancelled("interrupted");
                RequestResult::Interrupted
            }
            Err(err) => {
                reporter.error(&err.user_message());
                RequestResult::failed(err)
            }
        }
    }
}

fn validate(provider: &ProviderConfig, model: &ModelEntry) -> Result<(), RelayError> {
    if provider.service_type == ServiceType::Baidu {
        return Err(RelayError::Config(format!(
            "{}: translation-only service, it cannot run chat requests",
            provider.display_name()
        )));
    }
    if model.name.trim().is_empty() {
        return Err(RelayError::Config(format!(
            "{}: no model selected",
            provider.display_name()
        )));
    }
    if provider.service_type == ServiceType::OpenAiCompatible && provider.api_key.trim().is_empty() {
        return Err(RelayError::Config(format!(
            "{}: API key is not configured",
            provider.display_name()
        )));
    }
    if provider.base_url.trim().is_empty() {
        return Err(RelayError::Config(format!(
            "{}: base URL is not configured",
            provider.display_name()
        )));
    }
    Ok(())
}

/// How one attempt ended without an error.
enum Attempt {
    Content(String),
    /// A cancellation source fired between two increments.
    Cancelled,
}

/// Per-request state shared by every attempt. Owned so attempts can run as
/// spawned tasks.
#[derive(Clone)]
struct Call {
    client: Client,
    provider_name: String,
    api_key: String,
    read_timeout: Duration,
    watch: CancelWatch,
    callback: Option<StreamCallback>,
    debug: Option<DebugLog>,
}

impl Call {
    /// Forward one increment. Returns false when cancellation was observed,
    /// in which case the increment is dropped.
    fn forward(&self, text: &str, reporter: &ProgressReporter) -> bool {
        if self.watch.is_cancelled() {
            return false;
        }
        reporter.on_increment(text);
        if let Some(cb) = &self.callback {
            cb(text);
        }
        true
    }

    async fn stream(
        self,
        url: String,
        body: Payload,
        level: DegradationLevel,
        reporter: Arc<ProgressReporter>,
    ) -> Result<Attempt, RelayError> {
        let provider = self.provider_name.as_str();
        let attempt = level.index();
        let body = Value::Object(body);

        if let Some(debug) = &self.debug {
            let auth = format!("Bearer {}", self.api_key);
            debug
                .request(
                    attempt,
                    &url,
                    &[("Authorization", auth.as_str()), ("Content-Type", "application/json")],
                    &body,
                )
                .await;
        }

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = match tokio::time::timeout(self.read_timeout, request.send()).await {
            Err(_) => {
                return Err(RelayError::timeout(
                    provider,
                    &format!("no response within {}s", self.read_timeout.as_secs()),
                ));
            }
            Ok(Err(e)) => return Err(RelayError::transport(provider, &e)),
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        if !status.is_success() {
            let bytes = self.read_capped(response, MAX_RESPONSE_BYTES).await?;
            if let Some(debug) = &self.debug {
                debug
                    .response(attempt, Some(status.as_u16()), &String::from_utf8_lossy(&bytes))
                    .await;
            }
            return Err(RelayError::Http {
                provider: provider.to_string(),
                status: status.as_u16(),
                message: parse_error_body(&bytes),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let agg = if is_json {
            self.read_completion(response, attempt, &reporter).await?
        } else {
            self.read_stream(response, attempt, &reporter).await?
        };
        let Some(agg) = agg else {
            return Ok(Attempt::Cancelled);
        };

        if !agg.has_content() {
            return Err(RelayError::EmptyContent {
                provider: provider.to_string(),
            });
        }
        Ok(Attempt::Content(agg.finish()))
    }

    /// Provider ignored `stream: true` and sent one JSON completion.
    /// `None` means cancellation was observed.
    async fn read_completion(
        &self,
        response: reqwest::Response,
        attempt: u8,
        reporter: &ProgressReporter,
    ) -> Result<Option<Aggregator>, RelayError> {
        let provider = self.provider_name.as_str();
        let bytes = match tokio::time::timeout(self.read_timeout, response.bytes()).await {
            Err(_) => return Err(RelayError::timeout(provider, "reading response body")),
            Ok(Err(e)) => return Err(RelayError::transport(provider, &e)),
            Ok(Ok(b)) => b,
        };
        if let Some(debug) = &self.debug {
            debug
                .response(attempt, Some(200), &String::from_utf8_lossy(&bytes))
                .await;
        }
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(RelayError::Other(format!(
                "{provider}: response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                bytes.len()
            )));
        }
        let agg = sse::parse_completion(&bytes).ok_or_else(|| {
            RelayError::SchemaParse(format!("{provider}: response is not valid JSON"))
        })?;
        if !agg.content.is_empty() && !self.forward(&agg.content, reporter) {
            return Ok(None);
        }
        Ok(Some(agg))
    }

    /// Aggregate an SSE stream. `None` means cancellation was observed.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        attempt: u8,
        reporter: &ProgressReporter,
    ) -> Result<Option<Aggregator>, RelayError> {
        let provider = self.provider_name.as_str();
        let mut events = response.bytes_stream().eventsource();
        let mut agg = Aggregator::default();
        let mut raw = self.debug.as_ref().map(|_| String::new());
        let mut received = 0usize;

        'events: loop {
            let event = match tokio::time::timeout(self.read_timeout, events.next()).await {
                Err(_) => {
                    return Err(RelayError::timeout(
                        provider,
                        &format!("no data for {}s", self.read_timeout.as_secs()),
                    ));
                }
                Ok(None) => break,
                Ok(Some(Err(EventStreamError::Transport(e)))) => {
                    return Err(RelayError::transport(provider, &e));
                }
                Ok(Some(Err(e))) => {
                    tracing::debug!(provider, "skipping malformed SSE frame: {e}");
                    continue;
                }
                Ok(Some(Ok(event))) => event,
            };

            let data = event.data.trim();
            if let Some(raw) = raw.as_mut() {
                raw.push_str(data);
                raw.push('\n');
            }
            if data.is_empty() {
                continue;
            }

            received += data.len();
            if received > MAX_RESPONSE_BYTES {
                return Err(RelayError::Other(format!(
                    "{provider}: response too large (max {MAX_RESPONSE_BYTES} bytes)"
                )));
            }

            for frame in sse::frames(data) {
                let json = match frame {
                    Frame::Done => break 'events,
                    Frame::Data(json) => json,
                };
                for chunk in sse::parse_chunk(json) {
                    match &chunk {
                        ParsedChunk::ContentDelta(text) => {
                            if !self.forward(text, reporter) {
                                return Ok(None);
                            }
                        }
                        ParsedChunk::ReasoningDelta(_) => {}
                        ParsedChunk::Unparseable => {
                            tracing::debug!(provider, "skipping unparseable chunk");
                        }
                    }
                    agg.push(&chunk);
                }
            }
        }

        if let (Some(debug), Some(raw)) = (&self.debug, raw) {
            debug.response(attempt, Some(200), &raw).await;
        }
        Ok(Some(agg))
    }

    /// Read at most `cap` bytes of an error body. Read errors end the body
    /// early; a stall longer than the read timeout is a transport error.
    async fn read_capped(&self, response: reqwest::Response, cap: usize) -> Result<Vec<u8>, RelayError> {
        let mut out = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Err(_) => {
                    return Err(RelayError::timeout(
                        &self.provider_name,
                        &format!("error body stalled for {}s", self.read_timeout.as_secs()),
                    ));
                }
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(_)) | None) => break,
            };
            let room = cap.saturating_sub(out.len());
            out.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if out.len() >= cap {
                break;
            }
        }
        Ok(out)
    }

    async fn native(self, req: NativeRequest, reporter: Arc<ProgressReporter>) -> Result<Attempt, RelayError> {
        let provider = self.provider_name.as_str();
        if let Some(debug) = &self.debug {
            debug
                .request(0, &format!("{}/api/chat", req.host), &[], &req.chat_body())
                .await;
        }
        let reply = ollama::complete(&self.client, &req, provider, self.read_timeout).await;
        if let Some(debug) = &self.debug {
            let text = match &reply {
                Ok(r) => r.content.clone(),
                Err(e) => e.user_message(),
            };
            debug.response(0, None, &text).await;
        }
        let reply = reply?;
        if reply.content.trim().is_empty() {
            return Err(RelayError::EmptyContent {
                provider: provider.to_string(),
            });
        }
        if !self.forward(&reply.content, &reporter) {
            return Ok(Attempt::Cancelled);
        }
        Ok(Attempt::Content(sse::with_reasoning(&reply.content, &reply.reasoning)))
    }
}
