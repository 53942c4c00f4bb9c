pub mod baidu;
pub mod http;
pub mod ollama;
pub mod registry;
pub mod sse;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelWatch;
use crate::error::RelayError;
use crate::telemetry::TaskLabels;

/// Receives each content increment, in arrival order, before the final
/// result is produced. Never called after `execute` returns.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call context supplied by the caller.
#[derive(Clone)]
pub struct RequestContext {
    /// Caller-supplied correlation id; also the key for out-of-band cancel.
    pub request_id: String,
    /// Cooperative cancellation sources the caller controls.
    pub cancel: CancelWatch,
    pub task_type: String,
    pub source: String,
    /// Persist every attempt's request/response to the debug log.
    pub debug_mode: bool,
    pub stream_callback: Option<StreamCallback>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancelWatch::new(),
            task_type: "chat".to_string(),
            source: "api".to_string(),
            debug_mode: false,
            stream_callback: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = self.cancel.with_token(token);
        self
    }

    pub fn with_task(mut self, task_type: &str, source: &str) -> Self {
        self.task_type = task_type.to_string();
        self.source = source.to_string();
        self
    }

    pub fn with_debug(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn with_stream_callback(mut self, callback: StreamCallback) -> Self {
        self.stream_callback = Some(callback);
        self
    }

    pub fn labels(&self) -> TaskLabels {
        TaskLabels {
            request_id: self.request_id.clone(),
            task_type: self.task_type.clone(),
            source: self.source.clone(),
        }
    }
}

/// Outcome of one logical request.
#[derive(Debug, Clone)]
pub enum RequestResult {
    Success { content: String },
    Failed { error: RelayError },
    /// Cooperative cancellation. Not an error and never retried.
    Interrupted,
}

/// What a caller raises after unwrapping a `RequestResult`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("request interrupted")]
    Interrupted,
    #[error("{0}")]
    Failed(String),
}

impl RequestResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self::Success {
            content: content.into(),
        }
    }

    pub fn failed(error: RelayError) -> Self {
        Self::Failed { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Success { content } => Some(content),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RelayError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error().map(RelayError::user_message)
    }

    /// `{success, content}` / `{success: false, error, interrupted}` shape.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Success { content } => serde_json::json!({
                "success": true,
                "content": content,
            }),
            Self::Failed { error } => serde_json::json!({
                "success": false,
                "error": error.user_message(),
            }),
            Self::Interrupted => serde_json::json!({
                "success": false,
                "error": "interrupted",
                "interrupted": true,
            }),
        }
    }

    /// Unwrap for a caller: interruption stays distinguishable from failure,
    /// and failures are prefixed with the provider's display name unless the
    /// message already carries it.
    pub fn into_content(self, provider_name: &str) -> Result<String, CallError> {
        match self {
            Self::Success { content } => Ok(content),
            Self::Interrupted => Err(CallError::Interrupted),
            Self::Failed { error } => {
                let message = error.user_message();
                if message.starts_with(provider_name) {
                    Err(CallError::Failed(message))
                } else {
                    Err(CallError::Failed(format!("{provider_name}: {message}")))
                }
            }
        }
    }
}
