use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

use crate::dispatch::RequestResult;

/// JSON envelope every tool returns as its single text content.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    /// `success`, `error` or `interrupted`.
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub service_used: String,
    pub model_used: String,
    pub request_id: String,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

impl ToolResponse {
    pub fn success(content: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    pub fn error(message: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    pub fn interrupted(metadata: ToolMetadata) -> Self {
        Self {
            status: "interrupted",
            content: "request interrupted".to_string(),
            content_type: "text",
            metadata,
        }
    }

    pub fn from_result(result: RequestResult, metadata: ToolMetadata) -> Self {
        match result {
            RequestResult::Success { content } => Self::success(content, metadata),
            RequestResult::Failed { error } => Self::error(error.user_message(), metadata),
            RequestResult::Interrupted => Self::interrupted(metadata),
        }
    }

    /// Convert to MCP CallToolResult. Failures stay in the JSON payload
    /// (`"status": "error"`) rather than the MCP error channel, so a failed
    /// provider call never aborts sibling tool calls.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                CallToolResult::success(vec![Content::text(format!(
                    r#"{{"status":"error","content":"serialization failed: {escaped}","content_type":"text","metadata":{{}}}}"#
                ))])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn meta() -> ToolMetadata {
        ToolMetadata {
            tool_name: "enhance".into(),
            service_used: "siliconflow".into(),
            model_used: "Qwen/Qwen3-8B".into(),
            request_id: "r1".into(),
            duration_seconds: f64::NAN,
        }
    }

    #[test]
    fn maps_each_result_kind() {
        assert_eq!(ToolResponse::from_result(RequestResult::success("x"), meta()).status, "success");
        assert_eq!(ToolResponse::from_result(RequestResult::Interrupted, meta()).status, "interrupted");
        let failed = ToolResponse::from_result(
            RequestResult::failed(RelayError::Config("no key".into())),
            meta(),
        );
        assert_eq!(failed.status, "error");
        assert_eq!(failed.content, "no key");
    }

    #[test]
    fn non_finite_duration_serializes_as_zero() {
        let json = serde_json::to_value(ToolResponse::success("ok".into(), meta())).unwrap();
        assert_eq!(json["metadata"]["duration_seconds"], 0.0);
    }
}
