use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelRequest {
    /// The `request_id` given to `enhance`, `caption` or `translate`.
    pub request_id: String,
}
