//! Request lifecycle events (prepare / complete / error).
//!
//! A logging contract only: every event carries the request id plus the
//! task-type and source labels; extras are free-form key/value pairs.

use std::fmt::Write as _;

/// Labels attached to every lifecycle event of one request.
#[derive(Debug, Clone, Default)]
pub struct TaskLabels {
    pub request_id: String,
    pub task_type: String,
    pub source: String,
}

fn render_extras(extras: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (k, v) in extras {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{k}={v}");
    }
    out
}

pub fn prepare(labels: &TaskLabels, extras: &[(&str, String)]) {
    tracing::info!(
        target: "promptrelay::telemetry",
        request_id = labels.request_id.as_str(),
        task_type = labels.task_type.as_str(),
        source = labels.source.as_str(),
        extras = render_extras(extras).as_str(),
        "prepare"
    );
}

pub fn complete(labels: &TaskLabels, extras: &[(&str, String)]) {
    tracing::info!(
        target: "promptrelay::telemetry",
        request_id = labels.request_id.as_str(),
        task_type = labels.task_type.as_str(),
        source = labels.source.as_str(),
        extras = render_extras(extras).as_str(),
        "complete"
    );
}

pub fn error(labels: &TaskLabels, message: &str, extras: &[(&str, String)]) {
    tracing::warn!(
        target: "promptrelay::telemetry",
        request_id = labels.request_id.as_str(),
        task_type = labels.task_type.as_str(),
        source = labels.source.as_str(),
        extras = render_extras(extras).as_str(),
        "error: {message}"
    );
}

/// Cancellation is not an error; it is recorded at info.
pub fn cancelled(labels: &TaskLabels) {
    tracing::info!(
        target: "promptrelay::telemetry",
        request_id = labels.request_id.as_str(),
        task_type = labels.task_type.as_str(),
        source = labels.source.as_str(),
        "cancelled"
    );
}
