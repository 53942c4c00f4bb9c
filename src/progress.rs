//! Per-attempt progress reporting.
//!
//! A reporter walks `Waiting → Generating → {Done, Error, Cancelled}` and
//! reports each transition once. The executor creates a fresh reporter for
//! every downgrade attempt.

use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Waiting,
    Generating { chars: usize },
    Done { chars: usize, elapsed_ms: u64 },
    Error { message: String },
    Cancelled { reason: String },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Generating { .. } => "generating",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. } | Self::Cancelled { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub request_id: String,
    pub provider: String,
    /// Downgrade level of the attempt this reporter belongs to.
    pub attempt: u8,
    pub phase: Phase,
}

/// Receives phase transitions.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Default sink: structured tracing events.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        let request_id = event.request_id.as_str();
        let provider = event.provider.as_str();
        let attempt = event.attempt;
        match &event.phase {
            Phase::Waiting => {
                tracing::debug!(request_id, provider, attempt, "waiting for response");
            }
            Phase::Generating { chars } => {
                tracing::debug!(request_id, provider, attempt, chars, "generating");
            }
            Phase::Done { chars, elapsed_ms } => {
                tracing::info!(request_id, provider, attempt, chars, elapsed_ms, "generation done");
            }
            Phase::Error { message } => {
                tracing::warn!(request_id, provider, attempt, "generation failed: {message}");
            }
            Phase::Cancelled { reason } => {
                tracing::info!(request_id, provider, attempt, reason = reason.as_str(), "generation cancelled");
            }
        }
    }
}

struct State {
    phase: Phase,
    chars: usize,
    bytes: usize,
}

pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    request_id: String,
    provider: String,
    attempt: u8,
    started: Instant,
    state: Mutex<State>,
}

impl ProgressReporter {
    /// Create a reporter and report `Waiting`.
    pub fn start(sink: Arc<dyn ProgressSink>, request_id: &str, provider: &str, attempt: u8) -> Self {
        let reporter = Self {
            sink,
            request_id: request_id.to_string(),
            provider: provider.to_string(),
            attempt,
            started: Instant::now(),
            state: Mutex::new(State {
                phase: Phase::Waiting,
                chars: 0,
                bytes: 0,
            }),
        };
        reporter.report(Phase::Waiting);
        reporter
    }

    /// Account for a content increment. The first one reports `Generating`.
    pub fn on_increment(&self, text: &str) {
        let first = {
            let mut state = self.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.chars += text.chars().count();
            state.bytes += text.len();
            let first = state.phase == Phase::Waiting;
            if first {
                state.phase = Phase::Generating { chars: state.chars };
            }
            first.then_some(state.chars)
        };
        if let Some(chars) = first {
            self.report(Phase::Generating { chars });
        }
    }

    pub fn done(&self) -> bool {
        let chars = self.chars();
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.finish(Phase::Done { chars, elapsed_ms })
    }

    pub fn error(&self, message: &str) -> bool {
        self.finish(Phase::Error {
            message: message.to_string(),
        })
    }

    pub fn cancelled(&self, reason: &str) -> bool {
        self.finish(Phase::Cancelled {
            reason: reason.to_string(),
        })
    }

    /// Move to a terminal phase. Only the first call reports; later calls
    /// return false.
    fn finish(&self, phase: Phase) -> bool {
        {
            let mut state = self.lock();
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = phase.clone();
        }
        self.report(phase);
        true
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn chars(&self) -> usize {
        self.lock().chars
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    fn report(&self, phase: Phase) {
        self.sink.emit(&ProgressEvent {
            request_id: self.request_id.clone(),
            provider: self.provider.clone(),
            attempt: self.attempt,
            phase,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sink that keeps every event; handy for callers that forward progress
/// elsewhere after the request completes.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Phase names in order, one entry per event.
    pub fn phase_names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.phase.name()).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
