use thiserror::Error;

/// Longest provider error text carried into a user-facing message.
pub const MAX_ERROR_CHARS: usize = 500;

/// Classification of a transport-level failure (no HTTP status was received).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Body,
    Request,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Body => "body",
            Self::Request => "request",
        }
    }

    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect
        } else if err.is_body() || err.is_decode() {
            Self::Body
        } else {
            Self::Request
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Missing key/model, unknown service: detected before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{provider} {} error: {message}", kind.as_str())]
    Transport {
        provider: String,
        kind: TransportKind,
        message: String,
    },

    #[error("HTTP {status} from {provider}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("API returned content is empty ({provider})")]
    EmptyContent { provider: String },

    #[error("baidu translate error {code}: {message}")]
    Baidu { code: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            kind: TransportKind::classify(err),
            message: err.to_string(),
        }
    }

    pub fn timeout(provider: &str, what: &str) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            kind: TransportKind::Timeout,
            message: what.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Only HTTP 400 walks the downgrade ladder. Auth, quota and outage
    /// statuses cannot be fixed by stripping parameters.
    pub fn should_degrade(&self) -> bool {
        self.status() == Some(400)
    }

    /// Message shown to the caller. Combines the static status table with
    /// whatever detail the provider put in its error body.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => msg.clone(),
            Self::Transport {
                provider,
                kind,
                message,
            } => {
                let label = match kind {
                    TransportKind::Timeout => "request timed out",
                    TransportKind::Connect => "connection failed",
                    TransportKind::Body => "failed to read response",
                    TransportKind::Request => "request failed",
                };
                format!("{provider}: {label} ({}): {}", kind.as_str(), truncate(message, MAX_ERROR_CHARS))
            }
            Self::Http {
                provider,
                status,
                message,
            } => {
                let base = status_message(*status);
                if message.trim().is_empty() {
                    format!("{provider}: HTTP {status} {base}")
                } else {
                    format!("{provider}: HTTP {status} {base}: {message}")
                }
            }
            Self::EmptyContent { provider } => {
                format!("{provider}: API returned content is empty")
            }
            Self::Baidu { code, message } => format!("{message} (code: {code})"),
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}

/// Static status-code table used when formatting HTTP failures.
pub fn status_message(status: u16) -> &'static str {
    match status {
        400 => "bad request (a parameter may be unsupported)",
        401 => "unauthorized, check the API key",
        403 => "forbidden, the key has no access to this model",
        404 => "endpoint or model not found",
        408 => "request timeout",
        413 => "request too large",
        429 => "rate limited or quota exhausted",
        500 => "provider internal error",
        502 => "bad gateway",
        503 => "service unavailable",
        504 => "gateway timeout",
        s if s >= 500 => "provider server error",
        _ => "unexpected status",
    }
}

/// Pull a readable message out of an error body. Tries the common
/// `{"error": {"message"}}`, `{"error": "..."}` and `{"message"}` shapes
/// before falling back to the raw (truncated) text.
pub fn parse_error_body(body: &[u8]) -> String {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) {
        let candidate = v["error"]["message"]
            .as_str()
            .or_else(|| v["error"].as_str())
            .or_else(|| v["message"].as_str())
            .or_else(|| v["detail"].as_str())
            .or_else(|| v["error_msg"].as_str());
        if let Some(msg) = candidate {
            return truncate(msg, MAX_ERROR_CHARS);
        }
    }
    truncate(String::from_utf8_lossy(body).trim(), MAX_ERROR_CHARS)
}

/// Truncate on a char boundary, marking the cut with `...`.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}...")
}
