/// Endpoint suffixes that mark a base URL as already complete.
const KNOWN_SUFFIXES: &[&str] = &["/chat/completions", "/v1/messages", "/completions"];

const CHAT_COMPLETIONS: &str = "/chat/completions";

/// Turn a stored base URL into the final request endpoint.
///
/// - `...#` forces the URL verbatim (the `#` and trailing `/` are stripped).
/// - A URL that already carries a known endpoint suffix is used as-is.
/// - Anything else gets `/chat/completions` appended.
pub fn resolve(raw_base_url: &str) -> String {
    let raw = raw_base_url.trim();

    if let Some(forced) = raw.strip_suffix('#') {
        return forced.trim_end_matches('/').to_string();
    }

    let base = raw.trim_end_matches('/');
    if KNOWN_SUFFIXES.iter().any(|s| base.contains(s)) {
        return base.to_string();
    }

    format!("{base}{CHAT_COMPLETIONS}")
}

/// Host part of an Ollama base URL: drops a trailing `/v1` (the OpenAI shim
/// prefix) and any `/api` suffix so native endpoints can be appended.
pub fn ollama_host(raw_base_url: &str) -> String {
    let mut host = raw_base_url.trim().trim_end_matches('#').trim_end_matches('/');
    for suffix in [CHAT_COMPLETIONS, "/v1", "/api"] {
        if let Some(stripped) = host.strip_suffix(suffix) {
            host = stripped.trim_end_matches('/');
        }
    }
    host.to_string()
}

/// Ollama's OpenAI-compatible endpoint for text-only requests.
pub fn ollama_openai_url(raw_base_url: &str) -> String {
    format!("{}/v1{CHAT_COMPLETIONS}", ollama_host(raw_base_url))
}
