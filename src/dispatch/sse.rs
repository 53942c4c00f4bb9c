//! Chunk parsing for OpenAI-style streaming responses.
//!
//! Providers disagree on where incremental text lives. Each field is tried
//! through an explicit, ordered list of extractors; the first hit wins.

use serde_json::Value;

/// One piece of information pulled out of a stream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChunk {
    ContentDelta(String),
    ReasoningDelta(String),
    /// The chunk was not valid JSON. Skipped, never fatal.
    Unparseable,
}

type Extractor = fn(&Value) -> Option<String>;

fn str_at(v: &Value, outer: &str, inner: &str) -> Option<String> {
    v.get(outer)?.get(inner)?.as_str().map(str::to_string)
}

fn parts_text(v: &Value) -> Option<String> {
    let parts = v.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| {
            p.get("text")
                .and_then(Value::as_str)
                .or_else(|| p.as_str())
        })
        .collect();
    Some(text)
}

fn delta_content(c: &Value) -> Option<String> {
    str_at(c, "delta", "content")
}

fn delta_text(c: &Value) -> Option<String> {
    str_at(c, "delta", "text")
}

fn message_content(c: &Value) -> Option<String> {
    str_at(c, "message", "content")
}

fn choice_text(c: &Value) -> Option<String> {
    c.get("text")?.as_str().map(str::to_string)
}

fn content_parts(c: &Value) -> Option<String> {
    c.get("delta")
        .and_then(|d| d.get("content"))
        .and_then(parts_text)
        .or_else(|| c.get("message").and_then(|m| m.get("content")).and_then(parts_text))
}

/// Content extractors, highest priority first.
const CONTENT_EXTRACTORS: &[Extractor] = &[
    delta_content,
    delta_text,
    message_content,
    choice_text,
    content_parts,
];

/// Reasoning extractors, highest priority first.
const REASONING_EXTRACTORS: &[Extractor] = &[
    |c| str_at(c, "delta", "reasoning_content"),
    |c| str_at(c, "delta", "reasoning"),
    |c| str_at(c, "delta", "thinking"),
    |c| str_at(c, "message", "reasoning_content"),
    |c| str_at(c, "message", "reasoning"),
    |c| str_at(c, "message", "thinking"),
];

fn first_hit(extractors: &[Extractor], choice: &Value) -> Option<String> {
    extractors
        .iter()
        .find_map(|extract| extract(choice))
        .filter(|s| !s.is_empty())
}

/// The objects extractors run against: every entry of `choices`, or the
/// chunk itself when it has no `choices` array.
fn choices(chunk: &Value) -> Vec<&Value> {
    match chunk.get("choices").and_then(Value::as_array) {
        Some(arr) => arr.iter().collect(),
        None => vec![chunk],
    }
}

fn extract(chunk: &Value) -> Vec<ParsedChunk> {
    let mut out = Vec::new();
    for choice in choices(chunk) {
        if let Some(reasoning) = first_hit(REASONING_EXTRACTORS, choice) {
            out.push(ParsedChunk::ReasoningDelta(reasoning));
        }
        if let Some(content) = first_hit(CONTENT_EXTRACTORS, choice) {
            out.push(ParsedChunk::ContentDelta(content));
        }
    }
    out
}

/// Parse the payload of one `data:` line. Keep-alive and role-only chunks
/// produce an empty list.
pub fn parse_chunk(data: &str) -> Vec<ParsedChunk> {
    match serde_json::from_str::<Value>(data) {
        Ok(v) => extract(&v),
        Err(_) => vec![ParsedChunk::Unparseable],
    }
}

/// One line of an SSE event's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Data(&'a str),
    Done,
}

/// Split the data of one event into frames. Gateways that end each `data:`
/// line with a single newline arrive as one event carrying several JSON
/// lines; every line is parsed on its own. Blank lines are dropped.
pub fn frames(data: &str) -> impl Iterator<Item = Frame<'_>> {
    data.lines().filter_map(|line| {
        let line = line.trim();
        let line = line.strip_prefix("data:").map_or(line, str::trim);
        match line {
            "" => None,
            DONE => Some(Frame::Done),
            json => Some(Frame::Data(json)),
        }
    })
}

pub const DONE: &str = "[DONE]";

/// Accumulates content and reasoning separately across chunks.
#[derive(Debug, Default)]
pub struct Aggregator {
    pub content: String,
    pub reasoning: String,
}

impl Aggregator {
    pub fn push(&mut self, chunk: &ParsedChunk) {
        match chunk {
            ParsedChunk::ContentDelta(text) => self.content.push_str(text),
            ParsedChunk::ReasoningDelta(text) => self.reasoning.push_str(text),
            ParsedChunk::Unparseable => {}
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// Final text: accumulated reasoning (if any) wrapped in `<think>` and
    /// placed before the plain content.
    pub fn finish(self) -> String {
        with_reasoning(&self.content, &self.reasoning)
    }
}

pub fn with_reasoning(content: &str, reasoning: &str) -> String {
    if reasoning.trim().is_empty() {
        content.to_string()
    } else {
        format!("<think>{}</think>\n\n{}", reasoning.trim(), content)
    }
}

/// Parse a non-streamed completion body (provider ignored `stream: true`).
pub fn parse_completion(body: &[u8]) -> Option<Aggregator> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let mut agg = Aggregator::default();
    for chunk in extract(&v) {
        agg.push(&chunk);
    }
    Some(agg)
}
