//! Extraction of JSON objects and narrative text from raw generator output.
//!
//! Models wrap JSON in code fences, prepend chatter, or answer in plain
//! prose. Everything here is a pure function over the raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use celia_shared::{CeliaError, Result};

/// Longest raw excerpt kept in the lenient fallback wrapper.
const RAW_CONTENT_LIMIT: usize = 1000;

/// Keys searched, in order, for narrative text inside a JSON answer.
const NARRATIVE_KEYS: &[&str] = &[
    "narrativa",
    "narrative_output",
    "narrative",
    "text",
    "content",
    "redaccion",
];

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```[a-z]*").expect("valid regex"));

/// Remove code fence markers (with or without a language tag).
fn strip_fences(raw: &str) -> String {
    FENCE_RE.replace_all(raw, "").trim().to_string()
}

/// The span from the first `{` to the last `}`, if both exist in that order.
fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_value(raw: &str) -> Result<Value> {
    let cleaned = strip_fences(raw);
    if cleaned.is_empty() {
        return Err(CeliaError::parse("generator output is empty"));
    }
    let span = object_span(&cleaned).unwrap_or(&cleaned);
    serde_json::from_str(span).map_err(|e| CeliaError::parse(format!("invalid JSON: {e}")))
}

/// Extract a JSON object from raw output, failing on anything else.
pub fn extract_json(raw: &str) -> Result<Map<String, Value>> {
    match parse_value(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(CeliaError::parse(format!(
            "expected a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

/// Extract a JSON object without failing.
///
/// On a parse failure the result is `{raw_content, parse_error}` plus the
/// error message. A valid non-object value is wrapped as `{raw_content}`.
pub fn extract_json_lenient(raw: &str) -> (Map<String, Value>, Option<String>) {
    match parse_value(raw) {
        Ok(Value::Object(map)) => (map, None),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("raw_content".into(), other);
            (map, None)
        }
        Err(e) => {
            let message = e.to_string();
            let mut map = Map::new();
            map.insert(
                "raw_content".into(),
                Value::String(raw.chars().take(RAW_CONTENT_LIMIT).collect()),
            );
            map.insert("parse_error".into(), Value::String(message.clone()));
            (map, Some(message))
        }
    }
}

/// Pull the narrative text out of a JSON answer.
///
/// Falls back to the pretty-printed object when no known key holds a string.
pub fn extract_narrative_text(object: &Map<String, Value>) -> String {
    NARRATIVE_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|| format!("{:#}", Value::Object(object.clone())))
}

/// Narrative text from raw output, whether the model answered in JSON or prose.
pub fn narrative_from_output(raw: &str) -> String {
    let cleaned = strip_fences(raw);
    if cleaned.starts_with('{') {
        if let Ok(object) = extract_json(&cleaned) {
            return extract_narrative_text(&object);
        }
    }
    cleaned
}

/// Truncate to at most `max_chars` characters, cutting at the last space
/// before the limit, and append `suffix` when anything was removed.
pub fn truncate_text(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    let cut = match head.rfind(' ') {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head.as_str(),
    };
    format!("{}{suffix}", cut.trim_end())
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
