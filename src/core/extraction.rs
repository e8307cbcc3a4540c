//! Pulls the evaluable text out of a raw gateway payload.

use serde_json::Value;
use thiserror::Error;

use crate::core::rules::{Encoding, ExtractionSpec};

#[derive(Error, Debug, PartialEq)]
pub enum ExtractionError {
    #[error("invalid JSON path '{path}': {message}")]
    InvalidPath { path: String, message: String },
    #[error("JSON path '{0}' does not resolve in the payload")]
    NotFound(String),
    #[error("payload is not valid URL-encoded UTF-8: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, ExtractionError> {
    let invalid = |message: &str| ExtractionError::InvalidPath {
        path: path.to_string(),
        message: message.to_string(),
    };

    let rest = path.trim();
    let rest = rest.strip_prefix('$').unwrap_or(rest);
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                if end == start {
                    return Err(invalid("empty field name"));
                }
                segments.push(Segment::Field(chars[start..end].iter().collect()));
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| invalid("unclosed '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = (inner.starts_with('\'') && inner.ends_with('\''))
                    || (inner.starts_with('"') && inner.ends_with('"'));
                if quoted && inner.len() >= 2 {
                    segments.push(Segment::Field(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner.parse::<usize>().map_err(|_| invalid("bracket must hold an index or a quoted name"))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            // a bare leading name, as in `prompt` or `messages[0]`
            _ if i == 0 => {
                let mut end = 0;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                segments.push(Segment::Field(chars[..end].iter().collect()));
                i = end;
            }
            c => return Err(invalid(&format!("unexpected character '{c}'"))),
        }
    }
    Ok(segments)
}

/// Resolve `path` against `payload`. String leaves are returned verbatim,
/// any other value as its JSON text. An empty path selects the whole payload.
pub fn extract_json_path(payload: &Value, path: &str) -> Result<String, ExtractionError> {
    let mut current = payload;
    for segment in parse_path(path)? {
        let next = match (&segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name),
            (Segment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        };
        current = next.ok_or_else(|| ExtractionError::NotFound(path.to_string()))?;
    }
    Ok(match current {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

pub fn decode(text: &str, encoding: Encoding) -> Result<String, ExtractionError> {
    match encoding {
        Encoding::None => Ok(text.to_string()),
        Encoding::Url => urlencoding::decode(&text.replace('+', " "))
            .map(|decoded| decoded.into_owned())
            .map_err(|e| ExtractionError::Decode(e.to_string())),
    }
}

/// Apply an application's extraction spec to a payload
pub fn extract(payload: &Value, spec: &ExtractionSpec) -> Result<String, ExtractionError> {
    let raw = extract_json_path(payload, &spec.json_path)?;
    decode(&raw, spec.encoding)
}
