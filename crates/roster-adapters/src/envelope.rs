//! Locates the record array inside whichever wrapper the export used.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Wrapper keys checked, in order, for the record array.
pub const ENVELOPE_KEYS: &[&str] = &["data", "results", "records", "items"];

const MAX_NESTING: usize = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON (line {line}, column {column}): {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("top-level JSON value is {kind}, expected an array or object")]
    UnexpectedRoot { kind: &'static str },
    #[error("no record array under data/results/records/items; top-level keys: {keys:?}")]
    NoRecordArray { keys: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeShape {
    BareArray,
    /// Dotted path of the wrapper key, e.g. `data` or `data.items`.
    Wrapped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub shape: EnvelopeShape,
    pub records: Vec<JsonValue>,
}

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

pub fn normalize_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    let root: JsonValue = serde_json::from_str(text).map_err(|err| EnvelopeError::Parse {
        line: err.line(),
        column: err.column(),
        message: err.to_string(),
    })?;

    match root {
        JsonValue::Array(records) => Ok(Envelope {
            shape: EnvelopeShape::BareArray,
            records,
        }),
        JsonValue::Object(mut obj) => match take_records(&mut obj, MAX_NESTING) {
            Some((records, path)) => Ok(Envelope {
                shape: EnvelopeShape::Wrapped(path),
                records,
            }),
            None => Err(EnvelopeError::NoRecordArray {
                keys: obj.keys().cloned().collect(),
            }),
        },
        other => Err(EnvelopeError::UnexpectedRoot {
            kind: json_kind(&other),
        }),
    }
}

fn take_records(obj: &mut Map<String, JsonValue>, depth: usize) -> Option<(Vec<JsonValue>, String)> {
    for key in ENVELOPE_KEYS {
        if matches!(obj.get(*key), Some(JsonValue::Array(_))) {
            if let Some(JsonValue::Array(records)) = obj.remove(*key) {
                return Some((records, (*key).to_string()));
            }
        }
    }
    if depth == 0 {
        return None;
    }
    for key in ENVELOPE_KEYS {
        if let Some(JsonValue::Object(inner)) = obj.get_mut(*key) {
            if let Some((records, path)) = take_records(inner, depth - 1) {
                return Some((records, format!("{key}.{path}")));
            }
        }
    }
    None
}
