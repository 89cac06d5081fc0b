//! Typed, lenient accessor over one raw export record.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::envelope::json_kind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is {kind}, expected an object")]
    NotAnObject { kind: &'static str },
    #[error("membership number is missing or blank")]
    MissingMembershipNumber,
}

#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    fields: &'a Map<String, JsonValue>,
}

impl<'a> RawRecord<'a> {
    pub fn from_value(value: &'a JsonValue) -> Result<Self, RecordError> {
        value
            .as_object()
            .map(|fields| Self { fields })
            .ok_or(RecordError::NotAnObject {
                kind: json_kind(value),
            })
    }

    /// Field value, with JSON `null` treated as absent.
    pub fn get(&self, name: &str) -> Option<&'a JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    /// First element of an array-wrapped field; plain scalars are accepted as-is.
    pub fn first_of_array(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            JsonValue::Array(items) => items.iter().find_map(scalar_text),
            other => scalar_text(other),
        }
    }

    /// First alias carrying a value, unwrapping arrays.
    pub fn first_text(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| self.first_of_array(name))
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessor_semantics() {
        let value = json!({
            "membershipNumber": 12345,
            "surname": "  Doe ",
            "blank": "   ",
            "missing": null,
            "region": ["Central", "North"],
            "emptyList": [],
            "nested": {"a": 1},
            "active": true
        });
        let record = RawRecord::from_value(&value).unwrap();

        assert_eq!(record.first_of_array("membershipNumber").as_deref(), Some("12345"));
        assert_eq!(record.first_of_array("surname").as_deref(), Some("Doe"));
        assert_eq!(record.first_of_array("blank"), None);
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.first_of_array("region").as_deref(), Some("Central"));
        assert_eq!(record.first_of_array("emptyList"), None);
        assert_eq!(record.first_of_array("nested"), None);
        assert_eq!(record.first_of_array("active").as_deref(), Some("true"));
        assert_eq!(
            record.first_text(&["absent", "blank", "surname"]).as_deref(),
            Some("Doe")
        );
    }

    #[test]
    fn non_objects_are_rejected() {
        let err = RawRecord::from_value(&json!(["a"])).unwrap_err();
        assert_eq!(err, RecordError::NotAnObject { kind: "an array" });
    }
}
