//! Membership export adapter: corruption guard, envelope normalization and
//! record-to-roster field mapping.

pub mod envelope;
pub mod guard;
pub mod mapping;
pub mod record;

use serde_json::Value as JsonValue;

pub use envelope::{normalize_envelope, Envelope, EnvelopeError, EnvelopeShape, ENVELOPE_KEYS};
pub use guard::{clean_response, CleanedText, CorruptionError, GuardConfig};
pub use mapping::{
    display_name, is_valid_email, is_valid_mobile, map_record, FieldRule, Transform,
    PROFILE_FIELD_MAP,
};
pub use record::{RawRecord, RecordError};

pub const CRATE_NAME: &str = "roster-adapters";

/// Convenience for callers holding a bare JSON value.
pub fn map_value(value: &JsonValue) -> Result<roster_core::MemberDraft, RecordError> {
    map_record(&RawRecord::from_value(value)?)
}
