//! Field-addressable record codec.
//!
//! Every record is stored as one key per field (`model:<id>:<field>`), so the
//! server-side scripts can flip a single field without touching the rest of
//! the record. This module maps between Rust field values and the store's
//! string encodings: integers as decimal strings, bools lowercase, lists and
//! maps as JSON text.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("field {0} is missing")]
    Missing(&'static str),

    #[error("field {field}: invalid {kind} value {raw:?}")]
    Invalid {
        field: &'static str,
        kind: &'static str,
        raw: String,
    },
}

/// Store-side string encoding for a single field value.
pub trait FieldCodec: Sized {
    /// Human-readable kind, used in decode errors.
    const KIND: &'static str;

    fn encode(&self) -> String;

    /// `None` when the raw string is not a valid encoding of `Self`.
    fn decode(raw: &str) -> Option<Self>;
}

impl FieldCodec for i64 {
    const KIND: &'static str = "int";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl FieldCodec for bool {
    const KIND: &'static str = "bool";

    fn encode(&self) -> String {
        if *self { "true" } else { "false" }.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

impl FieldCodec for String {
    const KIND: &'static str = "str";

    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl FieldCodec for Vec<String> {
    const KIND: &'static str = "list";

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }

    fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

impl FieldCodec for BTreeMap<String, i64> {
    const KIND: &'static str = "map";

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Raw field values fetched for one record id.
///
/// Absent keys are simply not present in the map; the record's `from_fields`
/// decides which fields are required and which fall back to defaults.
#[derive(Debug, Default)]
pub struct FieldMap {
    values: HashMap<&'static str, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &'static str, raw: String) {
        self.values.insert(field, raw);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decode a required field. A missing key means the record does not
    /// exist as far as the caller is concerned.
    pub fn required<T: FieldCodec>(&self, field: &'static str) -> Result<T, CodecError> {
        let raw = self.values.get(field).ok_or(CodecError::Missing(field))?;
        T::decode(raw).ok_or_else(|| CodecError::Invalid {
            field,
            kind: T::KIND,
            raw: raw.clone(),
        })
    }

    /// Decode an optional field, falling back to its default when absent.
    pub fn or_default<T: FieldCodec + Default>(&self, field: &'static str) -> Result<T, CodecError> {
        match self.values.get(field) {
            None => Ok(T::default()),
            Some(raw) => T::decode(raw).ok_or_else(|| CodecError::Invalid {
                field,
                kind: T::KIND,
                raw: raw.clone(),
            }),
        }
    }
}

/// A record stored field-per-key under `model:<id>:<field>`.
pub trait Record: Sized {
    /// Field names, excluding `id`. Order matters only for read batching.
    const FIELDS: &'static [&'static str];

    fn id(&self) -> &str;

    /// Encode all fields for a full save.
    fn to_fields(&self) -> Vec<(&'static str, String)>;

    /// Decode from raw field values; `CodecError::Missing` on a required
    /// field signals "record absent".
    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_codec_roundtrip() {
        assert_eq!(FieldCodec::encode(&42i64), "42");
        assert_eq!(i64::decode("42"), Some(42));
        assert_eq!(i64::decode("-7"), Some(-7));
        assert_eq!(i64::decode("nope"), None);
    }

    #[test]
    fn test_bool_codec_lowercase() {
        assert_eq!(FieldCodec::encode(&true), "true");
        assert_eq!(FieldCodec::encode(&false), "false");
        assert_eq!(bool::decode("true"), Some(true));
        // Tolerate legacy capitalized encodings on read.
        assert_eq!(bool::decode("False"), Some(false));
        assert_eq!(bool::decode("1"), None);
    }

    #[test]
    fn test_list_codec_json() {
        let items = vec!["a:1".to_string(), "b:2".to_string()];
        let raw = FieldCodec::encode(&items);
        assert_eq!(raw, r#"["a:1","b:2"]"#);
        assert_eq!(Vec::<String>::decode(&raw), Some(items));
    }

    #[test]
    fn test_map_codec_json() {
        let mut details = BTreeMap::new();
        details.insert("item-1".to_string(), 3i64);
        let raw = FieldCodec::encode(&details);
        assert_eq!(BTreeMap::<String, i64>::decode(&raw), Some(details));
        assert_eq!(BTreeMap::<String, i64>::decode("[]"), None);
    }

    #[test]
    fn test_field_map_required_and_default() {
        let mut fields = FieldMap::new();
        fields.insert("credit", "100".to_string());

        let credit: i64 = fields.required("credit").unwrap();
        assert_eq!(credit, 100);

        let committed: i64 = fields.or_default("committed_credit").unwrap();
        assert_eq!(committed, 0);

        match fields.required::<i64>("missing") {
            Err(CodecError::Missing("missing")) => {}
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_field_map_invalid_value() {
        let mut fields = FieldMap::new();
        fields.insert("credit", "abc".to_string());
        assert!(matches!(
            fields.required::<i64>("credit"),
            Err(CodecError::Invalid { field: "credit", .. })
        ));
    }
}
