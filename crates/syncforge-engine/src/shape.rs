//! Record shapes: how to read the id and the bucket key out of an opaque
//! payload.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde_json::Value;
use syncforge_types::record::{BucketKey, RecordId};

const ID_SEPARATOR: &str = ":";

/// Why a raw record could not be shaped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("record has no usable '{0}' field")]
    MissingId(String),
}

/// Extracts the engine-visible fields from a raw record.
pub trait RecordShape: Send + Sync {
    /// Identifier, unique within a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError`] when the payload carries no usable id.
    fn record_id(&self, raw: &Value) -> Result<RecordId, ShapeError>;

    /// Bucket key; [`BucketKey::Unknown`] when it cannot be derived.
    fn bucket_key(&self, raw: &Value) -> BucketKey;
}

/// Shape driven by field names.
///
/// The id is the listed fields joined with `:`; the bucket is the year of
/// `timestamp_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldShape {
    pub id_fields: Vec<String>,
    pub timestamp_field: Option<String>,
}

impl FieldShape {
    #[must_use]
    pub fn new<I, S>(id_fields: I, timestamp_field: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id_fields: id_fields.into_iter().map(Into::into).collect(),
            timestamp_field: timestamp_field.map(str::to_string),
        }
    }
}

fn id_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl RecordShape for FieldShape {
    fn record_id(&self, raw: &Value) -> Result<RecordId, ShapeError> {
        let mut parts = Vec::with_capacity(self.id_fields.len());
        for field in &self.id_fields {
            let part = raw
                .get(field)
                .and_then(id_part)
                .ok_or_else(|| ShapeError::MissingId(field.clone()))?;
            parts.push(part);
        }
        if parts.is_empty() {
            return Err(ShapeError::MissingId("id".to_string()));
        }
        Ok(RecordId::new(parts.join(ID_SEPARATOR)))
    }

    fn bucket_key(&self, raw: &Value) -> BucketKey {
        self.timestamp_field
            .as_deref()
            .and_then(|field| raw.get(field))
            .and_then(year_of)
            .map_or(BucketKey::Unknown, BucketKey::Year)
    }
}

/// Year of a timestamp value.
///
/// Accepts a bare year (string or integer), `YYYY-MM-DD`,
/// `YYYY-MM-DDTHH:MM[:SS]` and RFC 3339. Years outside `1000..=9999` are
/// rejected.
#[must_use]
pub fn year_of(value: &Value) -> Option<u16> {
    let year = match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => parse_year(s.trim()),
        _ => None,
    }?;
    u16::try_from(year).ok().filter(|y| (1000..=9999).contains(y))
}

fn parse_year(s: &str) -> Option<i32> {
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.year());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.year());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(|d| d.year())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn shape() -> FieldShape {
        FieldShape::new(["codDocumento"], Some("dataDocumento"))
    }

    #[rstest]
    #[case(json!("2023"), Some(2023))]
    #[case(json!(2021), Some(2021))]
    #[case(json!("2024-03-15"), Some(2024))]
    #[case(json!("2022-11-30T08:15"), Some(2022))]
    #[case(json!("2022-11-30T08:15:42"), Some(2022))]
    #[case(json!("2020-01-01T00:00:00-03:00"), Some(2020))]
    #[case(json!("2019-07-04T12:00:00Z"), Some(2019))]
    #[case(json!("not a date"), None)]
    #[case(json!("15/03/2024"), None)]
    #[case(json!(""), None)]
    #[case(json!(null), None)]
    #[case(json!(99), None)]
    #[case(json!(true), None)]
    fn parses_years(#[case] value: Value, #[case] expected: Option<u16>) {
        assert_eq!(year_of(&value), expected);
    }

    #[test]
    fn bucket_defaults_to_unknown() {
        let shape = shape();
        assert_eq!(shape.bucket_key(&json!({"dataDocumento": "2023-05-01"})), BucketKey::Year(2023));
        assert_eq!(shape.bucket_key(&json!({"dataDocumento": "garbage"})), BucketKey::Unknown);
        assert_eq!(shape.bucket_key(&json!({})), BucketKey::Unknown);
        let no_ts = FieldShape::new(["id"], None);
        assert_eq!(no_ts.bucket_key(&json!({"id": 1})), BucketKey::Unknown);
    }

    #[test]
    fn composite_ids_join_fields() {
        let shape = FieldShape::new(["codDocumento", "numDocumento"], None);
        let id = shape
            .record_id(&json!({"codDocumento": 7_654_321, "numDocumento": "NF-12"}))
            .unwrap();
        assert_eq!(id.as_str(), "7654321:NF-12");
    }

    #[test]
    fn missing_or_blank_id_is_rejected() {
        let shape = shape();
        assert_eq!(
            shape.record_id(&json!({"other": 1})),
            Err(ShapeError::MissingId("codDocumento".into()))
        );
        assert!(shape.record_id(&json!({"codDocumento": "  "})).is_err());
        assert!(shape.record_id(&json!({"codDocumento": null})).is_err());
        assert!(FieldShape::new(Vec::<String>::new(), None).record_id(&json!({})).is_err());
    }
}
