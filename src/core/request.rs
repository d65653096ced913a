// Scan request/response envelopes plus the segment pass-through carrier.
use crate::core::attr::{AttributeValue, Item, Key};
use crate::core::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A server-evaluated filter with `#name` and `:value` placeholders.
///
/// The engine treats the expression as opaque; only the store parses it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub expression: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attribute_names: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attribute_values: BTreeMap<String, AttributeValue>,
}

impl Predicate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            attribute_names: BTreeMap::new(),
            attribute_values: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, placeholder: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.attribute_names
            .insert(placeholder.into(), attribute.into());
        self
    }

    pub fn with_value(mut self, placeholder: impl Into<String>, value: AttributeValue) -> Self {
        self.attribute_values.insert(placeholder.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.expression.trim().is_empty()
    }

    /// Hex SHA-256 of the expression and its substitutions.
    pub fn digest(&self) -> Result<String, Error> {
        let encoded = serde_json::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode filter")
                .with_source(err)
        })?;
        let digest = Sha256::digest(&encoded);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(hex)
    }
}

/// One page request for one segment. Built fresh for every fetch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
    #[serde(default)]
    pub consistent_read: bool,
    pub total_segments: u32,
    pub segment: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_start_key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One page of results.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated_key: Option<Key>,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub scanned_count: u32,
}

impl ScanResponse {
    /// The continuation cursor, treating an empty key as terminal.
    pub fn continuation(&self) -> Option<&Key> {
        self.last_evaluated_key
            .as_ref()
            .filter(|key| !key.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        self.continuation().is_none()
    }
}

/// Dense segment index in `[0, total_segments)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentDescriptor {
    pub index: u32,
    pub total: u32,
}

impl SegmentDescriptor {
    pub fn all(total: u32) -> impl Iterator<Item = SegmentDescriptor> {
        (0..total).map(move |index| SegmentDescriptor { index, total })
    }
}

/// Pairs a payload with the segment that produced it so merged output keeps its origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPassThrough<U> {
    pub segment: u32,
    pub payload: U,
}

impl<U> SegmentPassThrough<U> {
    pub fn new(segment: u32, payload: U) -> Self {
        Self { segment, payload }
    }

    pub fn map<V>(self, f: impl FnOnce(U) -> V) -> SegmentPassThrough<V> {
        SegmentPassThrough {
            segment: self.segment,
            payload: f(self.payload),
        }
    }
}

/// A fetched page together with the start key that produced it.
///
/// `skipped` counts leading items already dropped because a resumed scan had
/// delivered them before; `response.items` holds only the remainder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub start_key: Option<Key>,
    pub skipped: usize,
    pub response: ScanResponse,
}

#[cfg(test)]
mod tests {
    use super::{Predicate, ScanRequest, ScanResponse, SegmentDescriptor, SegmentPassThrough};
    use crate::core::attr::{AttributeValue, Key};
    use serde_json::json;

    #[test]
    fn digest_tracks_expression_and_substitutions() {
        let base = Predicate::new("#s = :v")
            .with_name("#s", "status")
            .with_value(":v", AttributeValue::string("on"));
        let digest = base.digest().expect("digest");
        assert_eq!(digest.len(), 64);
        assert_eq!(base.clone().digest().expect("digest"), digest);

        let other_value = base.clone().with_value(":v", AttributeValue::string("off"));
        assert_ne!(other_value.digest().expect("digest"), digest);
        let other_expr = Predicate::new("#s <> :v")
            .with_name("#s", "status")
            .with_value(":v", AttributeValue::string("on"));
        assert_ne!(other_expr.digest().expect("digest"), digest);
    }

    #[test]
    fn empty_last_evaluated_key_is_terminal() {
        let mut response = ScanResponse::default();
        assert!(response.is_terminal());
        response.last_evaluated_key = Some(Key::new());
        assert!(response.is_terminal());
        let mut key = Key::new();
        key.insert("id".to_string(), AttributeValue::string("a"));
        response.last_evaluated_key = Some(key);
        assert!(!response.is_terminal());
    }

    #[test]
    fn whitespace_predicate_counts_as_empty() {
        assert!(Predicate::new("").is_empty());
        assert!(Predicate::new("   ").is_empty());
        assert!(!Predicate::new("#a = :v").is_empty());
    }

    #[test]
    fn segment_descriptors_are_dense() {
        let indexes: Vec<u32> = SegmentDescriptor::all(4).map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn pass_through_keeps_segment_when_mapped() {
        let tagged = SegmentPassThrough::new(2, 10_u32).map(|n| n * 2);
        assert_eq!(tagged.segment, 2);
        assert_eq!(tagged.payload, 20);
    }

    #[test]
    fn request_omits_absent_fields_on_the_wire() {
        let request = ScanRequest {
            table: "users".to_string(),
            filter: None,
            consistent_read: false,
            total_segments: 2,
            segment: 1,
            exclusive_start_key: None,
            limit: None,
        };
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(
            value,
            json!({"table": "users", "consistent_read": false, "total_segments": 2, "segment": 1})
        );
    }
}
