// Attribute values, items, and keys as they travel between the store and the engine.
use crate::core::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// One raw item as returned by the store: attribute name to value.
pub type Item = BTreeMap<String, AttributeValue>;

/// Primary-key attributes of an item; also the shape of a continuation cursor.
pub type Key = BTreeMap<String, AttributeValue>;

/// A typed attribute value in the store's tagged JSON form (`{"S": "..."}`).
///
/// Numbers travel as decimal strings so no precision is lost between the
/// store and the decoder. The derived ordering is only used to keep keys in a
/// stable order inside a segment; filter comparisons use [`AttributeValue::compare`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    B(Vec<u8>),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null,
    L(Vec<AttributeValue>),
    M(BTreeMap<String, AttributeValue>),
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    #[serde(rename = "NS")]
    Ns(Vec<String>),
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::S(value.into())
    }

    pub fn number(value: impl ToString) -> Self {
        Self::N(value.to_string())
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => Self::N(number.to_string()),
            Value::String(text) => Self::S(text.clone()),
            Value::Array(values) => Self::L(values.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::M(
                map.iter()
                    .map(|(name, value)| (name.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::S(text) => Value::String(text.clone()),
            Self::N(number) => number_to_json(number),
            Self::B(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Null => Value::Null,
            Self::L(values) => Value::Array(values.iter().map(Self::to_json).collect()),
            Self::M(map) => Value::Object(
                map.iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Ss(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
            Self::Ns(values) => Value::Array(values.iter().map(|n| number_to_json(n)).collect()),
        }
    }

    /// Compares two values of the same scalar type; `None` when they are not comparable.
    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::S(a), Self::S(b)) => Some(a.cmp(b)),
            (Self::B(a), Self::B(b)) => Some(a.cmp(b)),
            (Self::N(a), Self::N(b)) => {
                let a = a.parse::<f64>().ok()?;
                let b = b.parse::<f64>().ok()?;
                a.partial_cmp(&b)
            }
            (Self::Bool(a), Self::Bool(b)) if a == b => Some(std::cmp::Ordering::Equal),
            (Self::Null, Self::Null) => Some(std::cmp::Ordering::Equal),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null => "NULL",
            Self::L(_) => "L",
            Self::M(_) => "M",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
        }
    }
}

fn number_to_json(number: &str) -> Value {
    match number.parse::<Number>() {
        Ok(parsed) => Value::Number(parsed),
        Err(_) => Value::String(number.to_string()),
    }
}

/// Converts a plain JSON object (one table row) into an item.
pub fn item_from_json(value: &Value) -> Result<Item, Error> {
    let Value::Object(map) = value else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("item must be a JSON object")
            .with_hint("Each line of a table file holds one object, e.g. {\"id\": \"a\"}."));
    };
    Ok(map
        .iter()
        .map(|(name, value)| (name.clone(), AttributeValue::from_json(value)))
        .collect())
}

pub fn item_to_json(item: &Item) -> Value {
    let mut map = Map::new();
    for (name, value) in item {
        map.insert(name.clone(), value.to_json());
    }
    Value::Object(map)
}

/// Projects an item onto its key attributes; `None` if any key attribute is missing.
pub fn key_of(item: &Item, key_attributes: &[String]) -> Option<Key> {
    let mut key = Key::new();
    for name in key_attributes {
        let value = item.get(name)?;
        key.insert(name.clone(), value.clone());
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::{AttributeValue, item_from_json, item_to_json, key_of};
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn tagged_json_matches_store_format() {
        let value = AttributeValue::string("alice");
        assert_eq!(serde_json::to_value(&value).expect("json"), json!({"S": "alice"}));
        let value = AttributeValue::Bool(true);
        assert_eq!(serde_json::to_value(&value).expect("json"), json!({"BOOL": true}));
        let decoded: AttributeValue = serde_json::from_value(json!({"N": "42"})).expect("value");
        assert_eq!(decoded, AttributeValue::number(42));
    }

    #[test]
    fn plain_json_row_becomes_item() {
        let row = json!({"id": "u1", "age": 31, "tags": ["a", "b"], "active": false});
        let item = item_from_json(&row).expect("item");
        assert_eq!(item["id"], AttributeValue::string("u1"));
        assert_eq!(item["age"], AttributeValue::N("31".to_string()));
        assert_eq!(item_to_json(&item), row);
    }

    #[test]
    fn non_object_row_is_usage_error() {
        let err = item_from_json(&json!([1, 2])).expect_err("err");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Usage);
    }

    #[test]
    fn numbers_compare_numerically() {
        let nine = AttributeValue::number(9);
        let ten = AttributeValue::number(10);
        assert_eq!(nine.compare(&ten), Some(Ordering::Less));
        assert_eq!(nine.compare(&AttributeValue::string("9")), None);
    }

    #[test]
    fn key_projection_requires_every_attribute() {
        let item = item_from_json(&json!({"pk": "a", "sk": 1, "v": true})).expect("item");
        let key = key_of(&item, &["pk".to_string(), "sk".to_string()]).expect("key");
        assert_eq!(key.len(), 2);
        assert!(key_of(&item, &["missing".to_string()]).is_none());
    }
}
