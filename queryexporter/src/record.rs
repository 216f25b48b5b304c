//! Schema-less records returned by driver queries.
//!
//! Every backend returns rows of a different shape, so a [`Record`] is simply an ordered map from
//! field name to a dynamically typed [`Value`]. The projector pulls the numeric value and label
//! values out of a record with [`Record::lookup`], which understands dotted paths into nested
//! objects.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;

/// A dynamically typed field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent value, such as SQL `NULL` or JSON `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// Raw bytes, as returned by some database drivers for text-like columns.
    Bytes(Vec<u8>),
    /// Nested object.
    Map(IndexMap<String, Value>),
    /// Sequence of values.
    Array(Vec<Value>),
}

impl Value {
    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
        }
    }

    /// Coerces this value to a float.
    ///
    /// Native numbers convert directly, while strings and bytes are parsed. Everything else,
    /// including text that does not parse as a float, yields `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Renders this value as a label value.
    ///
    /// Nulls, maps and arrays have no sensible scalar form and render as an empty string.
    pub fn to_label_value(&self) -> String {
        match self {
            Value::Null | Value::Map(_) | Value::Array(_) => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Decodes an object that was handed back in encoded form.
    ///
    /// Drivers frequently return JSON columns or documents as text or bytes. If this value holds
    /// the text of a JSON object, the decoded fields are returned.
    fn decode_object(&self) -> Option<IndexMap<String, Value>> {
        let raw = match self {
            Value::String(s) => s.as_bytes(),
            Value::Bytes(b) => b.as_slice(),
            _ => return None,
        };

        match serde_json::from_slice(raw).ok()? {
            serde_json::Value::Object(fields) => {
                Some(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_label_value())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// One row of a query result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing any previous value.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.fields.insert(key.into(), value.into());
    }

    /// Whether the record has no fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Gets a top-level field by its exact name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Iterates over the top-level fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Resolves a possibly dotted field path.
    ///
    /// An exact top-level match always wins, so a column literally named `a.b` is found before
    /// any nested lookup is attempted. Otherwise the path is split on its first `.` and the
    /// remainder is resolved inside the named field:
    ///
    /// - nested maps are descended into directly,
    /// - text or bytes holding a JSON object are decoded first and then descended into,
    /// - any other value is returned as-is, since there is nothing left to descend into.
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        lookup(&self.fields, path)
    }

    /// Stringified label value of the field at `path`, or an empty string if it is missing.
    pub fn label_value(&self, path: &str) -> String {
        self.lookup(path).map(|v| v.to_label_value()).unwrap_or_default()
    }
}

fn lookup<'a>(fields: &'a IndexMap<String, Value>, path: &str) -> Option<Cow<'a, Value>> {
    if let Some(value) = fields.get(path) {
        return Some(Cow::Borrowed(value));
    }

    let (head, rest) = path.split_once('.')?;
    match fields.get(head)? {
        Value::Map(nested) => lookup(nested, rest),
        other => match other.decode_object() {
            Some(decoded) => lookup(&decoded, rest).map(|v| Cow::Owned(v.into_owned())),
            None => Some(Cow::Borrowed(other)),
        },
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record { fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl From<IndexMap<String, Value>> for Record {
    fn from(fields: IndexMap<String, Value>) -> Self {
        Record { fields }
    }
}

impl From<BTreeMap<String, String>> for Record {
    fn from(fields: BTreeMap<String, String>) -> Self {
        fields.into_iter().collect()
    }
}

impl TryFrom<serde_json::Value> for Record {
    type Error = serde_json::Value;

    /// Converts a JSON object into a record, handing back anything that is not an object.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(fields) => {
                Ok(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Record, Value};
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::try_from(value).expect("test record must be an object")
    }

    #[test]
    fn test_lookup_nested_path() {
        let r = record(json!({"value": "42", "tags": {"env": "prod", "dc": {"zone": "a"}}}));

        assert_eq!(r.lookup("value").as_deref(), Some(&Value::from("42")));
        assert_eq!(r.label_value("tags.env"), "prod");
        assert_eq!(r.label_value("tags.dc.zone"), "a");
        assert_eq!(r.lookup("tags.missing"), None);
        assert_eq!(r.lookup("nope"), None);
        assert_eq!(r.lookup("nope.deeper"), None);
    }

    #[test]
    fn test_lookup_exact_key_wins() {
        let r = record(json!({"a.b": 1, "a": {"b": 2}}));
        assert_eq!(r.lookup("a.b").as_deref(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_lookup_decodes_encoded_objects() {
        let mut r = Record::new();
        r.insert("doc", Value::Bytes(br#"{"stats": {"count": 7}}"#.to_vec()));
        r.insert("text", r#"{"owner": "ops"}"#);

        assert_eq!(r.lookup("doc.stats.count").as_deref(), Some(&Value::Int(7)));
        assert_eq!(r.label_value("text.owner"), "ops");
        assert_eq!(r.lookup("text.other"), None);
    }

    #[test]
    fn test_lookup_scalar_parent_returns_parent() {
        let r = record(json!({"status": "up", "items": [1, 2]}));

        assert_eq!(r.label_value("status.code"), "up");
        assert_eq!(r.lookup("items.0").as_deref(), Some(&Value::Array(vec![Value::Int(1), Value::Int(2)])));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from("42").as_f64(), Some(42.0));
        assert_eq!(Value::from(" 0.25 ").as_f64(), Some(0.25));
        assert_eq!(Value::Bytes(b"1e3".to_vec()).as_f64(), Some(1000.0));
        assert_eq!(Value::from("many").as_f64(), None);
        assert_eq!(Value::Bool(true).as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
        assert_eq!(Value::Array(vec![]).as_f64(), None);
    }

    #[test]
    fn test_label_values() {
        assert_eq!(Value::Null.to_label_value(), "");
        assert_eq!(Value::Bool(false).to_label_value(), "false");
        assert_eq!(Value::Int(-7).to_label_value(), "-7");
        assert_eq!(Value::Float(42.0).to_label_value(), "42");
        assert_eq!(Value::Float(0.5).to_label_value(), "0.5");
        assert_eq!(Value::Bytes(b"eu-west".to_vec()).to_label_value(), "eu-west");
        assert_eq!(Value::Map(Default::default()).to_label_value(), "");
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        assert!(Record::try_from(json!([1, 2, 3])).is_err());
        assert!(Record::try_from(json!("text")).is_err());
    }

    proptest! {
        #[test]
        fn test_lookup_top_level_roundtrip(key in "[a-z._]{1,12}", value in any::<i64>()) {
            let mut r = Record::new();
            r.insert(key.clone(), value);
            let found = r.lookup(&key);
            prop_assert_eq!(found.as_deref(), Some(&Value::Int(value)));
        }

        #[test]
        fn test_missing_labels_are_empty(path in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}") {
            prop_assert_eq!(Record::new().label_value(&path), "");
        }
    }
}
