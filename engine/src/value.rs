//! Field values carried by records and predicate operands.

use crate::error::{Error, Result};
use crate::schema::FieldType;
use crate::temporal::{Date, DateTime, Time, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single typed value of a record field.
///
/// Equality and hashing are structural so that predicate trees can be
/// compared by value. Comparisons used during evaluation go through
/// [`FieldValue::compare`], which applies each type's ordering semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Timestamp(Timestamp),
    List(Vec<FieldValue>),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Name of the runtime type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "Null",
            FieldValue::Bool(_) => "Boolean",
            FieldValue::Int(_) => "Int",
            FieldValue::Float(_) => "Float",
            FieldValue::String(_) => "String",
            FieldValue::Date(_) => "AWSDate",
            FieldValue::Time(_) => "AWSTime",
            FieldValue::DateTime(_) => "AWSDateTime",
            FieldValue::Timestamp(_) => "AWSTimestamp",
            FieldValue::List(_) => "List",
            FieldValue::Json(_) => "AWSJSON",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// False for NaN and infinite floats, here or nested in a list.
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Float(f) => f.is_finite(),
            FieldValue::List(items) => items.iter().all(FieldValue::is_finite),
            _ => true,
        }
    }

    /// Byte-ordered key for Date, Time and DateTime values.
    pub fn sort_key(&self) -> Option<String> {
        match self {
            FieldValue::Date(d) => Some(d.sort_key()),
            FieldValue::Time(t) => Some(t.sort_key()),
            FieldValue::DateTime(dt) => Some(dt.sort_key()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Order two values using the semantics of their type.
    ///
    /// Numbers compare numerically (ints and floats mix), strings
    /// lexicographically, temporals by the instant they denote. Returns `None`
    /// when the two values are not comparable.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Timestamp(a), Int(b)) => Some(a.seconds().cmp(b)),
            (Int(a), Timestamp(b)) => Some(a.cmp(&b.seconds())),
            _ => None,
        }
    }

    /// Equality under type semantics. `Null` only equals `Null`; comparing a
    /// present value against `Null` is `false`, not an error.
    pub fn matches(&self, other: &FieldValue) -> Option<bool> {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => Some(true),
            (Null, _) | (_, Null) => Some(false),
            (List(a), List(b)) => {
                if a.len() != b.len() {
                    return Some(false);
                }
                for (x, y) in a.iter().zip(b) {
                    if !x.matches(y)? {
                        return Some(false);
                    }
                }
                Some(true)
            }
            (Json(a), Json(b)) => Some(a == b),
            _ => self.compare(other).map(|o| o == Ordering::Equal),
        }
    }

    /// Substring match on strings, membership on lists.
    pub fn contains(&self, needle: &FieldValue) -> Option<bool> {
        match (self, needle) {
            (FieldValue::String(hay), FieldValue::String(n)) => Some(hay.contains(n.as_str())),
            (FieldValue::List(items), needle) => {
                for item in items {
                    if item.matches(needle)? {
                        return Some(true);
                    }
                }
                Some(false)
            }
            _ => None,
        }
    }

    /// Prefix match on strings.
    pub fn begins_with(&self, prefix: &FieldValue) -> Option<bool> {
        match (self, prefix) {
            (FieldValue::String(s), FieldValue::String(p)) => Some(s.starts_with(p.as_str())),
            _ => None,
        }
    }

    /// Encode into the JSON form stored by storage drivers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Date(d) => Value::String(d.format()),
            FieldValue::Time(t) => Value::String(t.format()),
            FieldValue::DateTime(dt) => Value::String(dt.format()),
            FieldValue::Timestamp(ts) => Value::from(ts.seconds()),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Json(v) => v.clone(),
        }
    }

    /// Decode a stored JSON value according to the declared field type.
    pub fn from_json(field: &str, value: &serde_json::Value, field_type: &FieldType) -> Result<Self> {
        use serde_json::Value;
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        let mismatch = || Error::TypeMismatch {
            field: field.to_string(),
            expected: field_type.to_string(),
            got: json_type_name(value).to_string(),
        };
        let decoded = match (field_type, value) {
            (FieldType::Id | FieldType::String | FieldType::Enum(_), Value::String(s)) => {
                FieldValue::String(s.clone())
            }
            (FieldType::Int, Value::Number(n)) => FieldValue::Int(n.as_i64().ok_or_else(mismatch)?),
            (FieldType::Float, Value::Number(n)) => {
                FieldValue::Float(n.as_f64().ok_or_else(mismatch)?)
            }
            (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
            (FieldType::Date, Value::String(s)) => FieldValue::Date(Date::parse(s)?),
            (FieldType::Time, Value::String(s)) => FieldValue::Time(Time::parse(s)?),
            (FieldType::DateTime, Value::String(s)) => FieldValue::DateTime(DateTime::parse(s)?),
            (FieldType::Timestamp, Value::Number(n)) => {
                FieldValue::Timestamp(Timestamp::from_seconds(n.as_i64().ok_or_else(mismatch)?))
            }
            (FieldType::Json, v) => FieldValue::Json(v.clone()),
            (FieldType::List(inner), Value::Array(items)) => FieldValue::List(
                items
                    .iter()
                    .map(|item| FieldValue::from_json(field, item, inner))
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => return Err(mismatch()),
        };
        Ok(decoded)
    }

    /// Whether this value can be stored in a field of `field_type`.
    pub fn conforms_to(&self, field_type: &FieldType) -> bool {
        match (field_type, self) {
            (_, FieldValue::Null) => true,
            (FieldType::Id | FieldType::String | FieldType::Enum(_), FieldValue::String(_)) => true,
            (FieldType::Int, FieldValue::Int(_)) => true,
            (FieldType::Float, FieldValue::Float(_) | FieldValue::Int(_)) => true,
            (FieldType::Bool, FieldValue::Bool(_)) => true,
            (FieldType::Date, FieldValue::Date(_)) => true,
            (FieldType::Time, FieldValue::Time(_)) => true,
            (FieldType::DateTime, FieldValue::DateTime(_)) => true,
            (FieldType::Timestamp, FieldValue::Timestamp(_)) => true,
            (FieldType::Json, _) => true,
            (FieldType::List(inner), FieldValue::List(items)) => {
                items.iter().all(|item| item.conforms_to(inner))
            }
            _ => false,
        }
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Time(a), Time(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Json(a), Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Null => {}
            FieldValue::Bool(b) => b.hash(state),
            FieldValue::Int(i) => i.hash(state),
            FieldValue::Float(f) => f.to_bits().hash(state),
            FieldValue::String(s) => s.hash(state),
            FieldValue::Date(d) => d.hash(state),
            FieldValue::Time(t) => t.hash(state),
            FieldValue::DateTime(dt) => dt.hash(state),
            FieldValue::Timestamp(ts) => ts.hash(state),
            FieldValue::List(items) => items.hash(state),
            FieldValue::Json(v) => v.to_string().hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{:?}", x),
            FieldValue::String(s) => write!(f, "{:?}", s),
            FieldValue::Date(d) => write!(f, "{}", d),
            FieldValue::Time(t) => write!(f, "{}", t),
            FieldValue::DateTime(dt) => write!(f, "{}", dt),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts),
            FieldValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            FieldValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::String(value.clone())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<Date> for FieldValue {
    fn from(value: Date) -> Self {
        FieldValue::Date(value)
    }
}

impl From<Time> for FieldValue {
    fn from(value: Time) -> Self {
        FieldValue::Time(value)
    }
}

impl From<DateTime> for FieldValue {
    fn from(value: DateTime) -> Self {
        FieldValue::DateTime(value)
    }
}

impl From<Timestamp> for FieldValue {
    fn from(value: Timestamp) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison_mixes_int_and_float() {
        assert_eq!(
            FieldValue::Int(2).compare(&FieldValue::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(FieldValue::Float(3.0).matches(&FieldValue::Int(3)), Some(true));
    }

    #[test]
    fn incomparable_types() {
        assert_eq!(FieldValue::from("1").compare(&FieldValue::Int(1)), None);
        assert_eq!(FieldValue::Bool(true).matches(&FieldValue::Int(1)), None);
    }

    #[test]
    fn null_equality() {
        assert_eq!(FieldValue::Null.matches(&FieldValue::Null), Some(true));
        assert_eq!(FieldValue::from("x").matches(&FieldValue::Null), Some(false));
    }

    #[test]
    fn contains_string_and_list() {
        let title = FieldValue::from("Buy milk");
        assert_eq!(title.contains(&"milk".into()), Some(true));
        assert_eq!(title.contains(&"eggs".into()), Some(false));

        let tags = FieldValue::from(vec!["home", "errand"]);
        assert_eq!(tags.contains(&"home".into()), Some(true));
        assert_eq!(tags.contains(&"hom".into()), Some(false));
        assert_eq!(FieldValue::Int(3).contains(&"3".into()), None);
    }

    #[test]
    fn begins_with_only_on_strings() {
        assert_eq!(
            FieldValue::from("Buy milk").begins_with(&"Buy".into()),
            Some(true)
        );
        assert_eq!(FieldValue::Int(10).begins_with(&"1".into()), None);
    }

    #[test]
    fn structural_equality_of_floats() {
        assert_eq!(FieldValue::Float(1.5), FieldValue::Float(1.5));
        assert_ne!(FieldValue::Float(1.0), FieldValue::Int(1));
    }

    #[test]
    fn json_decoding_follows_field_type() {
        let date = FieldValue::from_json("due", &json!("2024-02-29"), &FieldType::Date).unwrap();
        assert_eq!(date, FieldValue::Date(Date::parse("2024-02-29").unwrap()));

        let tags = FieldValue::from_json(
            "tags",
            &json!(["a", "b"]),
            &FieldType::List(Box::new(FieldType::String)),
        )
        .unwrap();
        assert_eq!(tags, FieldValue::from(vec!["a", "b"]));

        let err = FieldValue::from_json("priority", &json!("high"), &FieldType::Int).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { field, .. } if field == "priority"));
    }

    #[test]
    fn conformance() {
        assert!(FieldValue::Int(1).conforms_to(&FieldType::Float));
        assert!(!FieldValue::Float(1.5).conforms_to(&FieldType::Int));
        assert!(FieldValue::Null.conforms_to(&FieldType::Date));
        assert!(FieldValue::from(vec!["a"]).conforms_to(&FieldType::List(Box::new(FieldType::String))));
    }

    #[test]
    fn display_quotes_strings() {
        assert_eq!(FieldValue::from("X").to_string(), "\"X\"");
        assert_eq!(FieldValue::Int(4).to_string(), "4");
        assert_eq!(FieldValue::from(vec![1i64, 2]).to_string(), "[1, 2]");
    }
}
