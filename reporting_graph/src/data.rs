use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
    Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    #[default]
    Unset,
    Nil,
    Bool,
    Int,
    Float,
    String,
    Array,
    Map,
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// A value or an error, as produced by the runtime for one checksum.
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    pub data_type: DataType,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub code_id: String,
    pub data: RawData,
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Nil => DataType::Nil,
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Array(_) => DataType::Array,
            Value::Map(_) => DataType::Map,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => value.abs() > f64::EPSILON,
            Value::String(value) => !value.is_empty(),
            Value::Array(values) => !values.is_empty(),
            Value::Map(values) => !values.is_empty(),
        }
    }
}

impl RawData {
    pub fn new(value: Value) -> Self {
        Self {
            data_type: value.data_type(),
            value,
            error: None,
        }
    }

    pub fn nil() -> Self {
        Self::new(Value::Nil)
    }
    pub fn bool(value: bool) -> Self {
        Self::new(Value::Bool(value))
    }
    pub fn int(value: i64) -> Self {
        Self::new(Value::Int(value))
    }
    pub fn float(value: f64) -> Self {
        Self::new(Value::Float(value))
    }
    pub fn string<S: Into<String>>(value: S) -> Self {
        Self::new(Value::String(value.into()))
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            data_type: DataType::Nil,
            value: Value::Nil,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True only for an error-free `true`.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.value == Value::Bool(true)
    }

    /// Converts to `target`. Errors and nil values pass through unchanged;
    /// an impossible conversion produces an error value.
    pub fn cast(&self, target: DataType) -> RawData {
        if self.is_error()
            || target == DataType::Unset
            || self.value == Value::Nil
            || self.data_type == target
        {
            return self.clone();
        }

        let converted = match (&self.value, target) {
            (value, DataType::Bool) => Some(Value::Bool(value.is_truthy())),

            (Value::Bool(v), DataType::Int) => Some(Value::Int(*v as i64)),
            (Value::Float(v), DataType::Int) => Some(Value::Int(*v as i64)),
            (Value::String(s), DataType::Int) => s.trim().parse().ok().map(Value::Int),

            (Value::Bool(v), DataType::Float) => Some(Value::Float(*v as i64 as f64)),
            (Value::Int(v), DataType::Float) => Some(Value::Float(*v as f64)),
            (Value::String(s), DataType::Float) => s.trim().parse().ok().map(Value::Float),

            (Value::Bool(v), DataType::String) => Some(Value::String(v.to_string())),
            (Value::Int(v), DataType::String) => Some(Value::String(v.to_string())),
            (Value::Float(v), DataType::String) => Some(Value::String(v.to_string())),

            _ => None,
        };

        match converted {
            Some(value) => RawData::new(value),
            None => RawData::error(format!(
                "cannot cast {} to {}",
                self.value.data_type(),
                target
            )),
        }
    }
}

impl RawResult {
    pub fn new<S: Into<String>>(code_id: S, data: RawData) -> Self {
        Self {
            code_id: code_id.into(),
            data,
        }
    }

    pub fn error<S: Into<String>, M: Into<String>>(code_id: S, message: M) -> Self {
        Self::new(code_id, RawData::error(message))
    }

    pub fn is_error(&self) -> bool {
        self.data.is_error()
    }

    pub fn cast(&self, target: DataType) -> RawResult {
        RawResult {
            code_id: self.code_id.clone(),
            data: self.data.cast(target),
        }
    }
}

impl From<Value> for RawData {
    fn from(value: Value) -> Self {
        RawData::new(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn casts_string_to_bool_by_truthiness() {
        assert_eq!(RawData::string("hello").cast(DataType::Bool), RawData::bool(true));
        assert_eq!(RawData::string("").cast(DataType::Bool), RawData::bool(false));
        assert_eq!(RawData::int(0).cast(DataType::Bool), RawData::bool(false));
    }

    #[test]
    fn casts_numbers() {
        assert_eq!(RawData::float(3.7).cast(DataType::Int), RawData::int(3));
        assert_eq!(RawData::string(" 42 ").cast(DataType::Int), RawData::int(42));
        assert_eq!(RawData::int(2).cast(DataType::Float), RawData::float(2.0));
        assert_eq!(RawData::bool(true).cast(DataType::String), RawData::string("true"));
    }

    #[test]
    fn impossible_cast_is_an_error() {
        let casted = RawData::string("abc").cast(DataType::Int);
        assert_eq!(casted.error.as_deref(), Some("cannot cast string to int"));

        let array = RawData::new(Value::Array(vec![Value::Int(1)]));
        assert!(array.cast(DataType::String).is_error());
    }

    #[test]
    fn errors_nil_and_unset_pass_through() {
        let error = RawData::error("boom");
        assert_eq!(error.cast(DataType::Bool), error);
        assert_eq!(RawData::nil().cast(DataType::Int), RawData::nil());
        assert_eq!(RawData::int(5).cast(DataType::Unset), RawData::int(5));
    }

    #[test]
    fn success_requires_true_without_error() {
        assert!(RawData::bool(true).is_success());
        assert!(!RawData::bool(false).is_success());
        assert!(!RawData::string("true").is_success());
        assert!(!RawData::error("x").is_success());
    }

    #[test]
    fn json_shape() -> anyhow::Result<()> {
        let failed = RawResult::error("chk-1", "boom");
        let json = serde_json::to_value(&failed)?;
        assert_eq!(
            json,
            serde_json::json!({
                "code_id": "chk-1",
                "data": { "data_type": "nil", "value": null, "error": "boom" }
            })
        );

        let parsed: RawData =
            serde_json::from_str(r#"{ "data_type": "int", "value": 7 }"#)?;
        assert_eq!(parsed, RawData::int(7));

        Ok(())
    }

    #[test]
    fn data_type_names() {
        assert_eq!(DataType::from_str("bool").unwrap(), DataType::Bool);
        assert_eq!(DataType::String.to_string(), "string");
        assert!(DataType::from_str("tuple").is_err());
    }
}
