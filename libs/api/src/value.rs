use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Column type tag. `Null` marks a column whose type is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Null,
    Boolean,
    Integer,
    Long,
    Float,
    Double,
    String,
    Date,
    #[serde(alias = "datetime")]
    DateTime,
    Time,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "date_time",
            DataType::Time => "time",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Long | DataType::Float | DataType::Double)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::DateTime | DataType::Time)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single typed cell of a [`Row`](crate::row::Row).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer(_) => DataType::Integer,
            Value::Long(_) => DataType::Long,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::Date(_) => DataType::Date,
            Value::DateTime(_) => DataType::DateTime,
            Value::Time(_) => DataType::Time,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a textual value (argument, driver output) as `data_type`.
    pub fn parse(text: &str, data_type: DataType) -> Result<Value, StreamError> {
        let bad = |e: &dyn fmt::Display| {
            StreamError::schema(format!("cannot parse \"{text}\" as {data_type}: {e}"))
        };
        Ok(match data_type {
            DataType::Null => Value::Null,
            DataType::Boolean => Value::Boolean(text.trim().parse::<bool>().map_err(|e| bad(&e))?),
            DataType::Integer => Value::Integer(text.trim().parse::<i32>().map_err(|e| bad(&e))?),
            DataType::Long => Value::Long(text.trim().parse::<i64>().map_err(|e| bad(&e))?),
            DataType::Float => Value::Float(text.trim().parse::<f32>().map_err(|e| bad(&e))?),
            DataType::Double => Value::Double(text.trim().parse::<f64>().map_err(|e| bad(&e))?),
            DataType::String => Value::String(text.to_string()),
            DataType::Date => Value::Date(
                NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).map_err(|e| bad(&e))?,
            ),
            DataType::DateTime => {
                Value::DateTime(text.trim().parse::<NaiveDateTime>().map_err(|e| bad(&e))?)
            }
            DataType::Time => Value::Time(text.trim().parse::<NaiveTime>().map_err(|e| bad(&e))?),
        })
    }

    /// Convert a JSON literal from a definition file into a value of `data_type`.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> Result<Value, StreamError> {
        use serde_json::Value as Json;

        let mismatch = || StreamError::schema(format!("{json} is not a valid {data_type}"));
        match (json, data_type) {
            (Json::Null, _) => Ok(Value::Null),
            (Json::String(s), DataType::String) => Ok(Value::String(s.clone())),
            (Json::String(s), _) => Value::parse(s, data_type),
            (Json::Bool(b), DataType::Boolean) => Ok(Value::Boolean(*b)),
            (Json::Number(n), DataType::Integer) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Integer)
                .ok_or_else(mismatch),
            (Json::Number(n), DataType::Long) => n.as_i64().map(Value::Long).ok_or_else(mismatch),
            (Json::Number(n), DataType::Float) => {
                n.as_f64().map(|v| Value::Float(v as f32)).ok_or_else(mismatch)
            }
            (Json::Number(n), DataType::Double) => n.as_f64().map(Value::Double).ok_or_else(mismatch),
            (other, DataType::String) => Ok(Value::String(other.to_string())),
            _ => Err(mismatch()),
        }
    }

    /// Best-effort type inference for untyped JSON literals.
    pub fn infer_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(v) => match i32::try_from(v) {
                    Ok(small) => Value::Integer(small),
                    Err(_) => Value::Long(v),
                },
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(v) => Json::from(*v),
            Value::Long(v) => Json::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            other => Json::String(other.to_string()),
        }
    }

    /// Convert into `target`, widening numbers and parsing strings where that
    /// is lossless. Null fits every type.
    pub fn coerce(self, target: DataType) -> Result<Value, StreamError> {
        let from = self.data_type();
        if from == target || target == DataType::Null || self.is_null() {
            return Ok(self);
        }
        let out = match (self, target) {
            (v, DataType::String) => Some(Value::String(v.to_string())),
            (Value::String(s), t) => return Value::parse(&s, t),
            (Value::Integer(v), DataType::Long) => Some(Value::Long(i64::from(v))),
            (Value::Integer(v), DataType::Double) => Some(Value::Double(f64::from(v))),
            (Value::Integer(v), DataType::Float) => Some(Value::Float(v as f32)),
            (Value::Long(v), DataType::Integer) => i32::try_from(v).ok().map(Value::Integer),
            (Value::Long(v), DataType::Double) => Some(Value::Double(v as f64)),
            (Value::Long(v), DataType::Float) => Some(Value::Float(v as f32)),
            (Value::Float(v), DataType::Double) => Some(Value::Double(f64::from(v))),
            (Value::Double(v), DataType::Float) => Some(Value::Float(v as f32)),
            (Value::DateTime(v), DataType::Date) => Some(Value::Date(v.date())),
            (Value::DateTime(v), DataType::Time) => Some(Value::Time(v.time())),
            _ => None,
        };
        out.ok_or_else(|| StreamError::schema(format!("cannot convert {from} to {target}")))
    }

    /// Ordering between values of compatible types; `None` otherwise.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
            Value::DateTime(v) => write!(f, "{}", v.format(DATE_TIME_FORMAT)),
            Value::Time(v) => write!(f, "{}", v.format(TIME_FORMAT)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}
