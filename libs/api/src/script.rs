use std::sync::Arc;

use crate::args::Arguments;
use crate::error::StreamError;
use crate::row::Row;
use crate::value::Value;

/// Embedded expression language used by conditions and scripted processors.
pub trait ScriptEngine: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, StreamError>;
}

/// A compiled, pure expression over the request arguments and optionally
/// the current row.
pub trait Expression: Send + Sync {
    fn evaluate(&self, arguments: &Arguments, row: Option<&Row>) -> Result<Value, StreamError>;

    /// Evaluate as a condition. Null and empty strings are false.
    fn test(&self, arguments: &Arguments, row: Option<&Row>) -> Result<bool, StreamError> {
        Ok(match self.evaluate(arguments, row)? {
            Value::Null => false,
            Value::Boolean(b) => b,
            Value::String(s) => !s.is_empty() && s != "false",
            other => other.as_f64().map(|n| n != 0.0).unwrap_or(true),
        })
    }
}
