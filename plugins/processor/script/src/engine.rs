//! Rhai-backed [`ScriptEngine`].
//!
//! Expressions see the request arguments as the map `args` (single values
//! as strings, repeated ones as arrays), the current row as the map `row`,
//! and every row column whose name is a valid identifier as a variable.

use std::sync::Arc;

use rhai::{AST, Array, Dynamic, Engine, Map, Scope};

use query_api::{Arguments, Expression, Row, ScriptEngine, StreamError, Value};

const MAX_OPERATIONS: u64 = 1_000_000;

pub struct RhaiEngine {
    engine: Arc<Engine>,
}

impl RhaiEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        Self { engine: Arc::new(engine) }
    }
}

impl Default for RhaiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for RhaiEngine {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, StreamError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| StreamError::config(format!("invalid expression `{source}`: {e}")))?;
        Ok(Arc::new(RhaiExpression { engine: self.engine.clone(), ast }))
    }
}

struct RhaiExpression {
    engine: Arc<Engine>,
    ast: AST,
}

impl Expression for RhaiExpression {
    fn evaluate(&self, arguments: &Arguments, row: Option<&Row>) -> Result<Value, StreamError> {
        let mut scope = Scope::new();
        if let Some(row) = row {
            let mut fields = Map::new();
            for (name, value) in row.fields() {
                let value = to_dynamic(value);
                if is_identifier(name) {
                    scope.push_dynamic(name.to_string(), value.clone());
                }
                fields.insert(name.into(), value);
            }
            scope.push_dynamic("row", Dynamic::from(fields));
        }
        scope.push_dynamic("args", arguments_map(arguments));

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| StreamError::transform(e.to_string()))?;
        Ok(from_dynamic(result))
    }
}

fn arguments_map(arguments: &Arguments) -> Dynamic {
    let mut map = Map::new();
    for (name, values) in arguments.iter() {
        let value = match values {
            [single] => Dynamic::from(single.clone()),
            many => Dynamic::from(many.iter().cloned().map(Dynamic::from).collect::<Array>()),
        };
        map.insert(name.into(), value);
    }
    Dynamic::from(map)
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Boolean(v) => Dynamic::from(*v),
        Value::Integer(v) => Dynamic::from(i64::from(*v)),
        Value::Long(v) => Dynamic::from(*v),
        Value::Float(v) => Dynamic::from(f64::from(*v)),
        Value::Double(v) => Dynamic::from(*v),
        Value::String(v) => Dynamic::from(v.clone()),
        temporal => Dynamic::from(temporal.to_string()),
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Boolean(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Long(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Double(f);
    }
    match value.into_string() {
        Ok(s) => Value::String(s),
        Err(type_name) => Value::String(type_name.to_string()),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_api::{ErrorKind, Schema};

    #[test]
    fn arguments_are_visible_as_map() {
        let engine = RhaiEngine::new();
        let args: Arguments = [("env", "prod"), ("id", "1"), ("id", "2")].into_iter().collect();

        let expr = engine.compile(r#"args.env == "prod""#).unwrap();
        assert!(expr.test(&args, None).unwrap());

        let expr = engine.compile("args.id.len()").unwrap();
        assert_eq!(expr.evaluate(&args, None).unwrap(), Value::Long(2));
    }

    #[test]
    fn row_fields_are_variables() {
        let engine = RhaiEngine::new();
        let row = Row::new(Arc::new(Schema::new()))
            .with("value", 21)
            .unwrap()
            .with("first name", "ann")
            .unwrap();

        let expr = engine.compile("value * 2").unwrap();
        assert_eq!(expr.evaluate(&Arguments::new(), Some(&row)).unwrap(), Value::Long(42));

        let expr = engine.compile(r#"row["first name"] + "!""#).unwrap();
        assert_eq!(expr.evaluate(&Arguments::new(), Some(&row)).unwrap(), Value::from("ann!"));
    }

    #[test]
    fn compile_and_runtime_errors_are_classified() {
        let engine = RhaiEngine::new();
        assert_eq!(engine.compile("1 +").err().unwrap().kind(), ErrorKind::Config);

        let expr = engine.compile("missing_variable + 1").unwrap();
        assert_eq!(expr.evaluate(&Arguments::new(), None).unwrap_err().kind(), ErrorKind::Transform);
    }

    #[test]
    fn unit_is_null_and_false() {
        let engine = RhaiEngine::new();
        let expr = engine.compile("()").unwrap();
        assert_eq!(expr.evaluate(&Arguments::new(), None).unwrap(), Value::Null);
        assert!(!expr.test(&Arguments::new(), None).unwrap());
    }
}
