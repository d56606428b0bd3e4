use std::sync::Arc;

use crate::error::StreamError;
use crate::schema::Schema;
use crate::value::Value;

/// One unit of pipeline data: ordered `name -> value` pairs bound to the
/// schema of the segment they travel in.
///
/// `put` registers the column in the schema before storing the value, so
/// every value a row carries matches the declaration downstream sees.
#[derive(Debug, Clone)]
pub struct Row {
    schema: Arc<Schema>,
    fields: Vec<(String, Value)>,
    sentinel: bool,
}

impl Row {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema, fields: Vec::new(), sentinel: false }
    }

    /// The "no data, ending now" marker. Never produces output and is
    /// distinct from a genuine row without columns.
    pub fn sentinel() -> Self {
        Self { schema: Arc::new(Schema::new()), fields: Vec::new(), sentinel: true }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) -> Result<(), StreamError> {
        let name = name.into();
        self.schema.register(&name, value.data_type())?;
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
        Ok(())
    }

    /// Builder form of [`Row::put`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Self, StreamError> {
        self.put(name, value.into())?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }

    /// Move the row into another segment's schema, registering its columns.
    pub fn rebase(self, schema: Arc<Schema>) -> Result<Row, StreamError> {
        if Arc::ptr_eq(&self.schema, &schema) {
            return Ok(self);
        }
        let mut row = Row { schema, fields: Vec::with_capacity(self.fields.len()), sentinel: self.sentinel };
        for (name, value) in self.fields {
            row.put(name, value)?;
        }
        Ok(row)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    #[test]
    fn put_registers_before_storing() {
        let schema = Arc::new(Schema::new());
        let row = Row::new(schema.clone()).with("a", 1).unwrap().with("b", "x").unwrap();
        assert_eq!(schema.data_type("a"), Some(DataType::Integer));
        assert_eq!(schema.data_type("b"), Some(DataType::String));
        assert_eq!(row.get("a"), Some(&Value::Integer(1)));
    }

    #[test]
    fn mismatched_value_is_rejected() {
        let schema = Arc::new(Schema::new());
        let mut row = Row::new(schema).with("a", 1).unwrap();
        assert!(row.put("a", Value::from("text")).is_err());
        row.put("a", Value::Null).unwrap();
        assert_eq!(row.get("a"), Some(&Value::Null));
    }

    #[test]
    fn sentinel_differs_from_empty_row() {
        let empty = Row::new(Arc::new(Schema::new()));
        assert!(!empty.is_sentinel());
        assert!(Row::sentinel().is_sentinel());
        assert!(empty.is_empty() && Row::sentinel().is_empty());
    }
}
