use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::value::DataType;

/// A single named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type }
    }
}

/// Ordered column declaration shared by every row of one stream segment.
///
/// Shared as `Arc<Schema>` across a stage boundary. Columns can only be
/// appended, or have a `Null` type upgraded once the first value is seen,
/// so a snapshot taken by an encoder stays a valid prefix.
#[derive(Debug, Default)]
pub struct Schema {
    columns: RwLock<Vec<Column>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: impl IntoIterator<Item = Column>) -> Self {
        let schema = Self::new();
        {
            let mut guard = schema.columns.write();
            for column in columns {
                match guard.iter_mut().find(|c| c.name == column.name) {
                    Some(existing) => *existing = column,
                    None => guard.push(column),
                }
            }
        }
        schema
    }

    /// Independent copy, used when a stage derives its output schema.
    pub fn snapshot(&self) -> Schema {
        Self::with_columns(self.columns())
    }

    /// Declare `name` with `data_type`.
    ///
    /// Re-registering with the same type or with `Null` is accepted; a
    /// `Null` column is upgraded to the first concrete type. Any other
    /// change of type is a schema error.
    pub fn register(&self, name: &str, data_type: DataType) -> Result<(), StreamError> {
        {
            let guard = self.columns.read();
            if let Some(existing) = guard.iter().find(|c| c.name == name)
                && (existing.data_type == data_type || data_type == DataType::Null)
            {
                return Ok(());
            }
        }
        let mut guard = self.columns.write();
        match guard.iter_mut().find(|c| c.name == name) {
            None => {
                guard.push(Column::new(name, data_type));
                Ok(())
            }
            Some(existing) if existing.data_type == DataType::Null => {
                existing.data_type = data_type;
                Ok(())
            }
            Some(existing) if existing.data_type == data_type || data_type == DataType::Null => Ok(()),
            Some(existing) => Err(StreamError::schema(format!(
                "column '{name}' is declared as {} but got {data_type}",
                existing.data_type
            ))),
        }
    }

    pub fn columns(&self) -> Vec<Column> {
        self.columns.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.read().iter().map(|c| c.name.clone()).collect()
    }

    pub fn data_type(&self, name: &str) -> Option<DataType> {
        self.columns.read().iter().find(|c| c.name == name).map(|c| c.data_type)
    }

    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.read().is_empty()
    }
}
