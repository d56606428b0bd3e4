use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;

use query_api::{Arguments, Row, Schema, StreamError, Value};
use query_stream::{FlushFuture, Processor, ProcessorOutput, Transform, TransformFuture, Transformed};

#[derive(Debug, Clone, Deserialize)]
pub struct SortConfig {
    /// Column names in priority order; a leading `-` sorts that column descending.
    pub fields: Vec<String>,
}

impl SortConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.fields.is_empty() {
            return Err(StreamError::config("No fields provided for sorting"));
        }
        if let Some(field) = self.fields.iter().find(|f| f.trim_start_matches('-').is_empty()) {
            return Err(StreamError::config(format!("Invalid sort field '{field}'")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SortKey {
    field: String,
    descending: bool,
}

impl SortKey {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(field) => Self { field: field.to_string(), descending: true },
            None => Self { field: raw.to_string(), descending: false },
        }
    }
}

/// Collects every row, then releases them ordered by the configured fields
/// once upstream ends. Rows with equal keys keep their arrival order.
pub struct SortProcessor {
    name: String,
    config: SortConfig,
}

impl SortProcessor {
    pub fn new(name: impl Into<String>, config: SortConfig) -> Self {
        Self { name: name.into(), config }
    }
}

/// Nulls and missing values sort before everything else.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.compare(b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
    }
}

fn compare_rows(keys: &[SortKey], a: &Row, b: &Row) -> Ordering {
    for key in keys {
        let ordering = compare_values(a.get(&key.field), b.get(&key.field));
        let ordering = if key.descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

struct Sort {
    keys: Arc<Vec<SortKey>>,
    upstream: Arc<Schema>,
    held: Mutex<Vec<Row>>,
}

impl Transform<Row> for Sort {
    fn apply(&self, row: Row) -> TransformFuture<Row> {
        self.held.lock().push(row);
        Box::pin(async { Ok(Transformed::Skip) })
    }

    fn flush(&self) -> Option<FlushFuture<Row>> {
        let mut rows = std::mem::take(&mut *self.held.lock());
        let keys = self.keys.clone();
        let upstream = self.upstream.clone();
        Some(Box::pin(async move {
            if !rows.is_empty()
                && let Some(key) = keys.iter().find(|k| upstream.data_type(&k.field).is_none())
            {
                return Err(StreamError::config(format!("Unrecognised field in sort: {}", key.field)));
            }
            rows.sort_by(|a, b| compare_rows(&keys, a, b));
            tracing::debug!(rows = rows.len(), "rows sorted");
            Ok(rows)
        }))
    }
}

impl Processor for SortProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
        upstream: Arc<Schema>,
        _arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>> {
        if let Err(e) = self.config.validate() {
            return Box::pin(async move { Err(e) });
        }
        let keys: Vec<SortKey> = self.config.fields.iter().map(|f| SortKey::parse(f)).collect();
        tracing::debug!(processor = %self.name, fields = ?self.config.fields, "sort initialized");
        let transform = Arc::new(Sort { keys: Arc::new(keys), upstream: upstream.clone(), held: Mutex::new(Vec::new()) });
        Box::pin(async move { Ok(ProcessorOutput::Stage { schema: upstream, transform }) })
    }
}
