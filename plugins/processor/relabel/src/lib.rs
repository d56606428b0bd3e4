use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Arguments, Row, Schema, StreamError};
use query_stream::{Processor, ProcessorOutput, Transform, TransformFuture, Transformed};

#[derive(Debug, Clone, Deserialize)]
pub struct Relabel {
    pub source: String,
    /// New name; an empty target removes the column.
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelabelConfig {
    pub relabels: Vec<Relabel>,
}

/// Renames or removes columns.
pub struct RelabelProcessor {
    name: String,
    mapping: Arc<HashMap<String, String>>,
}

impl RelabelProcessor {
    pub fn new(name: impl Into<String>, config: RelabelConfig) -> Self {
        let mapping = config.relabels.into_iter().map(|r| (r.source, r.target)).collect();
        Self { name: name.into(), mapping: Arc::new(mapping) }
    }
}

struct RelabelRows {
    mapping: Arc<HashMap<String, String>>,
    schema: Arc<Schema>,
}

impl RelabelRows {
    fn relabel(&self, row: Row) -> Result<Row, StreamError> {
        let mut out = Row::new(self.schema.clone());
        for (name, value) in row.into_fields() {
            match self.mapping.get(&name) {
                Some(target) if target.is_empty() => {}
                Some(target) => out.put(target.clone(), value)?,
                None => out.put(name, value)?,
            }
        }
        Ok(out)
    }
}

impl Transform<Row> for RelabelRows {
    fn apply(&self, row: Row) -> TransformFuture<Row> {
        let result = self.relabel(row).map(Transformed::Emit);
        Box::pin(async move { result })
    }
}

impl Processor for RelabelProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
        upstream: Arc<Schema>,
        _arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>> {
        let schema = Arc::new(Schema::new());
        let mapping = self.mapping.clone();
        let name = self.name.clone();
        tracing::debug!(processor = %name, relabels = mapping.len(), "relabel initialized");
        Box::pin(async move {
            for column in upstream.columns() {
                let target = match mapping.get(&column.name) {
                    Some(target) if target.is_empty() => continue,
                    Some(target) => target.clone(),
                    None => column.name,
                };
                schema
                    .register(&target, column.data_type)
                    .map_err(|e| e.with_context(format!("relabel [{name}]")))?;
            }
            Ok(ProcessorOutput::Stage { schema: schema.clone(), transform: Arc::new(RelabelRows { mapping, schema }) })
        })
    }
}
