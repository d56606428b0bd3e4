use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Column, Row, Schema, StreamError, Value};
use query_stream::{BoundedDemandSource, Source, SourceContext, SourceStream};

/// Rows written inline in the pipeline definition.
///
/// ```toml
/// [source]
/// type = "static"
/// columns = [{ name = "id", type = "long" }, { name = "label", type = "string" }]
/// rows = [[1, "one"], [2, "two"]]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StaticSourceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

fn default_name() -> String {
    "static".into()
}

pub struct StaticSource {
    config: StaticSourceConfig,
}

impl StaticSource {
    pub fn new(config: StaticSourceConfig) -> Self {
        Self { config }
    }

    /// Convert every literal up front so a bad definition fails before any
    /// output is produced.
    fn build_rows(&self, schema: &Arc<Schema>) -> Result<Vec<Row>, StreamError> {
        let columns = &self.config.columns;
        self.config
            .rows
            .iter()
            .enumerate()
            .map(|(i, literals)| {
                if literals.len() > columns.len() {
                    return Err(StreamError::config(format!(
                        "static source [{}]: row {i} has {} values but only {} columns",
                        self.config.name,
                        literals.len(),
                        columns.len()
                    )));
                }
                let mut row = Row::new(schema.clone());
                for (column, literal) in columns.iter().zip(literals) {
                    let value = Value::from_json(literal, column.data_type)
                        .map_err(|e| e.with_context(format!("row {i}, column '{}'", column.name)))?;
                    row.put(column.name.clone(), value)?;
                }
                Ok(row)
            })
            .collect()
    }
}

impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn initialize(&self, context: SourceContext) -> BoxFuture<'static, Result<SourceStream, StreamError>> {
        let schema = Arc::new(Schema::with_columns(self.config.columns.iter().cloned()));
        let prepared = self.build_rows(&schema);
        let name = self.config.name.clone();

        async move {
            let rows = prepared.map_err(|e| e.with_context(format!("static source [{name}]")))?;
            let stream = BoundedDemandSource::new(context.ctx.clone(), context.buffer, schema.clone())?;
            context.auditor.record_source(&context.run_id, &format!("static:{name}"));

            let producer = stream.clone();
            tokio::task::spawn_blocking(move || {
                for row in rows {
                    if producer.is_closed() {
                        tracing::debug!(source = %name, "stream closed, producer stopping");
                        return;
                    }
                    if let Err(e) = producer.add(row) {
                        tracing::error!(source = %name, error = %e, "static source add failed");
                        return;
                    }
                }
                if let Err(e) = producer.end() {
                    tracing::error!(source = %name, error = %e, "static source end failed");
                }
            });

            Ok(SourceStream { schema, stream })
        }
        .boxed()
    }
}
