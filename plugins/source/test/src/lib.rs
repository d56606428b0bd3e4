use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Column, DataType, Row, Schema, StreamError, Value};
use query_stream::{BoundedDemandSource, Source, SourceContext, SourceStream};

/// Synthetic rows: `value` counts from 0, `name` repeats a fixed label.
#[derive(Debug, Clone, Deserialize)]
pub struct TestSourceConfig {
    #[serde(default = "default_row_count")]
    pub row_count: u32,
    /// Adds a `name` column carrying this value.
    #[serde(default)]
    pub name: Option<String>,
    /// Pause between rows, simulating a slow backend.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_row_count() -> u32 {
    10
}

pub struct TestSource {
    config: TestSourceConfig,
}

impl TestSource {
    pub fn new(config: TestSourceConfig) -> Self {
        Self { config }
    }
}

impl Source for TestSource {
    fn name(&self) -> &str {
        "test"
    }

    fn initialize(&self, context: SourceContext) -> BoxFuture<'static, Result<SourceStream, StreamError>> {
        let config = self.config.clone();
        async move {
            let mut columns = vec![Column::new("value", DataType::Integer)];
            if config.name.is_some() {
                columns.push(Column::new("name", DataType::String));
            }
            let schema = Arc::new(Schema::with_columns(columns));
            let stream = BoundedDemandSource::new(context.ctx.clone(), context.buffer, schema.clone())?;
            context.auditor.record_source(&context.run_id, "test");

            let producer = stream.clone();
            let row_schema = schema.clone();
            tokio::task::spawn_blocking(move || {
                let delay = Duration::from_millis(config.delay_ms);
                for i in 0..config.row_count {
                    if producer.is_closed() {
                        tracing::debug!(produced = i, "test source closed early");
                        return;
                    }
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    let row = match make_row(&row_schema, i, config.name.as_deref()) {
                        Ok(row) => row,
                        Err(e) => return producer.fail(e),
                    };
                    if let Err(e) = producer.add(row) {
                        tracing::error!(error = %e, "test source add failed");
                        return;
                    }
                }
                if let Err(e) = producer.end() {
                    tracing::error!(error = %e, "test source end failed");
                }
            });

            Ok(SourceStream { schema, stream })
        }
        .boxed()
    }
}

fn make_row(schema: &Arc<Schema>, i: u32, name: Option<&str>) -> Result<Row, StreamError> {
    let value = i32::try_from(i).map_err(|_| StreamError::source(format!("row index {i} out of range")))?;
    let mut row = Row::new(schema.clone());
    row.put("value", Value::Integer(value))?;
    if let Some(name) = name {
        row.put("name", Value::from(name))?;
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_api::{Arguments, Endpoints, NoopAuditor};
    use query_stream::{ExecutionContext, FormattingSink, ReadStream, RowCapture, pipe};

    fn context(ctx: &ExecutionContext) -> SourceContext {
        SourceContext {
            ctx: ctx.clone(),
            arguments: Arguments::new(),
            endpoints: Endpoints::new(),
            buffer: 4,
            auditor: Arc::new(NoopAuditor),
            run_id: "test".into(),
        }
    }

    #[tokio::test]
    async fn counts_from_zero() {
        let ctx = ExecutionContext::new("test");
        let source = TestSource::new(TestSourceConfig { row_count: 25, name: Some("x".into()), delay_ms: 0 });
        let SourceStream { schema, stream } = source.initialize(context(&ctx)).await.unwrap();
        assert_eq!(schema.names(), vec!["value", "name"]);

        let capture = RowCapture::new();
        let sink = FormattingSink::new(ctx.clone(), Box::new(capture.clone()));
        pipe(stream, sink.clone());
        assert_eq!(sink.completion().await.unwrap(), 25);
        let values: Vec<i64> = capture.take().iter().filter_map(|r| r.get("value").and_then(Value::as_i64)).collect();
        assert_eq!(values, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn name_is_the_source_type_not_the_row_label() {
        let source = TestSource::new(TestSourceConfig { row_count: 1, name: Some("label".into()), delay_ms: 0 });
        assert_eq!(source.name(), "test");
    }

    #[tokio::test]
    async fn closing_stops_the_producer() {
        let ctx = ExecutionContext::new("test");
        let source = TestSource::new(TestSourceConfig { row_count: 10_000, name: None, delay_ms: 1 });
        let SourceStream { stream, .. } = source.initialize(context(&ctx)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stream.queued(), 0);
        assert!(stream.is_closed());
    }
}
