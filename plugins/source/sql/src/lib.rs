use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::oneshot;

use query_api::{Arguments, Column, Endpoint, EndpointKind, Row, Schema, StreamError, Value};
use query_stream::{BoundedDemandSource, Source, SourceContext, SourceStream};

// ═══════════════════════════════════════════════════════════════
//  Driver interface
// ═══════════════════════════════════════════════════════════════

/// Blocking relational driver. Query execution and parameter binding live
/// behind this interface; the source only moves rows.
pub trait SqlDriver: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn SqlConnection>, StreamError>;
}

/// An open connection. Dropping it releases the connection.
pub trait SqlConnection: Send {
    fn query<'a>(&'a mut self, sql: &str, arguments: &Arguments) -> Result<Box<dyn SqlCursor + 'a>, StreamError>;
}

/// Forward-only result set.
pub trait SqlCursor {
    fn columns(&self) -> Vec<Column>;
    /// Next row, values in `columns()` order. `None` at the end.
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, StreamError>;
}

// ═══════════════════════════════════════════════════════════════
//  Source
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct SqlSourceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Name of the endpoint to connect to.
    pub endpoint: String,
    pub query: String,
}

fn default_name() -> String {
    "sql".into()
}

pub struct SqlSource {
    config: SqlSourceConfig,
    driver: Arc<dyn SqlDriver>,
}

impl SqlSource {
    pub fn new(config: SqlSourceConfig, driver: Arc<dyn SqlDriver>) -> Self {
        Self { config, driver }
    }
}

impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn initialize(&self, context: SourceContext) -> BoxFuture<'static, Result<SourceStream, StreamError>> {
        let config = self.config.clone();
        let driver = self.driver.clone();

        async move {
            let endpoint = context.endpoints.get(&config.endpoint).ok_or_else(|| {
                StreamError::config(format!(
                    "sql source [{}]: endpoint '{}' not found",
                    config.name, config.endpoint
                ))
            })?;
            if endpoint.kind != EndpointKind::Sql {
                return Err(StreamError::config(format!(
                    "sql source [{}]: endpoint '{}' is not a sql endpoint",
                    config.name, config.endpoint
                )));
            }
            context
                .auditor
                .record_source(&context.run_id, endpoint.url.as_deref().unwrap_or(&config.endpoint));

            let (ready_tx, ready_rx) = oneshot::channel();
            tokio::task::spawn_blocking(move || produce(config, driver, endpoint, context, ready_tx));

            ready_rx
                .await
                .map_err(|_| StreamError::source("sql producer stopped before reporting its schema"))?
        }
        .boxed()
    }
}

/// Runs on the dedicated producer thread. The connection lives exactly as
/// long as this function.
fn produce(
    config: SqlSourceConfig,
    driver: Arc<dyn SqlDriver>,
    endpoint: Endpoint,
    context: SourceContext,
    ready: oneshot::Sender<Result<SourceStream, StreamError>>,
) {
    let name = config.name.as_str();
    let fail_init = |e: StreamError, ready: oneshot::Sender<_>| {
        let _ = ready.send(Err(e.with_context(format!("sql source [{name}]"))));
    };

    let mut connection = match driver.connect(&endpoint) {
        Ok(connection) => connection,
        Err(e) => return fail_init(StreamError::source(e.message()), ready),
    };
    let mut cursor = match connection.query(&config.query, &context.arguments) {
        Ok(cursor) => cursor,
        Err(e) => return fail_init(StreamError::source(e.message()), ready),
    };

    let columns = cursor.columns();
    let schema = Arc::new(Schema::with_columns(columns.iter().cloned()));
    let stream = match BoundedDemandSource::new(context.ctx.clone(), context.buffer, schema.clone()) {
        Ok(stream) => stream,
        Err(e) => return fail_init(e, ready),
    };
    if ready.send(Ok(SourceStream { schema: schema.clone(), stream: stream.clone() })).is_err() {
        tracing::debug!(source = %name, "initialization abandoned, releasing connection");
        return;
    }

    let mut produced = 0u64;
    loop {
        if stream.is_closed() {
            tracing::debug!(source = %name, produced, "stream closed, releasing connection");
            break;
        }
        match cursor.next_row() {
            Ok(Some(values)) => {
                let mut row = Row::new(schema.clone());
                let filled = columns
                    .iter()
                    .zip(values)
                    .try_for_each(|(column, value)| row.put(column.name.clone(), value));
                if let Err(e) = filled {
                    stream.fail(e.with_context(format!("sql source [{name}]")));
                    break;
                }
                if let Err(e) = stream.add(row) {
                    tracing::error!(source = %name, error = %e, "sql source add failed");
                    break;
                }
                produced += 1;
            }
            Ok(None) => {
                if let Err(e) = stream.end() {
                    tracing::error!(source = %name, error = %e, "sql source end failed");
                }
                tracing::debug!(source = %name, produced, "result set exhausted");
                break;
            }
            Err(e) => {
                tracing::error!(source = %name, produced, error = %e, "sql source failed mid-stream");
                stream.fail(StreamError::source(e.message()).with_context(format!("sql source [{name}]")));
                break;
            }
        }
    }
}
