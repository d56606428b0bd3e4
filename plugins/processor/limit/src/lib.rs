use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Arguments, Row, Schema, StreamError};
use query_stream::{Processor, ProcessorOutput, Transform, TransformFuture, Transformed};

#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    /// Maximum number of rows to pass.
    pub limit: u64,
}

/// Passes the first `limit` rows, then ends downstream and stops pulling
/// from upstream.
pub struct LimitProcessor {
    name: String,
    limit: u64,
}

impl LimitProcessor {
    pub fn new(name: impl Into<String>, config: LimitConfig) -> Self {
        Self { name: name.into(), limit: config.limit }
    }
}

struct Limit {
    limit: u64,
    seen: AtomicU64,
}

impl Transform<Row> for Limit {
    fn apply(&self, row: Row) -> TransformFuture<Row> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = if self.limit == 0 || n > self.limit {
            Transformed::Finish
        } else if n == self.limit {
            Transformed::Last(row)
        } else {
            Transformed::Emit(row)
        };
        Box::pin(async move { Ok(outcome) })
    }
}

impl Processor for LimitProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
        upstream: Arc<Schema>,
        _arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>> {
        let transform = Arc::new(Limit { limit: self.limit, seen: AtomicU64::new(0) });
        tracing::debug!(processor = %self.name, limit = self.limit, "limit initialized");
        Box::pin(async move { Ok(ProcessorOutput::Stage { schema: upstream, transform }) })
    }
}
