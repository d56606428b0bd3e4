use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Arguments, Row, Schema, StreamError};
use query_stream::{Processor, ProcessorOutput, Transform, TransformFuture, Transformed};

#[derive(Debug, Clone, Deserialize)]
pub struct OffsetConfig {
    /// Number of leading rows to skip.
    pub offset: u64,
}

/// Drops the first `offset` rows.
pub struct OffsetProcessor {
    name: String,
    offset: u64,
}

impl OffsetProcessor {
    pub fn new(name: impl Into<String>, config: OffsetConfig) -> Self {
        Self { name: name.into(), offset: config.offset }
    }
}

struct Offset {
    offset: u64,
    seen: AtomicU64,
}

impl Transform<Row> for Offset {
    fn apply(&self, row: Row) -> TransformFuture<Row> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        let outcome = if n < self.offset { Transformed::Skip } else { Transformed::Emit(row) };
        Box::pin(async move { Ok(outcome) })
    }
}

impl Processor for OffsetProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
        upstream: Arc<Schema>,
        _arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>> {
        if self.offset == 0 {
            return Box::pin(async { Ok(ProcessorOutput::Passthrough) });
        }
        let transform = Arc::new(Offset { offset: self.offset, seen: AtomicU64::new(0) });
        tracing::debug!(processor = %self.name, offset = self.offset, "offset initialized");
        Box::pin(async move { Ok(ProcessorOutput::Stage { schema: upstream, transform }) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_api::Value;

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }

    impl LogBuffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn skips_leading_rows() {
        let schema = Arc::new(Schema::new());
        let processor = OffsetProcessor::new("offset", OffsetConfig { offset: 2 });
        let ProcessorOutput::Stage { transform, .. } =
            processor.initialize(schema.clone(), &Arguments::new()).await.unwrap()
        else {
            panic!("offset must create a stage");
        };

        let mut kept = Vec::new();
        for v in 0..5 {
            let row = Row::new(schema.clone()).with("v", v).unwrap();
            if let Transformed::Emit(row) = transform.apply(row).await.unwrap() {
                kept.push(row.get("v").and_then(Value::as_i64).unwrap());
            }
        }
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn initialize_logs_the_offset() {
        let (logs, _guard) = capture_logs();
        let processor = OffsetProcessor::new("skip-two", OffsetConfig { offset: 2 });
        processor.initialize(Arc::new(Schema::new()), &Arguments::new()).await.unwrap();
        let text = logs.text();
        assert!(text.contains("offset initialized"));
        assert!(text.contains("processor=skip-two"));
        assert!(text.contains("offset=2"));
    }

    #[tokio::test]
    async fn zero_offset_is_passthrough() {
        let processor = OffsetProcessor::new("offset", OffsetConfig { offset: 0 });
        let output = processor.initialize(Arc::new(Schema::new()), &Arguments::new()).await.unwrap();
        assert!(matches!(output, ProcessorOutput::Passthrough));
    }
}
