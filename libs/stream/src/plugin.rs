use std::sync::Arc;

use futures::future::BoxFuture;

use query_api::{Arguments, Auditor, Endpoints, Row, Schema, StreamError};

use crate::bounded_source::BoundedDemandSource;
use crate::context::ExecutionContext;
use crate::transform_stage::Transform;

/// Everything a source needs to start producing.
#[derive(Clone)]
pub struct SourceContext {
    pub ctx: ExecutionContext,
    pub arguments: Arguments,
    pub endpoints: Endpoints,
    /// Capacity of the source queue.
    pub buffer: usize,
    pub auditor: Arc<dyn Auditor>,
    pub run_id: String,
}

/// Initialized source: its schema and the stream rows arrive on.
pub struct SourceStream {
    pub schema: Arc<Schema>,
    pub stream: Arc<BoundedDemandSource<Row>>,
}

/// Producer of the rows at the head of a pipeline.
///
/// Implementations start a dedicated producer thread that only touches the
/// returned stream through `add`, `end` and `fail`.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(&self, context: SourceContext) -> BoxFuture<'static, Result<SourceStream, StreamError>>;
}

/// What a processor contributes to the graph.
pub enum ProcessorOutput {
    /// Rows pass untouched; no stage is created.
    Passthrough,
    /// Rows run through `transform`; `schema` describes its output.
    Stage {
        schema: Arc<Schema>,
        transform: Arc<dyn Transform<Row>>,
    },
}

/// A row transform configured in a pipeline definition.
///
/// `initialize` runs once the upstream schema is final and must register
/// every column it adds before returning.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(
        &self,
        upstream: Arc<Schema>,
        arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>>;
}
