//! Wiring shared by the main pipeline and dynamic-endpoint sub-pipelines:
//! source and processor initialization, piping, and failure unwinding.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use query_api::{Row, Schema, StreamError};
use query_stream::{
    AsyncTransformStage, BoundedDemandSource, ErrorHandler, ExecutionContext, FormattingSink, ProcessorOutput,
    ReadStream, SourceContext, SourceStream, WriteStream, pipe,
};

use crate::catalog::Catalog;
use crate::config::{ProcessorDefinition, SourceDefinition};
use crate::error::PipelineError;

/// Initialized source plus the stages that follow it.
pub(crate) struct Chain {
    pub source_name: String,
    pub source: Arc<BoundedDemandSource<Row>>,
    pub stages: Vec<Arc<AsyncTransformStage<Row>>>,
    /// Schema of the rows leaving the last stage.
    pub schema: Arc<Schema>,
}

impl Chain {
    /// Release the source (and whatever its producer holds) and discard
    /// anything in flight.
    pub fn close(&self) {
        self.source.close();
        for stage in &self.stages {
            stage.close();
        }
    }
}

/// Initialize the source, then each processor in order against the schema
/// produced so far. Processors whose condition is false are left out.
pub(crate) async fn build_chain(
    catalog: &Catalog,
    source: &SourceDefinition,
    processors: &[ProcessorDefinition],
    context: SourceContext,
) -> Result<Chain, PipelineError> {
    let ctx = context.ctx.clone();
    let arguments = context.arguments.clone();

    let source = catalog.source(source)?;
    let source_name = source.name().to_string();
    let SourceStream { schema, stream } = source
        .initialize(context)
        .await
        .map_err(|e| PipelineError::from(e).with_context(format!("source [{source_name}]")))?;
    tracing::debug!(source = %source_name, columns = schema.len(), "source initialized");

    let mut chain = Chain { source_name, source: stream, stages: Vec::new(), schema };
    for (i, definition) in processors.iter().enumerate() {
        let processor = catalog.processor(i + 1, definition);
        let name = processor.name().to_string();

        if let Some(condition) = definition.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            let enabled = catalog
                .script_engine()
                .compile(condition)
                .and_then(|expr| expr.test(&arguments, None));
            match enabled {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(processor = %name, condition, "processor disabled by condition");
                    continue;
                }
                Err(e) => {
                    ctx.run_on_context(move || chain.close());
                    ctx.flush().await;
                    return Err(PipelineError::from(e).with_context(format!("processor [{name}] condition")));
                }
            }
        }

        match processor.initialize(chain.schema.clone(), &arguments).await {
            Ok(ProcessorOutput::Passthrough) => {
                tracing::debug!(processor = %name, "processor is a passthrough");
            }
            Ok(ProcessorOutput::Stage { schema, transform }) => {
                tracing::debug!(processor = %name, columns = schema.len(), "processor initialized");
                chain.stages.push(AsyncTransformStage::new(ctx.clone(), name, transform));
                chain.schema = schema;
            }
            Err(e) => {
                ctx.run_on_context(move || chain.close());
                ctx.flush().await;
                return Err(PipelineError::from(e).with_context(format!("processor [{name}]")));
            }
        }
    }
    Ok(chain)
}

/// A fully built graph: chain piped into a sink.
pub(crate) struct Graph {
    name: String,
    ctx: ExecutionContext,
    chain: Chain,
    sink: Arc<FormattingSink>,
    dropped: AtomicU64,
}

impl Graph {
    pub fn new(name: impl Into<String>, ctx: ExecutionContext, chain: Chain, sink: Arc<FormattingSink>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), ctx, chain, sink, dropped: AtomicU64::new(0) })
    }

    /// Rows dropped by per-row transform faults.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the flow and wait for the sink to finish.
    pub async fn run(self: &Arc<Self>) -> Result<u64, StreamError> {
        let completion = self.sink.completion();
        let graph = self.clone();
        self.ctx.run_on_context(move || graph.connect());

        let result = completion.await;
        if result.is_err() {
            let graph = self.clone();
            self.ctx.run_on_context(move || graph.chain.close());
            self.ctx.flush().await;
        }
        result
    }

    fn connect(self: &Arc<Self>) {
        let graph = Arc::downgrade(self);
        let on_error: ErrorHandler = Arc::new(move |error| {
            if let Some(graph) = graph.upgrade() {
                graph.on_error(error);
            }
        });
        self.chain.source.set_error_handler(on_error.clone());
        for stage in &self.chain.stages {
            stage.set_error_handler(on_error.clone());
        }

        // Downstream first, so demand is in place before the source starts.
        let mut downstream: Arc<dyn WriteStream<Row>> = self.sink.clone();
        for stage in self.chain.stages.iter().rev() {
            pipe(stage.clone(), downstream);
            downstream = stage.clone();
        }
        pipe(self.chain.source.clone(), downstream);
        tracing::debug!(pipeline = %self.name, source = %self.chain.source_name, stages = self.chain.stages.len(), "graph connected");
    }

    fn on_error(&self, error: StreamError) {
        if error.is_fatal() {
            tracing::error!(pipeline = %self.name, error = %error, "pipeline failed");
            self.sink.abort(error);
            self.chain.close();
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pipeline = %self.name, error = %error, "row dropped");
        }
    }
}
