use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use uuid::Uuid;

use query_api::{Arguments, Auditor, Endpoint, Endpoints};
use query_stream::{EncodedOutput, ExecutionContext, FormattingSink, SourceContext};

use crate::arguments::prepare_arguments;
use crate::catalog::Catalog;
use crate::config::{EngineConfig, FormatDefinition, PipelineDefinition};
use crate::error::PipelineError;
use crate::format_select::{FormatRequest, select_format};
use crate::graph::{Graph, build_chain};
use crate::preprocess::register_dynamic_endpoints;

/// Lifecycle of a [`PipelineInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Initializing,
    Running,
    Completed,
    Failed,
}

/// One request against a pipeline definition.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Name the pipeline is known by, for the audit trail.
    pub pipeline: String,
    /// Raw arguments, validated against the definition.
    pub arguments: Arguments,
    pub format: FormatRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub rows: u64,
    /// Rows dropped by per-row transform faults.
    pub dropped: u64,
}

/// Builds [`PipelineInstance`]s from definitions.
pub struct Composer {
    catalog: Arc<Catalog>,
    auditor: Arc<dyn Auditor>,
    engine: EngineConfig,
    /// Deployment endpoints, overridden by a definition's own.
    endpoints: BTreeMap<String, Endpoint>,
}

impl Composer {
    pub fn new(catalog: Catalog, auditor: Arc<dyn Auditor>, engine: EngineConfig) -> Self {
        Self { catalog: Arc::new(catalog), auditor, engine, endpoints: BTreeMap::new() }
    }

    pub fn with_endpoints(mut self, endpoints: BTreeMap<String, Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Validate the request and pick the output format. Nothing runs yet.
    pub fn prepare(
        &self,
        definition: Arc<PipelineDefinition>,
        request: RunRequest,
    ) -> Result<PipelineInstance, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        self.auditor.record_request(&run_id, &request.pipeline, &request.arguments);

        let prepared = prepare_arguments(&definition.arguments, &request.arguments).and_then(|arguments| {
            let format = select_format(&definition.formats, &request.format)?.clone();
            Ok((arguments, format))
        });
        let (arguments, format) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.auditor.record_failure(&run_id, e.status(), &e.to_string());
                return Err(e);
            }
        };
        tracing::debug!(pipeline = %request.pipeline, run_id = %run_id, format = %format.name(), "pipeline prepared");

        Ok(PipelineInstance {
            run_id,
            name: request.pipeline,
            definition,
            arguments,
            format,
            catalog: self.catalog.clone(),
            auditor: self.auditor.clone(),
            engine: self.engine.clone(),
            endpoints: self.endpoints.clone(),
            state: Mutex::new(PipelineState::Created),
        })
    }
}

/// A prepared run: content type is known up front, `run` drives the whole
/// graph into a byte sink.
pub struct PipelineInstance {
    run_id: String,
    name: String,
    definition: Arc<PipelineDefinition>,
    arguments: Arguments,
    format: FormatDefinition,
    catalog: Arc<Catalog>,
    auditor: Arc<dyn Auditor>,
    engine: EngineConfig,
    endpoints: BTreeMap<String, Endpoint>,
    state: Mutex<PipelineState>,
}

impl PipelineInstance {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn content_type(&self) -> &str {
        self.format.media_type()
    }

    pub fn extension(&self) -> &str {
        self.format.extension()
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Run the pipeline, writing the formatted output to `output`. The sink
    /// is shut down when the run ends, successfully or not. A second call is
    /// rejected.
    pub async fn run<W>(&self, output: W) -> Result<RunSummary, PipelineError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Created {
                return Err(PipelineError::AlreadyRan);
            }
            *state = PipelineState::Initializing;
        }
        let started = Instant::now();
        let result = self.execute(output).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(summary) => {
                *self.state.lock() = PipelineState::Completed;
                self.auditor.record_completion(&self.run_id, summary.rows);
                tracing::info!(pipeline = %self.name, run_id = %self.run_id, rows = summary.rows, dropped = summary.dropped, elapsed_ms, "pipeline completed");
            }
            Err(e) => {
                *self.state.lock() = PipelineState::Failed;
                self.auditor.record_failure(&self.run_id, e.status(), &e.to_string());
                tracing::error!(pipeline = %self.name, run_id = %self.run_id, status = e.status(), error = %e, elapsed_ms, "pipeline failed");
            }
        }
        result
    }

    async fn execute<W>(&self, output: W) -> Result<RunSummary, PipelineError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let definition = &self.definition;
        let ctx = ExecutionContext::new(format!("{}:{}", self.name, self.run_id));

        let endpoints = Endpoints::new();
        for (name, endpoint) in self.endpoints.iter().chain(definition.endpoints.iter()) {
            endpoints.insert(name.clone(), endpoint.clone());
        }
        let context = SourceContext {
            ctx: ctx.clone(),
            arguments: self.arguments.clone(),
            endpoints,
            buffer: self.engine.source_buffer,
            auditor: self.auditor.clone(),
            run_id: self.run_id.clone(),
        };

        for (i, dynamic) in definition.dynamic_endpoints.iter().enumerate() {
            register_dynamic_endpoints(i, dynamic, &self.catalog, context.clone()).await?;
        }

        let chain = build_chain(&self.catalog, &definition.source, &definition.processors, context).await?;
        let encoder = match self.catalog.encoder(
            &self.format,
            definition.title.as_deref(),
            definition.description.as_deref(),
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                ctx.run_on_context(move || chain.close());
                ctx.flush().await;
                return Err(e);
            }
        };
        let callbacks = EncodedOutput::new(encoder, output, chain.schema.clone(), self.auditor.clone(), self.run_id.as_str());
        let sink = FormattingSink::new(ctx.clone(), Box::new(callbacks));

        *self.state.lock() = PipelineState::Running;
        let graph = Graph::new(self.name.as_str(), ctx, chain, sink);
        let rows = graph.run().await?;
        Ok(RunSummary { run_id: self.run_id.clone(), rows, dropped: graph.dropped() })
    }
}
